//! Client-side write batch
//!
//! Updates are buffered per shard and committed over one Batch stream
//! per shard, each against the shard's current master. A batch never
//! spans shards on the wire; atomicity is per shard.

use std::collections::HashMap;

use tonic::Code;

use crate::client::Cluster;
use crate::common::error::status_to_result;
use crate::common::{Error, Result};
use crate::proto as pb;

pub struct WriteBatch<'a> {
    cluster: &'a Cluster,
    buffers: HashMap<u32, Vec<pb::BatchUpdate>>,
}

impl<'a> WriteBatch<'a> {
    pub(crate) fn new(cluster: &'a Cluster) -> Self {
        Self {
            cluster,
            buffers: HashMap::new(),
        }
    }

    fn push(&mut self, op: pb::batch_update::Op, key: &[u8], value: &[u8]) {
        let shard = self.cluster.info().read(|m| m.shard_for_key(key));
        self.buffers.entry(shard).or_default().push(pb::BatchUpdate {
            op: op as i32,
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.push(pb::batch_update::Op::Put, key, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.push(pb::batch_update::Op::Delete, key, b"");
    }

    pub fn single_delete(&mut self, key: &[u8]) {
        self.push(pb::batch_update::Op::SingleDelete, key, b"");
    }

    pub fn merge(&mut self, key: &[u8], value: &[u8]) {
        self.push(pb::batch_update::Op::Merge, key, value);
    }

    /// Drop everything buffered so far.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Commit every shard's buffer against its master.
    pub async fn write(self) -> Result<()> {
        for (shard, updates) in self.buffers {
            self.cluster.write_shard_batch(shard, &updates).await?;
        }
        Ok(())
    }
}

impl Cluster {
    pub(crate) async fn write_shard_batch(
        &self,
        shard: u32,
        updates: &[pb::BatchUpdate],
    ) -> Result<()> {
        loop {
            let id = self.info().read(|m| m.index_for_shard(shard));
            let result = {
                let mut nodes = self.nodes.lock().await;
                match Self::ensure_connected(self.info(), &mut nodes, id).await {
                    Ok(node) => node.batch(updates).await,
                    Err(status) => Err(status),
                }
            };
            let status = match result {
                Ok(response) => return status_to_result(response.status).map(|_| ()),
                Err(status) => status,
            };
            match status.code() {
                Code::InvalidArgument | Code::Unavailable => {
                    tracing::warn!(id, shard, "batch rejected, refreshing routing");
                    if status.code() == Code::Unavailable {
                        self.nodes.lock().await.remove(&id);
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    self.update().await?;
                    if !self.info().read(|m| m.is_healthy()) {
                        if !self.options.wait_on_unhealthy {
                            return Err(Error::Grpc(status));
                        }
                        self.info().wait_until_healthy().await?;
                        self.update().await?;
                    }
                }
                _ => return Err(Error::Grpc(status)),
            }
        }
    }
}
