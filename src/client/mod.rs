//! Cluster client
//!
//! [`Cluster`] keeps one connection per known node, routes every
//! operation by key, and recovers from stale routing and node outages
//! by refreshing ClusterInfo and retrying. Wrong-shard responses mean
//! the local routing table is stale; unavailable peers are probed and,
//! optionally, reported to the coordinator.

pub mod batch;
pub mod iterator;
pub mod node;

pub use batch::WriteBatch;
pub use iterator::ClusterIterator;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tonic::Code;

use crate::cluster::{ClusterInfo, Coordinator};
use crate::common::error::{status_to_result, FORMER_MASTER_CRASHED};
use crate::common::{Error, Result};
use crate::proto as pb;
use node::Node;

/// Delay between routing retries.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Client behavior knobs.
#[derive(Debug, Clone)]
pub struct Options {
    /// Block on an unhealthy cluster instead of surfacing the error.
    pub wait_on_unhealthy: bool,
    /// Report detected peer outages to the coordinator.
    pub inform_on_unavailable: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            wait_on_unhealthy: true,
            inform_on_unavailable: false,
        }
    }
}

enum Op<'a> {
    Get(&'a [u8]),
    Put(&'a [u8], &'a [u8]),
    Delete(&'a [u8]),
    SingleDelete(&'a [u8]),
    Merge(&'a [u8], &'a [u8]),
}

impl Op<'_> {
    fn key(&self) -> &[u8] {
        match self {
            Op::Get(key)
            | Op::Delete(key)
            | Op::SingleDelete(key)
            | Op::Put(key, _)
            | Op::Merge(key, _) => key,
        }
    }
}

pub struct Cluster {
    options: Options,
    info: Arc<ClusterInfo>,
    nodes: Mutex<HashMap<u32, Node>>,
}

impl Cluster {
    /// Connect to the cluster through the coordinator. The first client
    /// of a freshly-initialized cluster transitions it to RUNNING.
    pub async fn connect(coordinator: Arc<dyn Coordinator>, options: Options) -> Result<Self> {
        let info = Arc::new(ClusterInfo::new(coordinator));
        info.refresh().await?;
        info.run().await?;
        Ok(Self {
            options,
            info,
            nodes: Mutex::new(HashMap::new()),
        })
    }

    pub fn info(&self) -> &Arc<ClusterInfo> {
        &self.info
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let response = self.operation(Op::Get(key)).await?;
        if status_to_result(response.status)? {
            Ok(Some(response.value))
        } else {
            Ok(None)
        }
    }

    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let response = self.operation(Op::Put(key, value)).await?;
        status_to_result(response.status).map(|_| ())
    }

    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        let response = self.operation(Op::Delete(key)).await?;
        status_to_result(response.status).map(|_| ())
    }

    pub async fn single_delete(&self, key: &[u8]) -> Result<()> {
        let response = self.operation(Op::SingleDelete(key)).await?;
        status_to_result(response.status).map(|_| ())
    }

    pub async fn merge(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let response = self.operation(Op::Merge(key, value)).await?;
        status_to_result(response.status).map(|_| ())
    }

    /// Start a client-side write batch.
    pub fn batch(&self) -> WriteBatch<'_> {
        WriteBatch::new(self)
    }

    /// Open a merged iterator over the whole keyspace.
    pub async fn iter(&self) -> Result<ClusterIterator> {
        ClusterIterator::open(self).await
    }

    pub async fn wait_until_healthy(&self) -> Result<()> {
        self.info.wait_until_healthy().await
    }

    // --- routing internals ---

    /// Refresh ClusterInfo and drop connections that no longer match.
    pub(crate) async fn update(&self) -> Result<()> {
        self.info.refresh().await?;
        let addresses = self.info.read(|m| m.addresses());
        let mut nodes = self.nodes.lock().await;
        nodes.retain(|&id, node| {
            addresses
                .get(id as usize)
                .is_some_and(|a| a == node.address())
        });
        Ok(())
    }

    async fn disconnect(&self, id: u32) {
        self.nodes.lock().await.remove(&id);
    }

    /// Look up the connection for node `id`, connecting lazily.
    async fn ensure_connected<'a>(
        info: &ClusterInfo,
        nodes: &'a mut HashMap<u32, Node>,
        id: u32,
    ) -> node::RpcResult<&'a Node> {
        if !nodes.contains_key(&id) {
            let address = info.read(|m| m.address(id).to_string());
            if address.is_empty() {
                return Err(tonic::Status::unavailable("node removed"));
            }
            match Node::connect(&address).await {
                Ok(node) => {
                    tracing::info!(id, "new connection");
                    nodes.insert(id, node);
                }
                Err(e) => return Err(tonic::Status::unavailable(e.to_string())),
            }
        }
        Ok(nodes.get(&id).expect("just inserted"))
    }

    async fn dispatch(&self, op: &Op<'_>) -> node::RpcResult<pb::OpResponse> {
        let id = self.info.read(|m| m.index_for_key(op.key()));
        let mut nodes = self.nodes.lock().await;
        let node = Self::ensure_connected(&self.info, &mut nodes, id).await?;
        match op {
            Op::Get(key) => node.get(key).await,
            Op::Put(key, value) => node.put(key, value).await,
            Op::Delete(key) => node.delete(key).await,
            Op::SingleDelete(key) => node.single_delete(key).await,
            Op::Merge(key, value) => node.merge(key, value).await,
        }
    }

    async fn ping(&self, id: u32) -> node::RpcResult<()> {
        let mut nodes = self.nodes.lock().await;
        let node = Self::ensure_connected(&self.info, &mut nodes, id).await?;
        node.ping().await
    }

    /// Routing retry loop: wrong-shard means refresh and re-route;
    /// unavailable means classify (clean shutdown, brief outage, crash)
    /// and recover accordingly.
    async fn operation(&self, op: Op<'_>) -> Result<pb::OpResponse> {
        let mut result = self.dispatch(&op).await;
        loop {
            let status = match result {
                Ok(response) => return Ok(response),
                Err(status) => status,
            };
            match status.code() {
                Code::InvalidArgument => {
                    let id = self.info.read(|m| m.index_for_key(op.key()));
                    tracing::warn!(id, "got wrong-shard, refreshing routing");
                    tokio::time::sleep(RETRY_DELAY).await;
                    self.update().await?;
                }
                Code::Unavailable => {
                    if status.message() == FORMER_MASTER_CRASHED {
                        tracing::warn!("the former master has crashed");
                        tokio::time::sleep(RETRY_DELAY).await;
                        self.update().await?;
                    } else {
                        self.classify_outage(op.key()).await?;
                    }
                    if !self.info.read(|m| m.is_healthy()) {
                        if !self.options.wait_on_unhealthy {
                            return Err(Error::Grpc(status));
                        }
                        tracing::info!("cluster is unhealthy, waiting");
                        self.info.wait_until_healthy().await?;
                        let id = self.info.read(|m| m.index_for_key(op.key()));
                        self.disconnect(id).await;
                        self.update().await?;
                    }
                }
                _ => return Err(Error::Grpc(status)),
            }
            let id = self.info.read(|m| m.index_for_key(op.key()));
            tracing::info!(id, "retrying");
            result = self.dispatch(&op).await;
        }
    }

    /// A peer did not answer. Three possibilities: it shut down cleanly
    /// (a new master is declared), it crashed and came back (ping
    /// succeeds after reconnect), or it is still down (probe while the
    /// cluster is nominally healthy).
    async fn classify_outage(&self, key: &[u8]) -> Result<()> {
        let id = self.info.read(|m| m.index_for_key(key));
        tracing::warn!(id, "got unavailable");
        self.disconnect(id).await;
        tokio::time::sleep(RETRY_DELAY).await;
        self.update().await?;

        if self.info.read(|m| m.index_for_key(key)) != id {
            tracing::info!("a new master is declared, retrying there");
            return Ok(());
        }
        if self.ping(id).await.is_ok() {
            tracing::info!(id, "node is back online");
            return Ok(());
        }
        while self.info.read(|m| m.is_healthy()) {
            let id = self.info.read(|m| m.index_for_key(key));
            tracing::warn!(id, "node crashed but the coordinator is not aware");
            if self.options.inform_on_unavailable {
                tracing::info!(id, "informing the coordinator");
                self.info.set_available(id, false).await?;
            }
            tokio::time::sleep(RETRY_DELAY).await;
            self.disconnect(id).await;
            self.update().await?;
            if self.ping(id).await.is_ok() {
                break;
            }
        }
        Ok(())
    }
}
