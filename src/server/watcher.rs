//! Recipient-side migration loop
//!
//! A dedicated task tails the coordinator watch. Whenever the watched
//! ClusterInfo assigns this node incoming shards, it requests each one
//! from its donor, streams and ingests the SSTs, and publishes the
//! completion. Donor failures mark the donor unavailable and the loop
//! picks the task up again on a later watch event.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;

use crate::cluster::{ClusterInfo, Watch};
use crate::common::{Error, Result};
use crate::proto as pb;
use crate::proto::shard_kv_client::ShardKvClient;
use crate::server::engine::Db;
use crate::server::migrate::ShardImporter;
use crate::server::shard::Shards;

pub struct Watcher {
    pub db: Arc<Db>,
    pub info: Arc<ClusterInfo>,
    pub shards: Arc<Shards>,
    pub shutdown: CancellationToken,
}

enum Attempt {
    Done,
    /// The donor went away; retry on a later watch event.
    Retry,
}

impl Watcher {
    /// Tail the coordinator until shutdown, importing whatever shards the
    /// cluster state assigns to this node.
    pub async fn run(&self) -> Result<()> {
        let mut call = self.info.watch().await?;
        loop {
            self.run_tasks(&mut call).await?;
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = call.cancel().await;
                    return Ok(());
                }
                next = self.info.watch_next(&mut call) => match next {
                    Ok(()) => {}
                    Err(Error::WatchCanceled) => return Ok(()),
                    Err(e) => return Err(e),
                },
            }
        }
    }

    async fn run_tasks(&self, call: &mut Box<dyn Watch>) -> Result<()> {
        let id = self.info.id();
        for (node_id, shard_ids) in self.info.read(|m| m.tasks(id)) {
            let (address, available) = self
                .info
                .read(|m| (m.address(node_id).to_string(), m.is_available(node_id)));
            for shard_id in shard_ids {
                if !available {
                    tracing::warn!(
                        id,
                        node_id,
                        shard_id,
                        "donor is unavailable, skipping request"
                    );
                    continue;
                }
                tracing::info!(id, node_id, shard_id, "requesting shard from donor");
                match self.import_shard(call, shard_id, node_id, &address).await? {
                    Attempt::Done => {}
                    Attempt::Retry => continue,
                }
            }
        }
        Ok(())
    }

    async fn import_shard(
        &self,
        call: &mut Box<dyn Watch>,
        shard_id: u32,
        donor_id: u32,
        donor_address: &str,
    ) -> Result<Attempt> {
        let id = self.info.id();

        // The shard may exist already if we crashed mid-import.
        let shard = match self.shards.at(shard_id) {
            Some(shard) => {
                shard.set_importing(true);
                shard.set_old_address(donor_address);
                shard
            }
            None => self.shards.add_importing(shard_id, donor_address)?,
        };

        let mut importer = ShardImporter::new(self.db.clone(), shard_id)?;
        // Crash recovery may have left a complete SST that was never
        // ingested.
        importer.recover(&shard)?;

        let mut client = match ShardKvClient::connect(format!("http://{}", donor_address)).await {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(id, donor_id, "donor connect failed: {}", e);
                self.info.set_available(donor_id, false).await?;
                return Ok(Attempt::Retry);
            }
        };

        let (tx, rx) = mpsc::channel(4);
        let mut request = Request::new(ReceiverStream::new(rx));
        request
            .metadata_mut()
            .insert("id", id.to_string().parse().expect("numeric metadata"));
        let _ = tx
            .send(pb::MigrateRequest {
                shard: shard_id,
                start_from: importer.num(),
            })
            .await;

        let mut stream = match client.migrate(request).await {
            Ok(response) => response.into_inner(),
            Err(status) => return self.handle_error(status, donor_id).await,
        };

        // The ack confirms the donor published the new master.
        match stream.message().await {
            Ok(Some(_)) => {}
            Ok(None) => return self.handle_error(tonic::Status::unavailable("eof"), donor_id).await,
            Err(status) if status.code() == tonic::Code::InvalidArgument => {
                // The donor dropped the shard but crashed before it could
                // announce the completion. Finish the bookkeeping alone.
                tracing::warn!(id, shard_id, "migration finished but was never announced");
                self.finish_migration(call, &mut importer, shard_id).await?;
                shard.set_importing(false);
                return Ok(Attempt::Done);
            }
            Err(status) => return self.handle_error(status, donor_id).await,
        }

        // Serve the shard only once our own watched state names us master,
        // so a client that sees the new master never finds a node without
        // the shard.
        while self.info.read(|m| m.index_for_shard(shard_id)) != id {
            self.info.watch_next(call).await?;
        }

        loop {
            match stream.message().await {
                Ok(Some(response)) => {
                    if response.finished {
                        break;
                    }
                    if importer.write_chunk(&response)? {
                        importer.ingest_pending(&shard)?;
                    }
                }
                Ok(None) => {
                    return self
                        .handle_error(tonic::Status::unavailable("eof"), donor_id)
                        .await;
                }
                Err(status) => return self.handle_error(status, donor_id).await,
            }
        }

        // Confirm receipt so the donor can drop the shard.
        let _ = tx.send(pb::MigrateRequest::default()).await;
        drop(tx);
        let _ = stream.message().await;

        self.finish_migration(call, &mut importer, shard_id).await?;
        shard.set_importing(false);
        tracing::info!(id, shard_id, "imported shard");
        Ok(Attempt::Done)
    }

    /// Publish the completion and clear local importer state. Both steps
    /// are idempotent, so a crash between them resolves on the next pass.
    async fn finish_migration(
        &self,
        call: &mut Box<dyn Watch>,
        importer: &mut ShardImporter,
        shard_id: u32,
    ) -> Result<()> {
        self.info.migration_over(shard_id).await?;
        importer.clear_state()?;
        while self.info.read(|m| m.shard_is_migrating(shard_id)) {
            self.info.watch_next(call).await?;
        }
        Ok(())
    }

    /// Donor errors: an unavailable peer is recorded in the coordinator
    /// and retried later; anything else is fatal.
    async fn handle_error(&self, status: tonic::Status, donor_id: u32) -> Result<Attempt> {
        if status.code() == tonic::Code::Unavailable {
            tracing::warn!(id = self.info.id(), donor_id, "marking donor unavailable");
            self.info.set_available(donor_id, false).await?;
            return Ok(Attempt::Retry);
        }
        Err(Error::Grpc(status))
    }
}
