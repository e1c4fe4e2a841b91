//! gRPC request handlers
//!
//! Every handler consults ClusterInfo and the shard registry before
//! touching the engine. Mutating handlers take a shard reference and
//! release it on every exit path; a refused reference is reported as the
//! wrong-shard signal so the client refreshes its routing.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

use crate::cluster::ClusterInfo;
use crate::common::error::{engine_code, FORMER_MASTER_CRASHED, WRONG_SHARD};
use crate::common::{code, EngineTuning, Error};
use crate::proto as pb;
use crate::proto::shard_kv_client::ShardKvClient;
use crate::proto::shard_kv_server::ShardKv;
use crate::server::engine::{apply_batch_update, Db};
use crate::server::iterator::{apply_request, MultiIterator};
use crate::server::migrate::ShardMigrator;
use crate::server::shard::{Shard, Shards};

fn wrong_shard() -> Status {
    Status::invalid_argument(WRONG_SHARD)
}

fn ok_response(value: Option<Vec<u8>>) -> pb::OpResponse {
    match value {
        Some(value) => pb::OpResponse {
            status: code::OK,
            value,
        },
        None => pb::OpResponse {
            status: code::NOT_FOUND,
            value: Vec::new(),
        },
    }
}

fn status_response(result: crate::Result<()>) -> Result<Response<pb::OpResponse>, Status> {
    let status = match result {
        Ok(()) => code::OK,
        Err(Error::Engine(e)) => engine_code(&e),
        Err(Error::WrongShard) => return Err(wrong_shard()),
        Err(e) => return Err(e.to_grpc_status()),
    };
    Ok(Response::new(pb::OpResponse {
        status,
        value: Vec::new(),
    }))
}

#[derive(Clone)]
pub struct ShardKvService {
    pub(crate) db: Arc<Db>,
    pub(crate) info: Arc<ClusterInfo>,
    pub(crate) shards: Arc<Shards>,
    pub(crate) tuning: EngineTuning,
    pub(crate) shutdown: CancellationToken,
}

impl ShardKvService {
    /// Look up the shard for a mutating request and take a reference.
    /// Writes are only accepted from the declared master; a shard handle
    /// can exist locally on both sides of a migration before and after
    /// the ownership flip is published.
    fn write_shard(&self, key: &[u8]) -> Result<Arc<Shard>, Status> {
        let shard_id = self.info.read(|m| m.shard_for_key(key));
        let master = self.info.read(|m| m.index_for_shard(shard_id));
        if master != self.info.id() {
            return Err(wrong_shard());
        }
        let shard = self.shards.at(shard_id).ok_or_else(wrong_shard)?;
        if !shard.acquire() {
            return Err(wrong_shard());
        }
        Ok(shard)
    }

    /// Forwarded read against the former master of an importing shard.
    async fn ask_former_master(
        &self,
        shard: &Shard,
        key: Vec<u8>,
    ) -> Result<pb::OpResponse, Status> {
        let old_address = shard.old_address();
        tracing::info!(id = self.info.id(), "asking the former master");

        let forwarded = match ShardKvClient::connect(format!("http://{}", old_address)).await {
            Ok(mut client) => client
                .get(pb::Key {
                    key: key.clone(),
                    force: true,
                })
                .await
                .map(|resp| resp.into_inner()),
            Err(_) => Err(Status::unavailable("connect failed")),
        };

        match forwarded {
            Ok(response) if response.status != code::INVALID_ARGUMENT => {
                return Ok(response);
            }
            Err(status)
                if status.code() == tonic::Code::Unavailable
                    && !old_address.is_empty()
                    && self.info.read(|m| m.addresses().contains(&old_address)) =>
            {
                // The donor is still in the cluster but does not answer.
                tracing::warn!(id = self.info.id(), "the former master crashed");
                return Err(Status::unavailable(FORMER_MASTER_CRASHED));
            }
            Ok(_) | Err(_) => {}
        }

        // The donor finished the migration in the meantime: it either shut
        // down or already dropped the shard. The key must be local by now.
        tracing::info!(id = self.info.id(), "meanwhile importing finished");
        let (value, _) = shard.get(&key).map_err(|e| e.to_grpc_status())?;
        Ok(ok_response(value))
    }
}

#[tonic::async_trait]
impl ShardKv for ShardKvService {
    async fn ping(&self, _request: Request<pb::Empty>) -> Result<Response<pb::Empty>, Status> {
        Ok(Response::new(pb::Empty {}))
    }

    async fn get(&self, request: Request<pb::Key>) -> Result<Response<pb::OpResponse>, Status> {
        let req = request.into_inner();
        let shard_id = self.info.read(|m| m.shard_for_key(&req.key));
        let master = self.info.read(|m| m.index_for_shard(shard_id));
        if master != self.info.id() && !req.force {
            return Err(wrong_shard());
        }
        let shard = self.shards.at(shard_id).ok_or_else(wrong_shard)?;

        let (value, ask) = shard.get(&req.key).map_err(|e| e.to_grpc_status())?;
        if ask {
            let response = self.ask_former_master(&shard, req.key).await?;
            return Ok(Response::new(response));
        }
        Ok(Response::new(ok_response(value)))
    }

    async fn put(
        &self,
        request: Request<pb::KeyValue>,
    ) -> Result<Response<pb::OpResponse>, Status> {
        let req = request.into_inner();
        let shard = self.write_shard(&req.key)?;
        let result = shard.put(&req.key, &req.value);
        shard.release();
        status_response(result)
    }

    async fn delete(&self, request: Request<pb::Key>) -> Result<Response<pb::OpResponse>, Status> {
        let req = request.into_inner();
        let shard = self.write_shard(&req.key)?;
        let result = shard.delete(&req.key);
        shard.release();
        status_response(result)
    }

    async fn single_delete(
        &self,
        request: Request<pb::Key>,
    ) -> Result<Response<pb::OpResponse>, Status> {
        let req = request.into_inner();
        let shard = self.write_shard(&req.key)?;
        let result = shard.single_delete(&req.key);
        shard.release();
        status_response(result)
    }

    async fn merge(
        &self,
        request: Request<pb::KeyValue>,
    ) -> Result<Response<pb::OpResponse>, Status> {
        let req = request.into_inner();
        let shard = self.write_shard(&req.key)?;
        let result = shard.merge(&req.key, &req.value);
        shard.release();
        status_response(result)
    }

    type BatchStream = ReceiverStream<Result<pb::OpResponse, Status>>;

    async fn batch(
        &self,
        request: Request<Streaming<pb::BatchBuffer>>,
    ) -> Result<Response<Self::BatchStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(4);
        let svc = self.clone();

        tokio::spawn(async move {
            let mut shard: Option<Arc<Shard>> = None;
            let mut pinned: Option<u32> = None;
            let mut refused = false;
            let mut updates: Vec<pb::BatchUpdate> = Vec::new();

            loop {
                match inbound.message().await {
                    Ok(Some(buffer)) => {
                        if refused || buffer.updates.is_empty() {
                            continue;
                        }
                        if pinned.is_none() {
                            // The first update fixes the shard for the
                            // whole stream.
                            let sid = svc.info.read(|m| m.shard_for_key(&buffer.updates[0].key));
                            pinned = Some(sid);
                            let master = svc.info.read(|m| m.index_for_shard(sid));
                            match svc.shards.at(sid) {
                                Some(s) if master == svc.info.id() && s.acquire() => {
                                    shard = Some(s);
                                    let ack = pb::OpResponse {
                                        status: code::OK,
                                        value: Vec::new(),
                                    };
                                    if tx.send(Ok(ack)).await.is_err() {
                                        break;
                                    }
                                }
                                _ => {
                                    refused = true;
                                    let ack = pb::OpResponse {
                                        status: code::INVALID_ARGUMENT,
                                        value: Vec::new(),
                                    };
                                    let _ = tx.send(Ok(ack)).await;
                                    continue;
                                }
                            }
                        }
                        let sid = pinned.unwrap_or_default();
                        let crosses = buffer.updates.iter().any(|u| {
                            u.op() != pb::batch_update::Op::Clear
                                && svc.info.read(|m| m.shard_for_key(&u.key)) != sid
                        });
                        if crosses {
                            refused = true;
                            updates.clear();
                            let ack = pb::OpResponse {
                                status: code::INVALID_ARGUMENT,
                                value: Vec::new(),
                            };
                            let _ = tx.send(Ok(ack)).await;
                            continue;
                        }
                        updates.extend(buffer.updates);
                    }
                    Ok(None) => {
                        // Half-close: commit atomically and report.
                        if !refused {
                            if let Some(s) = &shard {
                                let status = commit_batch(&svc.db, s, updates).await;
                                let _ = tx
                                    .send(Ok(pb::OpResponse {
                                        status,
                                        value: Vec::new(),
                                    }))
                                    .await;
                            }
                        }
                        break;
                    }
                    Err(status) => {
                        tracing::warn!(id = svc.info.id(), "batch call cancelled: {}", status);
                        break;
                    }
                }
            }
            if let Some(s) = shard {
                s.release();
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type IteratorStream = ReceiverStream<Result<pb::IteratorResponse, Status>>;

    async fn iterator(
        &self,
        request: Request<Streaming<pb::IteratorRequest>>,
    ) -> Result<Response<Self::IteratorStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(4);
        let (op_tx, op_rx) = std::sync::mpsc::channel::<pb::IteratorRequest>();

        let db = self.db.clone();
        let cf_names = self.shards.cf_names();
        tokio::task::spawn_blocking(move || {
            let mut it = match MultiIterator::new(&db, &cf_names) {
                Ok(it) => it,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e.to_grpc_status()));
                    return;
                }
            };
            while let Ok(req) = op_rx.recv() {
                let response = apply_request(&mut it, &req);
                if tx.blocking_send(Ok(response)).is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Ok(Some(req)) = inbound.message().await {
                if op_tx.send(req).is_err() {
                    break;
                }
            }
            // Dropping op_tx winds down the iterator thread.
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type MigrateStream = ReceiverStream<Result<pb::MigrateResponse, Status>>;

    async fn migrate(
        &self,
        request: Request<Streaming<pb::MigrateRequest>>,
    ) -> Result<Response<Self::MigrateStream>, Status> {
        // The caller identifies itself so a cancelled stream can mark it
        // unavailable.
        let peer_id = request
            .metadata()
            .get("id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok());
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(4);
        let svc = self.clone();

        tokio::spawn(async move {
            if let Err(e) = svc.run_migrate(inbound, tx, peer_id).await {
                // Outside the recoverable taxonomy there is nothing left
                // to do locally.
                tracing::error!(id = svc.info.id(), "migrate handler failed: {}", e);
                std::process::exit(1);
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Build and atomically commit the buffered batch on the blocking pool.
async fn commit_batch(db: &Arc<Db>, shard: &Shard, updates: Vec<pb::BatchUpdate>) -> i32 {
    let db = db.clone();
    let cf_name = shard.cf_name();
    let result = tokio::task::spawn_blocking(move || {
        let Some(cf) = db.cf_handle(&cf_name) else {
            return code::INVALID_ARGUMENT;
        };
        let mut batch = rocksdb::WriteBatch::default();
        for update in &updates {
            apply_batch_update(&mut batch, &cf, update);
        }
        match db.write(batch) {
            Ok(()) => code::OK,
            Err(e) => engine_code(&e),
        }
    })
    .await;
    result.unwrap_or(code::IO_ERROR)
}

impl ShardKvService {
    /// Donor side of a shard migration; see the recipient loop in
    /// [`crate::server::watcher`] for the other half of the protocol.
    async fn run_migrate(
        &self,
        mut inbound: Streaming<pb::MigrateRequest>,
        tx: mpsc::Sender<Result<pb::MigrateResponse, Status>>,
        peer_id: Option<u32>,
    ) -> crate::Result<()> {
        let first = match inbound.message().await {
            Ok(Some(first)) => first,
            _ => return Ok(()),
        };
        let shard_id = first.shard;
        tracing::info!(id = self.info.id(), shard = shard_id, "migrating shard");

        let Some(shard) = self.shards.at(shard_id) else {
            tracing::info!(id = self.info.id(), shard = shard_id, "already given and deleted");
            let _ = tx.send(Err(wrong_shard())).await;
            return Ok(());
        };

        // From now on write requests for the shard are refused.
        let fresh = shard.begin_drain();
        if !fresh {
            tracing::info!(
                id = self.info.id(),
                start_from = first.start_from,
                "resuming interrupted migration"
            );
        }
        self.info.give_shard(shard_id).await?;

        // Inform the recipient that ownership is published.
        if tx.send(Ok(pb::MigrateResponse::default())).await.is_err() {
            return self.migrate_cancelled(peer_id).await;
        }

        // The snapshot is only safe once in-flight writers have finished.
        if fresh {
            shard.wait_refs().await;
        }

        let mut migrator = ShardMigrator::new(self.db.clone(), shard_id, first.start_from)?;
        let tuning = self.tuning.clone();
        let chunk_tx = tx.clone();
        let (migrator, receiver_gone) = tokio::task::spawn_blocking(
            move || -> crate::Result<(ShardMigrator, bool)> {
                migrator.dump(&tuning)?;
                while let Some(response) = migrator.next_chunk()? {
                    if chunk_tx.blocking_send(Ok(response)).is_err() {
                        return Ok((migrator, true));
                    }
                }
                Ok((migrator, false))
            },
        )
        .await
        .map_err(|e| Error::Internal(e.to_string()))??;
        if receiver_gone {
            return self.migrate_cancelled(peer_id).await;
        }

        let finished = pb::MigrateResponse {
            finished: true,
            ..Default::default()
        };
        if tx.send(Ok(finished)).await.is_err() {
            return self.migrate_cancelled(peer_id).await;
        }

        // The terminating request confirms the recipient ingested it all.
        match inbound.message().await {
            Ok(Some(_)) => {
                self.shards.remove(shard_id)?;
                migrator.clear_state()?;
                tracing::info!(id = self.info.id(), shard = shard_id, "shard handed off");
                if self.shards.is_empty() {
                    tracing::info!(id = self.info.id(), "no shards left, leaving the cluster");
                    self.info.remove_self().await?;
                    self.shutdown.cancel();
                }
                Ok(())
            }
            _ => self.migrate_cancelled(peer_id).await,
        }
    }

    async fn migrate_cancelled(&self, peer_id: Option<u32>) -> crate::Result<()> {
        tracing::warn!(id = self.info.id(), "migrate call cancelled");
        if let Some(peer) = peer_id {
            tracing::warn!(id = self.info.id(), peer, "marking peer unavailable");
            self.info.set_available(peer, false).await?;
        }
        Ok(())
    }
}
