//! Storage node
//!
//! Bootstraps a node: bind the listener, announce the address to the
//! cluster, open the database (recovering column families after a
//! crash), start the coordinator watcher and serve the gRPC surface
//! until shutdown.

pub mod engine;
pub mod iterator;
pub mod migrate;
pub mod service;
pub mod shard;
pub mod watcher;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterInfo, Coordinator};
use crate::common::{EngineTuning, Error, Result, ServerConfig};
use crate::proto::shard_kv_server::ShardKvServer;
use crate::server::service::ShardKvService;
use crate::server::shard::Shards;
use crate::server::watcher::Watcher;

pub struct Server {
    config: ServerConfig,
}

/// A started node: the advertised address plus the handles needed to wait
/// for or force its shutdown.
pub struct Running {
    pub address: String,
    pub id: u32,
    pub shutdown: CancellationToken,
    serve_task: JoinHandle<Result<()>>,
    watcher_task: JoinHandle<Result<()>>,
    shards: Arc<Shards>,
    path: std::path::PathBuf,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Start the node and return once it is serving.
    pub async fn start(self, coordinator: Arc<dyn Coordinator>) -> Result<Running> {
        let config = self.config;
        let tuning = match &config.options {
            Some(path) => EngineTuning::from_file(path)?,
            None => EngineTuning::default(),
        };

        // Bind first so an OS-chosen port can be announced.
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        let port = listener.local_addr()?.port();
        let address = format!("{}:{}", config.host, port);

        let info = Arc::new(ClusterInfo::new(coordinator));
        let id = info.add(&address, config.shards).await?;

        let (db, recovered) = engine::open(&config.path, &tuning)?;
        let shards = Arc::new(Shards::new(db.clone(), tuning.clone()));
        if recovered.is_empty() {
            for shard_id in info.read(|m| m.shards_of(id)) {
                shards.create(shard_id)?;
            }
        } else {
            tracing::info!(id, "recovering from crash");
            for shard_id in recovered {
                shards.create(shard_id)?;
            }
        }

        // Shards assigned but not yet imported pick their import state
        // back up before any request can touch them.
        for (donor, shard_ids) in info.read(|m| m.tasks(id)) {
            let donor_address = info.read(|m| m.address(donor).to_string());
            for shard_id in shard_ids {
                if let Some(shard) = shards.at(shard_id) {
                    shard.set_importing(true);
                    shard.set_old_address(&donor_address);
                    if let Some(largest) = migrate::load_largest_key(&db, shard_id)? {
                        shard.set_largest_key(&largest);
                    }
                }
            }
        }

        let shutdown = CancellationToken::new();
        let service = ShardKvService {
            db: db.clone(),
            info: info.clone(),
            shards: shards.clone(),
            tuning,
            shutdown: shutdown.clone(),
        };

        let watcher = Watcher {
            db,
            info: info.clone(),
            shards: shards.clone(),
            shutdown: shutdown.clone(),
        };
        let watcher_task = tokio::spawn(async move { watcher.run().await });

        let signal = shutdown.clone();
        let serve_task = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(ShardKvServer::new(service))
                .serve_with_incoming_shutdown(
                    TcpListenerStream::new(listener),
                    signal.cancelled_owned(),
                )
                .await
                .map_err(Error::from)
        });

        info.set_available(id, true).await?;
        tracing::info!(id, %address, "server listening");

        Ok(Running {
            address,
            id,
            shutdown,
            serve_task,
            watcher_task,
            shards,
            path: config.path,
        })
    }

    /// Start the node and block until it shuts down.
    pub async fn serve(self, coordinator: Arc<dyn Coordinator>) -> Result<()> {
        let running = self.start(coordinator).await?;
        let shutdown = running.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down");
                shutdown.cancel();
            }
        });
        running.wait().await
    }
}

impl Running {
    /// Request shutdown and wait for the node to wind down.
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.wait().await
    }

    /// Wait for shutdown. The watcher is joined before the engine is torn
    /// down; an emptied-out donor deletes its database on the way out.
    pub async fn wait(self) -> Result<()> {
        let serve = self
            .serve_task
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        self.shutdown.cancel();
        let watch = self
            .watcher_task
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        serve?;
        watch?;

        if self.shards.is_empty() {
            drop(self.shards);
            if let Err(e) = engine::Db::destroy(&rocksdb::Options::default(), &self.path) {
                tracing::warn!("could not clean up data directory: {}", e);
            }
        }
        Ok(())
    }
}
