//! Control CLI for cluster operations
//!
//! Operational commands issued directly against the coordinator, plus a
//! few data conveniences routed through the client library.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use shardkv::client::node::Node;
use shardkv::cluster::{ClusterInfo, EtcdCoordinator};
use shardkv::{Cluster, Options};

#[derive(Parser)]
#[command(name = "shardkv-ctl")]
#[command(about = "shardkv cluster control")]
#[command(version)]
struct Cli {
    /// etcd address
    #[arg(short, long, default_value = "localhost:2379")]
    etcd: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print cluster info
    Info,

    /// Ping every node and mark unreachable ones unavailable
    Health,

    /// Transition a freshly initialized cluster to RUNNING
    Run,

    /// Trigger a shard rebalance
    Migrate,

    /// Flag a node for eviction; its shards move on the next migrate
    Remove { id: u32 },

    /// Get a key
    Get { key: String },

    /// Put a key
    Put { key: String, value: String },

    /// Delete a key
    Del { key: String },

    /// Print every key
    List,

    /// Print every key-value pair
    Dump,

    /// Delete all keys
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let coordinator = Arc::new(EtcdCoordinator::connect(&cli.etcd).await?);

    match cli.command {
        Commands::Info => {
            let info = ClusterInfo::new(coordinator);
            info.refresh().await?;
            print!("{}", info.snapshot().pretty());
        }

        Commands::Health => {
            let info = ClusterInfo::new(coordinator);
            info.refresh().await?;
            let model = info.snapshot();
            for id in 0..model.num_nodes() {
                let address = model.address(id);
                if address.is_empty() {
                    continue;
                }
                let alive = match Node::connect(address).await {
                    Ok(node) => node.ping().await.is_ok(),
                    Err(_) => false,
                };
                if alive {
                    println!("node {} ({}): ok", id, address);
                } else {
                    println!("node {} ({}): unreachable", id, address);
                    info.set_available(id, false).await?;
                }
            }
            let healthy = info.snapshot().is_healthy();
            println!("healthy: {}", healthy);
        }

        Commands::Run => {
            let info = ClusterInfo::new(coordinator);
            info.run().await?;
            println!("state: RUNNING");
        }

        Commands::Migrate => {
            let info = ClusterInfo::new(coordinator);
            if info.migrate().await? {
                println!("migration started");
            } else {
                println!("There was nothing to migrate");
            }
        }

        Commands::Remove { id } => {
            let info = ClusterInfo::new(coordinator);
            info.mark_remove(id).await?;
            println!("node {} flagged for removal; run `shardkv-ctl migrate`", id);
        }

        Commands::Get { key } => {
            let db = Cluster::connect(coordinator, Options::default()).await?;
            let (shard, node) = db
                .info()
                .read(|m| (m.shard_for_key(key.as_bytes()), m.index_for_key(key.as_bytes())));
            println!("shard:\t{}", shard);
            println!("node:\t{}", node);
            match db.get(key.as_bytes()).await? {
                Some(value) => println!("value:\t{}", String::from_utf8_lossy(&value)),
                None => println!("value:\t(not found)"),
            }
        }

        Commands::Put { key, value } => {
            let db = Cluster::connect(coordinator, Options::default()).await?;
            db.put(key.as_bytes(), value.as_bytes()).await?;
            println!("OK");
        }

        Commands::Del { key } => {
            let db = Cluster::connect(coordinator, Options::default()).await?;
            db.delete(key.as_bytes()).await?;
            println!("OK");
        }

        Commands::List => {
            let db = Cluster::connect(coordinator, Options::default()).await?;
            let mut it = db.iter().await?;
            it.seek_to_first().await?;
            let mut total = 0;
            while it.valid() {
                println!("{}", String::from_utf8_lossy(it.key()));
                total += 1;
                it.next().await?;
            }
            println!("total {}", total);
        }

        Commands::Dump => {
            let db = Cluster::connect(coordinator, Options::default()).await?;
            let mut it = db.iter().await?;
            it.seek_to_first().await?;
            let mut total = 0;
            while it.valid() {
                println!(
                    "{}: {}",
                    String::from_utf8_lossy(it.key()),
                    String::from_utf8_lossy(it.value())
                );
                total += 1;
                it.next().await?;
            }
            println!("total {}", total);
        }

        Commands::Clear => {
            let db = Cluster::connect(coordinator, Options::default()).await?;
            let mut it = db.iter().await?;
            it.seek_to_first().await?;
            let mut batch = db.batch();
            while it.valid() {
                batch.delete(it.key());
                it.next().await?;
            }
            batch.write().await?;
        }
    }

    Ok(())
}
