//! Storage node binary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardkv::cluster::EtcdCoordinator;
use shardkv::common::ServerConfig;
use shardkv::Server;

#[derive(Parser, Debug)]
#[command(name = "shardkv-server")]
#[command(about = "Start a shardkv storage node")]
#[command(version)]
struct Args {
    /// Database path
    #[arg(short, long, default_value = "./shardkv-data")]
    path: PathBuf,

    /// Engine tuning file path (JSON)
    #[arg(short, long)]
    options: Option<PathBuf>,

    /// Node hostname, as announced to the cluster
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,

    /// Listening port (0 = chosen by the OS)
    #[arg(short = 'P', long, default_value = "0")]
    port: u16,

    /// etcd address
    #[arg(short, long, default_value = "localhost:2379")]
    etcd: String,

    /// Number of serving threads
    #[arg(short, long, default_value = "2")]
    threads: usize,

    /// Number of initial shards declared on join
    #[arg(short, long, default_value = "10")]
    shards: u32,

    /// Daemonize process
    #[arg(short, long)]
    daemon: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.daemon {
        daemonize::Daemonize::new().start()?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.threads.max(1))
        .enable_all()
        .build()?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    tracing::info!("starting shardkv node");
    tracing::info!("  db path: {}", args.path.display());
    tracing::info!("  etcd: {}", args.etcd);

    let coordinator = Arc::new(EtcdCoordinator::connect(&args.etcd).await?);
    let config = ServerConfig {
        path: args.path,
        options: args.options,
        host: args.host,
        port: args.port,
        etcd: args.etcd,
        threads: args.threads,
        shards: args.shards,
    };

    Server::new(config).serve(coordinator).await?;
    Ok(())
}
