//! # shardkv
//!
//! A distributed, sharded key-value store layered over RocksDB:
//! - one column family per shard, one master node per shard
//! - cluster membership and shard ownership coordinated through etcd
//! - live shard migration (SST dump and ingest) without losing writes
//! - gRPC data plane, client-side routing with retry and failover
//!
//! ## Architecture
//!
//! ```text
//!                ┌──────────────────────────────┐
//!                │            etcd              │
//!                │  single key: ClusterInfo     │
//!                │  (compare-and-swap + watch)  │
//!                └──────┬──────────┬────────────┘
//!                       │          │
//!          ┌────────────┴───┐  ┌───┴────────────┐
//!          │  Node 0        │  │  Node 1        │
//!          │  shards 0-4    │  │  shards 5-9    │
//!          │  RocksDB CFs   │  │  RocksDB CFs   │
//!          └───────▲────────┘  └───────▲────────┘
//!                  │       gRPC       │
//!                  └───────┬──────────┘
//!                          │
//!                   ┌──────┴──────┐
//!                   │   Cluster   │  client: shard_for_key → master
//!                   └─────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a node
//! ```bash
//! shardkv-server --path ./node-data --host 10.0.0.1 --shards 10
//! ```
//!
//! ### Operate the cluster
//! ```bash
//! shardkv-ctl info
//! shardkv-ctl migrate
//! shardkv-ctl put my-key my-value
//! ```

pub mod client;
pub mod cluster;
pub mod common;
pub mod server;

// Re-export commonly used types
pub use client::{Cluster, Options};
pub use common::{Error, Result};
pub use server::Server;

// Generated protobuf code
pub mod proto {
    tonic::include_proto!("shardkv");
}

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
