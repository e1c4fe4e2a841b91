//! Configuration for shardkv components

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Server configuration, assembled from CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// RocksDB database path
    pub path: PathBuf,

    /// Engine tuning file path (JSON, see [`EngineTuning`])
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<PathBuf>,

    /// Advertised hostname
    #[serde(default = "default_host")]
    pub host: String,

    /// Listening port (0 = chosen by the OS)
    #[serde(default)]
    pub port: u16,

    /// etcd endpoint
    #[serde(default = "default_etcd")]
    pub etcd: String,

    /// Number of serving threads
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Number of initial shards declared on join
    #[serde(default = "default_shards")]
    pub shards: u32,
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_etcd() -> String {
    "localhost:2379".to_string()
}
fn default_threads() -> usize {
    2
}
fn default_shards() -> u32 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./shardkv-data"),
            options: None,
            host: default_host(),
            port: 0,
            etcd: default_etcd(),
            threads: default_threads(),
            shards: default_shards(),
        }
    }
}

/// RocksDB tuning knobs loaded from the `--options` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineTuning {
    /// Background parallelism
    #[serde(default = "default_parallelism")]
    pub parallelism: i32,

    /// Write buffer size in bytes
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,

    /// Optimize for level-style compaction with this memtable budget
    #[serde(default = "default_memtable_budget")]
    pub memtable_memory_budget: usize,
}

fn default_parallelism() -> i32 {
    4
}
fn default_write_buffer_size() -> usize {
    64 * 1024 * 1024
}
fn default_memtable_budget() -> usize {
    512 * 1024 * 1024
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            write_buffer_size: default_write_buffer_size(),
            memtable_memory_budget: default_memtable_budget(),
        }
    }
}

impl EngineTuning {
    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| crate::Error::InvalidConfig(format!("failed to parse options: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_defaults() {
        let tuning = EngineTuning::default();
        assert_eq!(tuning.parallelism, 4);
        assert!(tuning.write_buffer_size > 0);
    }

    #[test]
    fn tuning_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        std::fs::write(&path, r#"{"parallelism": 8}"#).unwrap();

        let tuning = EngineTuning::from_file(&path).unwrap();
        assert_eq!(tuning.parallelism, 8);
        assert_eq!(tuning.write_buffer_size, default_write_buffer_size());
    }

    #[test]
    fn tuning_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(EngineTuning::from_file(&path).is_err());
    }
}
