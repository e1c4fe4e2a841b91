//! Cluster state and coordination
//!
//! The authoritative cluster state is a single blob in the coordinator,
//! mutated only through compare-and-swap:
//! - [`coordinator`]: thin client for the coordination service (etcd, or
//!   an in-memory backend for tests)
//! - [`info`]: the ClusterInfo model and its replicated state machine

pub mod coordinator;
pub mod info;

pub use coordinator::{Coordinator, EtcdCoordinator, MemCoordinator, Watch, INFO_KEY};
pub use info::{ClusterInfo, Model};
