//! Error types for shardkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Fixed diagnostic carried by the gRPC `InvalidArgument` status that tells
/// a client its ClusterInfo is stale. Distinguishes the routing signal from
/// application-level invalid arguments.
pub const WRONG_SHARD: &str = "not responsible for this shard";

/// Reserved `Unavailable` message: a forwarded read hit a donor that the
/// coordinator still lists but that does not answer.
pub const FORMER_MASTER_CRASHED: &str = "The former master has crashed";

/// Integer status codes carried in `OpResponse.status`. Mirrors the storage
/// engine's own code space so statuses pass through the wire unchanged.
pub mod code {
    pub const OK: i32 = 0;
    pub const NOT_FOUND: i32 = 1;
    pub const CORRUPTION: i32 = 2;
    pub const NOT_SUPPORTED: i32 = 3;
    pub const INVALID_ARGUMENT: i32 = 4;
    pub const IO_ERROR: i32 = 5;
}

#[derive(Error, Debug)]
pub enum Error {
    // === I/O ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Routing ===
    #[error("{WRONG_SHARD}")]
    WrongShard,

    #[error("{FORMER_MASTER_CRASHED}")]
    FormerMasterCrashed,

    #[error("node {0} is unavailable")]
    Unavailable(u32),

    #[error("cluster is unhealthy: shard {0} has no available master")]
    Unhealthy(u32),

    // === Storage ===
    #[error("storage status {0}")]
    Storage(i32),

    #[error("storage engine error: {0}")]
    Engine(#[from] rocksdb::Error),

    // === Cluster state ===
    #[error("another node is listening on {0}")]
    AddressInUse(String),

    #[error("cluster is migrating, try again later")]
    Migrating,

    #[error("cluster info corrupted: {0}")]
    InfoCorrupted(String),

    // === Coordinator ===
    #[error("coordinator error: {0}")]
    Coordinator(String),

    #[error("coordinator watch canceled")]
    WatchCanceled,

    // === Network ===
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    // === Config ===
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this an error the caller recovers from by refreshing ClusterInfo
    /// and retrying?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::WrongShard | Error::Unavailable(_) | Error::Unhealthy(_)
        )
    }

    /// Convert to a gRPC status for RPC responses.
    pub fn to_grpc_status(&self) -> tonic::Status {
        match self {
            Error::WrongShard => tonic::Status::invalid_argument(WRONG_SHARD),
            Error::FormerMasterCrashed => tonic::Status::unavailable(FORMER_MASTER_CRASHED),
            Error::Unavailable(_) => tonic::Status::unavailable(self.to_string()),
            Error::Grpc(status) => status.clone(),
            _ => tonic::Status::internal(self.to_string()),
        }
    }
}

impl From<etcd_client::Error> for Error {
    fn from(e: etcd_client::Error) -> Self {
        Error::Coordinator(e.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::InfoCorrupted(e.to_string())
    }
}

/// Map a storage engine error to its wire status code.
pub fn engine_code(e: &rocksdb::Error) -> i32 {
    use rocksdb::ErrorKind;
    match e.kind() {
        ErrorKind::NotFound => code::NOT_FOUND,
        ErrorKind::Corruption => code::CORRUPTION,
        ErrorKind::NotSupported => code::NOT_SUPPORTED,
        ErrorKind::InvalidArgument => code::INVALID_ARGUMENT,
        ErrorKind::IOError => code::IO_ERROR,
        _ => code::IO_ERROR,
    }
}

/// Turn a wire status code into a `Result`, treating NotFound as a value.
pub fn status_to_result(status: i32) -> Result<bool> {
    match status {
        code::OK => Ok(true),
        code::NOT_FOUND => Ok(false),
        other => Err(Error::Storage(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_shard_maps_to_invalid_argument() {
        let status = Error::WrongShard.to_grpc_status();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(status.message(), WRONG_SHARD);
    }

    #[test]
    fn former_master_message_is_reserved() {
        let status = Error::FormerMasterCrashed.to_grpc_status();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert_eq!(status.message(), FORMER_MASTER_CRASHED);
    }

    #[test]
    fn retryable_classification() {
        assert!(Error::WrongShard.is_retryable());
        assert!(Error::Unavailable(3).is_retryable());
        assert!(!Error::Storage(code::CORRUPTION).is_retryable());
    }

    #[test]
    fn status_codes_round_trip() {
        assert!(status_to_result(code::OK).unwrap());
        assert!(!status_to_result(code::NOT_FOUND).unwrap());
        assert!(status_to_result(code::CORRUPTION).is_err());
    }
}
