//! Coordinator client
//!
//! Thin wrapper over the external coordination service: plain gets,
//! conditional puts, and watches over single keys. Two backends: etcd
//! for real clusters, and an in-memory one for tests and single-process
//! clusters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, EventType, Txn, TxnOp};
use tokio::sync::broadcast;

use crate::common::{Error, Result};

/// Key under which the serialized ClusterInfo blob lives.
pub const INFO_KEY: &str = "shardkv/info";

/// Capacity of the in-memory watch channel.
const WATCH_BUFFER: usize = 64;

#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write `value` iff the current value of `key` equals `expected`.
    /// Returns whether the write went through.
    async fn put_if_equals(&self, key: &str, value: Vec<u8>, expected: &[u8]) -> Result<bool>;

    /// Write `value` iff `key` does not exist yet.
    async fn put_if_missing(&self, key: &str, value: Vec<u8>) -> Result<bool>;

    /// Start a watch on `key`. The returned handle yields every value
    /// written after the watch was established.
    async fn watch(&self, key: &str) -> Result<Box<dyn Watch>>;
}

#[async_trait]
pub trait Watch: Send {
    /// Await the next value written under the watched key.
    async fn next(&mut self) -> Result<Vec<u8>>;

    /// Cancel the watch; pending and future `next` calls fail with
    /// [`Error::WatchCanceled`].
    async fn cancel(&mut self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// etcd backend
// ---------------------------------------------------------------------------

/// Coordinator backed by etcd.
#[derive(Clone)]
pub struct EtcdCoordinator {
    client: Client,
}

impl EtcdCoordinator {
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let client = Client::connect([endpoint], None).await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Coordinator for EtcdCoordinator {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let resp = self.client.clone().get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn put_if_equals(&self, key: &str, value: Vec<u8>, expected: &[u8]) -> Result<bool> {
        let txn = Txn::new()
            .when([Compare::value(key, CompareOp::Equal, expected.to_vec())])
            .and_then([TxnOp::put(key, value, None)]);
        let resp = self.client.clone().txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn put_if_missing(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        let txn = Txn::new()
            .when([Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(key, value, None)]);
        let resp = self.client.clone().txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn watch(&self, key: &str) -> Result<Box<dyn Watch>> {
        let (watcher, stream) = self.client.clone().watch(key, None).await?;
        Ok(Box::new(EtcdWatch {
            watcher,
            stream,
            canceled: false,
        }))
    }
}

struct EtcdWatch {
    watcher: etcd_client::Watcher,
    stream: etcd_client::WatchStream,
    canceled: bool,
}

#[async_trait]
impl Watch for EtcdWatch {
    async fn next(&mut self) -> Result<Vec<u8>> {
        if self.canceled {
            return Err(Error::WatchCanceled);
        }
        loop {
            let resp = self
                .stream
                .message()
                .await?
                .ok_or(Error::WatchCanceled)?;
            if resp.canceled() {
                return Err(Error::WatchCanceled);
            }
            for event in resp.events() {
                if event.event_type() == EventType::Put {
                    if let Some(kv) = event.kv() {
                        return Ok(kv.value().to_vec());
                    }
                }
            }
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        self.canceled = true;
        self.watcher.cancel().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// in-memory backend
// ---------------------------------------------------------------------------

/// In-memory coordinator. Every clone shares the same key space, so a
/// multi-node test cluster can run in one process.
#[derive(Clone)]
pub struct MemCoordinator {
    inner: Arc<MemInner>,
}

struct MemInner {
    data: Mutex<HashMap<String, Vec<u8>>>,
    tx: broadcast::Sender<(String, Vec<u8>)>,
}

impl MemCoordinator {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            inner: Arc::new(MemInner {
                data: Mutex::new(HashMap::new()),
                tx,
            }),
        }
    }
}

impl Default for MemCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Coordinator for MemCoordinator {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.data.lock().unwrap().get(key).cloned())
    }

    async fn put_if_equals(&self, key: &str, value: Vec<u8>, expected: &[u8]) -> Result<bool> {
        let mut data = self.inner.data.lock().unwrap();
        match data.get(key) {
            Some(current) if current == expected => {
                data.insert(key.to_string(), value.clone());
                drop(data);
                let _ = self.inner.tx.send((key.to_string(), value));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn put_if_missing(&self, key: &str, value: Vec<u8>) -> Result<bool> {
        let mut data = self.inner.data.lock().unwrap();
        if data.contains_key(key) {
            return Ok(false);
        }
        data.insert(key.to_string(), value.clone());
        drop(data);
        let _ = self.inner.tx.send((key.to_string(), value));
        Ok(true)
    }

    async fn watch(&self, key: &str) -> Result<Box<dyn Watch>> {
        Ok(Box::new(MemWatch {
            key: key.to_string(),
            rx: self.inner.tx.subscribe(),
            canceled: false,
        }))
    }
}

struct MemWatch {
    key: String,
    rx: broadcast::Receiver<(String, Vec<u8>)>,
    canceled: bool,
}

#[async_trait]
impl Watch for MemWatch {
    async fn next(&mut self) -> Result<Vec<u8>> {
        loop {
            if self.canceled {
                return Err(Error::WatchCanceled);
            }
            match self.rx.recv().await {
                Ok((key, value)) if key == self.key => return Ok(value),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(Error::WatchCanceled),
            }
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        self.canceled = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mem_put_if_missing() {
        let coord = MemCoordinator::new();
        assert!(coord.put_if_missing("k", b"v1".to_vec()).await.unwrap());
        assert!(!coord.put_if_missing("k", b"v2".to_vec()).await.unwrap());
        assert_eq!(coord.get("k").await.unwrap().unwrap(), b"v1");
    }

    #[tokio::test]
    async fn mem_put_if_equals() {
        let coord = MemCoordinator::new();
        coord.put_if_missing("k", b"v1".to_vec()).await.unwrap();

        // Mismatched expectation loses
        assert!(!coord
            .put_if_equals("k", b"v2".to_vec(), b"stale")
            .await
            .unwrap());
        // Matching expectation wins
        assert!(coord
            .put_if_equals("k", b"v2".to_vec(), b"v1")
            .await
            .unwrap());
        assert_eq!(coord.get("k").await.unwrap().unwrap(), b"v2");
    }

    #[tokio::test]
    async fn mem_watch_sees_updates() {
        let coord = MemCoordinator::new();
        let mut watch = coord.watch("k").await.unwrap();

        coord.put_if_missing("other", b"x".to_vec()).await.unwrap();
        coord.put_if_missing("k", b"v1".to_vec()).await.unwrap();

        // The unrelated key is skipped
        assert_eq!(watch.next().await.unwrap(), b"v1");

        coord
            .put_if_equals("k", b"v2".to_vec(), b"v1")
            .await
            .unwrap();
        assert_eq!(watch.next().await.unwrap(), b"v2");

        watch.cancel().await.unwrap();
        assert!(watch.next().await.is_err());
    }
}
