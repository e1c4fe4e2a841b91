//! Per-node connection

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{Request, Status, Streaming};

use crate::common::{code, error::WRONG_SHARD};
use crate::proto as pb;
use crate::proto::shard_kv_client::ShardKvClient;

/// Updates per streamed batch buffer.
const BATCH_BUFFER_UPDATES: usize = 1000;

pub type RpcResult<T> = std::result::Result<T, Status>;

pub struct Node {
    address: String,
    client: ShardKvClient<Channel>,
}

impl Node {
    pub async fn connect(address: &str) -> crate::Result<Self> {
        let client = ShardKvClient::connect(format!("http://{}", address)).await?;
        Ok(Self {
            address: address.to_string(),
            client,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn ping(&self) -> RpcResult<()> {
        self.client.clone().ping(pb::Empty {}).await?;
        Ok(())
    }

    pub async fn get(&self, key: &[u8]) -> RpcResult<pb::OpResponse> {
        let req = pb::Key {
            key: key.to_vec(),
            force: false,
        };
        Ok(self.client.clone().get(req).await?.into_inner())
    }

    pub async fn put(&self, key: &[u8], value: &[u8]) -> RpcResult<pb::OpResponse> {
        let req = pb::KeyValue {
            key: key.to_vec(),
            value: value.to_vec(),
        };
        Ok(self.client.clone().put(req).await?.into_inner())
    }

    pub async fn delete(&self, key: &[u8]) -> RpcResult<pb::OpResponse> {
        let req = pb::Key {
            key: key.to_vec(),
            force: false,
        };
        Ok(self.client.clone().delete(req).await?.into_inner())
    }

    pub async fn single_delete(&self, key: &[u8]) -> RpcResult<pb::OpResponse> {
        let req = pb::Key {
            key: key.to_vec(),
            force: false,
        };
        Ok(self.client.clone().single_delete(req).await?.into_inner())
    }

    pub async fn merge(&self, key: &[u8], value: &[u8]) -> RpcResult<pb::OpResponse> {
        let req = pb::KeyValue {
            key: key.to_vec(),
            value: value.to_vec(),
        };
        Ok(self.client.clone().merge(req).await?.into_inner())
    }

    /// Stream one shard's updates and return the commit status. The first
    /// response acknowledges the shard reference; a refused reference
    /// surfaces as the wrong-shard signal.
    pub async fn batch(&self, updates: &[pb::BatchUpdate]) -> RpcResult<pb::OpResponse> {
        if updates.is_empty() {
            return Ok(pb::OpResponse {
                status: code::OK,
                value: Vec::new(),
            });
        }

        let (tx, rx) = mpsc::channel(4);
        let mut stream = self
            .client
            .clone()
            .batch(Request::new(ReceiverStream::new(rx)))
            .await?
            .into_inner();

        for chunk in updates.chunks(BATCH_BUFFER_UPDATES) {
            let buffer = pb::BatchBuffer {
                updates: chunk.to_vec(),
            };
            if tx.send(buffer).await.is_err() {
                break;
            }
        }
        drop(tx);

        let ack = stream
            .message()
            .await?
            .ok_or_else(|| Status::aborted("batch stream closed before the ack"))?;
        if ack.status == code::INVALID_ARGUMENT {
            return Err(Status::invalid_argument(WRONG_SHARD));
        }
        stream
            .message()
            .await?
            .ok_or_else(|| Status::aborted("batch stream closed before the commit status"))
    }

    /// Open an iterator stream over the node's shards.
    pub async fn iterator(
        &self,
    ) -> RpcResult<(
        mpsc::Sender<pb::IteratorRequest>,
        Streaming<pb::IteratorResponse>,
    )> {
        let (tx, rx) = mpsc::channel(4);
        let stream = self
            .client
            .clone()
            .iterator(Request::new(ReceiverStream::new(rx)))
            .await?
            .into_inner();
        Ok((tx, stream))
    }
}
