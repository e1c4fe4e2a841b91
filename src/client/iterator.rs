//! Merged client-side iterator
//!
//! Every node serves its own shards in key order; the client opens one
//! Iterator stream per node and merges the buffered batches. Direction
//! changes re-seek every stream at the current key, which keeps the
//! per-node state machines simple at the cost of one round trip.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tonic::Streaming;

use crate::client::node::Node;
use crate::client::Cluster;
use crate::common::{code, Error, Result};
use crate::proto as pb;

#[derive(Clone, Copy, PartialEq)]
enum Direction {
    Forward,
    Backward,
}

struct NodeStream {
    tx: mpsc::Sender<pb::IteratorRequest>,
    stream: Streaming<pb::IteratorResponse>,
    buf: VecDeque<pb::KeyValue>,
    done: bool,
}

impl NodeStream {
    async fn request(&mut self, op: pb::iterator_request::Op, target: &[u8]) -> Result<()> {
        self.tx
            .send(pb::IteratorRequest {
                op: op as i32,
                target: target.to_vec(),
            })
            .await
            .map_err(|_| Error::Internal("iterator stream closed".into()))?;
        let response = self
            .stream
            .message()
            .await?
            .ok_or_else(|| Error::Internal("iterator stream closed".into()))?;
        if response.status != code::OK {
            return Err(Error::Storage(response.status));
        }
        self.buf = response.kvs.into();
        self.done = response.done;
        Ok(())
    }

    /// Pull another batch in the given direction if the server has more.
    async fn refill(&mut self, direction: Direction) -> Result<()> {
        if self.done {
            return Ok(());
        }
        let op = match direction {
            Direction::Forward => pb::iterator_request::Op::Next,
            Direction::Backward => pb::iterator_request::Op::Prev,
        };
        self.request(op, b"").await
    }

    fn front(&self) -> Option<&pb::KeyValue> {
        self.buf.front()
    }
}

pub struct ClusterIterator {
    nodes: Vec<NodeStream>,
    direction: Direction,
    current: Option<usize>,
}

impl ClusterIterator {
    pub(crate) async fn open(cluster: &Cluster) -> Result<Self> {
        let addresses = cluster.info().read(|m| m.addresses());
        let mut nodes = Vec::new();
        for address in addresses {
            if address.is_empty() {
                continue;
            }
            let node = Node::connect(&address).await?;
            let (tx, stream) = node.iterator().await.map_err(Error::Grpc)?;
            nodes.push(NodeStream {
                tx,
                stream,
                buf: VecDeque::new(),
                done: true,
            });
        }
        Ok(Self {
            nodes,
            direction: Direction::Forward,
            current: None,
        })
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn key(&self) -> &[u8] {
        self.nodes[self.current.unwrap()]
            .front()
            .map(|kv| kv.key.as_slice())
            .unwrap_or(b"")
    }

    pub fn value(&self) -> &[u8] {
        self.nodes[self.current.unwrap()]
            .front()
            .map(|kv| kv.value.as_slice())
            .unwrap_or(b"")
    }

    pub async fn seek_to_first(&mut self) -> Result<()> {
        self.request_all(pb::iterator_request::Op::SeekToFirst, b"")
            .await?;
        self.direction = Direction::Forward;
        self.pick_smallest();
        Ok(())
    }

    pub async fn seek_to_last(&mut self) -> Result<()> {
        self.request_all(pb::iterator_request::Op::SeekToLast, b"")
            .await?;
        self.direction = Direction::Backward;
        self.pick_largest();
        Ok(())
    }

    pub async fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.request_all(pb::iterator_request::Op::Seek, target).await?;
        self.direction = Direction::Forward;
        self.pick_smallest();
        Ok(())
    }

    pub async fn seek_for_prev(&mut self, target: &[u8]) -> Result<()> {
        self.request_all(pb::iterator_request::Op::SeekForPrev, target)
            .await?;
        self.direction = Direction::Backward;
        self.pick_largest();
        Ok(())
    }

    pub async fn next(&mut self) -> Result<()> {
        let Some(current) = self.current else {
            return Ok(());
        };
        if self.direction == Direction::Backward {
            // Re-seek forward at the current key, then step off it.
            let key = self.key().to_vec();
            self.seek(&key).await?;
            let Some(current) = self.current else {
                return Ok(());
            };
            return self.advance(current).await;
        }
        self.advance(current).await
    }

    pub async fn prev(&mut self) -> Result<()> {
        let Some(current) = self.current else {
            return Ok(());
        };
        if self.direction == Direction::Forward {
            let key = self.key().to_vec();
            self.seek_for_prev(&key).await?;
            let Some(current) = self.current else {
                return Ok(());
            };
            return self.retreat(current).await;
        }
        self.retreat(current).await
    }

    async fn advance(&mut self, current: usize) -> Result<()> {
        self.nodes[current].buf.pop_front();
        if self.nodes[current].buf.is_empty() {
            self.nodes[current].refill(Direction::Forward).await?;
        }
        self.pick_smallest();
        Ok(())
    }

    async fn retreat(&mut self, current: usize) -> Result<()> {
        self.nodes[current].buf.pop_front();
        if self.nodes[current].buf.is_empty() {
            self.nodes[current].refill(Direction::Backward).await?;
        }
        self.pick_largest();
        Ok(())
    }

    async fn request_all(&mut self, op: pb::iterator_request::Op, target: &[u8]) -> Result<()> {
        for node in &mut self.nodes {
            node.request(op, target).await?;
        }
        Ok(())
    }

    fn pick_smallest(&mut self) {
        self.current = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.front().map(|kv| (i, &kv.key)))
            .min_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(i, _)| i);
    }

    fn pick_largest(&mut self) {
        self.current = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.front().map(|kv| (i, &kv.key)))
            .max_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(i, _)| i);
    }
}
