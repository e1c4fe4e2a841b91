//! Merging iterator over all shard column families on a node
//!
//! Shards partition the keyspace by hash, so a node's global key order is
//! the merge of its per-shard column families. [`MultiIterator`] k-way
//! merges raw engine iterators and supports both directions with the
//! usual re-seek on direction change.

use rocksdb::DBRawIteratorWithThreadMode;

use crate::common::{code, Result};
use crate::proto as pb;
use crate::server::engine::Db;

/// Key-value pairs returned per Iterator RPC response.
pub const ITERATOR_BATCH_SIZE: usize = 10;

#[derive(Clone, Copy, PartialEq)]
enum Direction {
    Forward,
    Backward,
}

pub struct MultiIterator<'a> {
    children: Vec<DBRawIteratorWithThreadMode<'a, Db>>,
    direction: Direction,
    current: Option<usize>,
}

impl<'a> MultiIterator<'a> {
    pub fn new(db: &'a Db, cf_names: &[String]) -> Result<Self> {
        let mut children = Vec::with_capacity(cf_names.len());
        for name in cf_names {
            let cf = db
                .cf_handle(name)
                .ok_or_else(|| crate::Error::Internal(format!("missing column family {}", name)))?;
            children.push(db.raw_iterator_cf(&cf));
        }
        Ok(Self {
            children,
            direction: Direction::Forward,
            current: None,
        })
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn key(&self) -> &[u8] {
        self.children[self.current.unwrap()].key().unwrap_or(b"")
    }

    pub fn value(&self) -> &[u8] {
        self.children[self.current.unwrap()].value().unwrap_or(b"")
    }

    pub fn status_code(&self) -> i32 {
        for child in &self.children {
            if let Err(e) = child.status() {
                return crate::common::error::engine_code(&e);
            }
        }
        code::OK
    }

    pub fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    pub fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.direction = Direction::Backward;
        self.find_largest();
    }

    pub fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    pub fn seek_for_prev(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek_for_prev(target);
        }
        self.direction = Direction::Backward;
        self.find_largest();
    }

    pub fn next(&mut self) {
        let Some(current) = self.current else { return };
        if self.direction == Direction::Backward {
            // The other children sit below the current key; bring them to
            // the first entry above it.
            let key = self.children[current].key().unwrap_or(b"").to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() && child.key() == Some(key.as_slice()) {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }
        self.children[current].next();
        self.find_smallest();
    }

    pub fn prev(&mut self) {
        let Some(current) = self.current else { return };
        if self.direction == Direction::Forward {
            let key = self.children[current].key().unwrap_or(b"").to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek_for_prev(&key);
                if child.valid() && child.key() == Some(key.as_slice()) {
                    child.prev();
                }
            }
            self.direction = Direction::Backward;
        }
        self.children[current].prev();
        self.find_largest();
    }

    fn find_smallest(&mut self) {
        self.current = self
            .children
            .iter()
            .enumerate()
            .filter(|(_, c)| c.valid())
            .min_by(|(_, a), (_, b)| a.key().cmp(&b.key()))
            .map(|(i, _)| i);
    }

    fn find_largest(&mut self) {
        self.current = self
            .children
            .iter()
            .enumerate()
            .filter(|(_, c)| c.valid())
            .max_by(|(_, a), (_, b)| a.key().cmp(&b.key()))
            .map(|(i, _)| i);
    }
}

fn next_batch(it: &mut MultiIterator, response: &mut pb::IteratorResponse) {
    for _ in 0..ITERATOR_BATCH_SIZE {
        if !it.valid() {
            break;
        }
        response.kvs.push(pb::KeyValue {
            key: it.key().to_vec(),
            value: it.value().to_vec(),
        });
        it.next();
    }
    response.done = !it.valid();
    response.status = it.status_code();
}

fn prev_batch(it: &mut MultiIterator, response: &mut pb::IteratorResponse) {
    for _ in 0..ITERATOR_BATCH_SIZE {
        if !it.valid() {
            break;
        }
        response.kvs.push(pb::KeyValue {
            key: it.key().to_vec(),
            value: it.value().to_vec(),
        });
        it.prev();
    }
    response.done = !it.valid();
    response.status = it.status_code();
}

/// Apply one wire request and collect up to [`ITERATOR_BATCH_SIZE`] pairs
/// in the direction implied by the last seek.
pub fn apply_request(it: &mut MultiIterator, request: &pb::IteratorRequest) -> pb::IteratorResponse {
    use pb::iterator_request::Op;
    let mut response = pb::IteratorResponse::default();
    match request.op() {
        Op::SeekToFirst => {
            it.seek_to_first();
            next_batch(it, &mut response);
        }
        Op::SeekToLast => {
            it.seek_to_last();
            prev_batch(it, &mut response);
        }
        Op::Seek => {
            it.seek(&request.target);
            next_batch(it, &mut response);
        }
        Op::SeekForPrev => {
            it.seek_for_prev(&request.target);
            prev_batch(it, &mut response);
        }
        Op::Next => next_batch(it, &mut response),
        Op::Prev => prev_batch(it, &mut response),
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::EngineTuning;
    use crate::server::engine::{cf_options, open};

    fn db_with_keys() -> (tempfile::TempDir, std::sync::Arc<Db>, Vec<String>) {
        let dir = tempfile::tempdir().unwrap();
        let tuning = EngineTuning::default();
        let (db, _) = open(dir.path(), &tuning).unwrap();
        for name in ["0", "1", "2"] {
            db.create_cf(name, &cf_options(&tuning)).unwrap();
        }
        // Spread interleaved keys over the three families.
        for (i, key) in ["a", "b", "c", "d", "e", "f"].iter().enumerate() {
            let cf = db.cf_handle(&(i % 3).to_string()).unwrap();
            db.put_cf(&cf, key.as_bytes(), key.to_uppercase().as_bytes())
                .unwrap();
        }
        let names = vec!["0".to_string(), "1".to_string(), "2".to_string()];
        (dir, db, names)
    }

    fn collect_forward(it: &mut MultiIterator) -> Vec<String> {
        let mut keys = Vec::new();
        while it.valid() {
            keys.push(String::from_utf8(it.key().to_vec()).unwrap());
            it.next();
        }
        keys
    }

    #[test]
    fn merges_in_global_key_order() {
        let (_dir, db, names) = db_with_keys();
        let mut it = MultiIterator::new(&db, &names).unwrap();
        it.seek_to_first();
        assert_eq!(collect_forward(&mut it), vec!["a", "b", "c", "d", "e", "f"]);
    }

    #[test]
    fn seek_lands_on_the_next_key() {
        let (_dir, db, names) = db_with_keys();
        let mut it = MultiIterator::new(&db, &names).unwrap();
        it.seek(b"c");
        assert_eq!(it.key(), b"c");
        it.seek(b"cc");
        assert_eq!(it.key(), b"d");
    }

    #[test]
    fn reverse_iteration() {
        let (_dir, db, names) = db_with_keys();
        let mut it = MultiIterator::new(&db, &names).unwrap();
        it.seek_to_last();
        let mut keys = Vec::new();
        while it.valid() {
            keys.push(String::from_utf8(it.key().to_vec()).unwrap());
            it.prev();
        }
        assert_eq!(keys, vec!["f", "e", "d", "c", "b", "a"]);
    }

    #[test]
    fn direction_switch_mid_stream() {
        let (_dir, db, names) = db_with_keys();
        let mut it = MultiIterator::new(&db, &names).unwrap();
        it.seek(b"c");
        it.next();
        assert_eq!(it.key(), b"d");
        it.prev();
        assert_eq!(it.key(), b"c");
        it.prev();
        assert_eq!(it.key(), b"b");
        it.next();
        assert_eq!(it.key(), b"c");
    }

    #[test]
    fn responses_are_paced() {
        let dir = tempfile::tempdir().unwrap();
        let tuning = EngineTuning::default();
        let (db, _) = open(dir.path(), &tuning).unwrap();
        db.create_cf("0", &cf_options(&tuning)).unwrap();
        let cf = db.cf_handle("0").unwrap();
        for i in 0..25 {
            db.put_cf(&cf, format!("key{:02}", i), b"v").unwrap();
        }
        drop(cf);

        let names = vec!["0".to_string()];
        let mut it = MultiIterator::new(&db, &names).unwrap();
        let first = apply_request(
            &mut it,
            &pb::IteratorRequest {
                op: pb::iterator_request::Op::SeekToFirst as i32,
                target: vec![],
            },
        );
        assert_eq!(first.kvs.len(), ITERATOR_BATCH_SIZE);
        assert!(!first.done);

        let next = pb::IteratorRequest {
            op: pb::iterator_request::Op::Next as i32,
            target: vec![],
        };
        let second = apply_request(&mut it, &next);
        assert_eq!(second.kvs.len(), ITERATOR_BATCH_SIZE);
        let third = apply_request(&mut it, &next);
        assert_eq!(third.kvs.len(), 5);
        assert!(third.done);
    }
}
