//! Shard handles and the per-node shard registry
//!
//! A [`Shard`] owns one column family and carries the reference counter
//! that interlocks live writes with ownership handoff. Handlers that
//! mutate the shard must pair a successful [`Shard::acquire`] with
//! [`Shard::release`] on every exit path; the donor side of a migration
//! calls [`Shard::begin_drain`] and then [`Shard::wait_refs`] so that a
//! snapshot is only taken once writes have quiesced.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use rocksdb::{BoundColumnFamily, IngestExternalFileOptions};
use tokio::sync::Notify;

use crate::common::{EngineTuning, Error, Result};
use crate::server::engine::{self, Db};

pub struct Shard {
    id: u32,
    db: Arc<Db>,
    refs: AtomicU32,
    draining: AtomicBool,
    importing: AtomicBool,
    old_address: Mutex<String>,
    largest_key: Mutex<Vec<u8>>,
    drained: Notify,
}

impl Shard {
    fn new(db: Arc<Db>, id: u32) -> Self {
        Self {
            id,
            db,
            refs: AtomicU32::new(0),
            draining: AtomicBool::new(false),
            importing: AtomicBool::new(false),
            old_address: Mutex::new(String::new()),
            largest_key: Mutex::new(Vec::new()),
            drained: Notify::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn cf_name(&self) -> String {
        self.id.to_string()
    }

    fn cf(&self) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(&self.cf_name())
            .ok_or(Error::WrongShard)
    }

    // --- reference discipline ---

    /// Take a write reference. Fails once the shard is draining.
    pub fn acquire(&self) -> bool {
        self.refs.fetch_add(1, Ordering::AcqRel);
        if self.draining.load(Ordering::Acquire) {
            self.release();
            return false;
        }
        true
    }

    /// Drop a write reference taken with [`Shard::acquire`].
    pub fn release(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            // notify_one stores a permit, so the drain cannot miss a
            // release that lands before it starts waiting.
            self.drained.notify_one();
        }
    }

    /// Terminal transition: all subsequent [`Shard::acquire`] calls fail.
    /// Returns false if the shard was already draining (a resumed
    /// migration).
    pub fn begin_drain(&self) -> bool {
        !self.draining.swap(true, Ordering::AcqRel)
    }

    /// Await the reference count reaching zero.
    pub async fn wait_refs(&self) {
        loop {
            if self.refs.load(Ordering::Acquire) == 0 {
                return;
            }
            self.drained.notified().await;
        }
    }

    // --- import state ---

    pub fn importing(&self) -> bool {
        self.importing.load(Ordering::Acquire)
    }

    pub fn set_importing(&self, importing: bool) {
        self.importing.store(importing, Ordering::Release);
    }

    pub fn old_address(&self) -> String {
        self.old_address.lock().unwrap().clone()
    }

    pub fn set_old_address(&self, address: &str) {
        *self.old_address.lock().unwrap() = address.to_string();
    }

    pub fn largest_key(&self) -> Vec<u8> {
        self.largest_key.lock().unwrap().clone()
    }

    pub fn set_largest_key(&self, key: &[u8]) {
        *self.largest_key.lock().unwrap() = key.to_vec();
    }

    // --- column family operations ---

    /// Read a key. The second value asks the caller to forward the read to
    /// the former master: the shard is still importing and the key is
    /// beyond what has been ingested so far.
    pub fn get(&self, key: &[u8]) -> Result<(Option<Vec<u8>>, bool)> {
        if self.importing() && key > self.largest_key().as_slice() {
            return Ok((None, true));
        }
        let value = self.db.get_cf(&self.cf()?, key)?;
        let ask = self.importing() && value.is_none();
        Ok((value, ask))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        Ok(self.db.put_cf(&self.cf()?, key, value)?)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        Ok(self.db.delete_cf(&self.cf()?, key)?)
    }

    /// For keys written at most once since the last delete; cheaper than
    /// a full tombstone.
    pub fn single_delete(&self, key: &[u8]) -> Result<()> {
        Ok(self.db.single_delete_cf(&self.cf()?, key)?)
    }

    pub fn merge(&self, key: &[u8], value: &[u8]) -> Result<()> {
        Ok(self.db.merge_cf(&self.cf()?, key, value)?)
    }

    /// Ingest a finished SST into the column family and advance the
    /// largest-key watermark.
    pub fn ingest(&self, path: &Path, largest_key: &[u8]) -> Result<()> {
        let mut opts = IngestExternalFileOptions::default();
        opts.set_move_files(true);
        self.db
            .ingest_external_file_cf_opts(&self.cf()?, &opts, vec![path.to_path_buf()])?;
        self.set_largest_key(largest_key);
        Ok(())
    }
}

/// Per-node map from shard id to its handle. In-flight requests hold the
/// `Arc<Shard>` observer, which keeps the shard alive even if the registry
/// drops it mid-call.
pub struct Shards {
    db: Arc<Db>,
    tuning: EngineTuning,
    map: RwLock<HashMap<u32, Arc<Shard>>>,
}

impl Shards {
    pub fn new(db: Arc<Db>, tuning: EngineTuning) -> Self {
        Self {
            db,
            tuning,
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn at(&self, id: u32) -> Option<Arc<Shard>> {
        self.map.read().unwrap().get(&id).cloned()
    }

    /// Register a shard, creating its column family if missing.
    pub fn create(&self, id: u32) -> Result<Arc<Shard>> {
        let name = id.to_string();
        if self.db.cf_handle(&name).is_none() {
            self.db.create_cf(&name, &engine::cf_options(&self.tuning))?;
        }
        let shard = Arc::new(Shard::new(self.db.clone(), id));
        self.map.write().unwrap().insert(id, shard.clone());
        Ok(shard)
    }

    /// Register an incoming shard that will be filled by a migration.
    pub fn add_importing(&self, id: u32, old_address: &str) -> Result<Arc<Shard>> {
        let shard = self.create(id)?;
        shard.set_importing(true);
        shard.set_old_address(old_address);
        Ok(shard)
    }

    /// Drop a shard and its column family.
    pub fn remove(&self, id: u32) -> Result<()> {
        self.map.write().unwrap().remove(&id);
        self.db.drop_cf(&id.to_string())?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().unwrap().is_empty()
    }

    /// Column family names of every owned shard, in shard order.
    pub fn cf_names(&self) -> Vec<String> {
        let mut ids: Vec<u32> = self.map.read().unwrap().keys().copied().collect();
        ids.sort_unstable();
        ids.iter().map(|id| id.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::EngineTuning;
    use crate::server::engine::open;

    fn registry() -> (tempfile::TempDir, Arc<Db>, Shards) {
        let dir = tempfile::tempdir().unwrap();
        let tuning = EngineTuning::default();
        let (db, _) = open(dir.path(), &tuning).unwrap();
        let shards = Shards::new(db.clone(), tuning);
        (dir, db, shards)
    }

    #[test]
    fn basic_column_family_ops() {
        let (_dir, _db, shards) = registry();
        let shard = shards.create(0).unwrap();

        shard.put(b"k", b"v").unwrap();
        assert_eq!(shard.get(b"k").unwrap(), (Some(b"v".to_vec()), false));

        shard.delete(b"k").unwrap();
        assert_eq!(shard.get(b"k").unwrap(), (None, false));
    }

    #[test]
    fn refs_fail_once_draining() {
        let (_dir, _db, shards) = registry();
        let shard = shards.create(0).unwrap();

        assert!(shard.acquire());
        assert!(shard.begin_drain());
        // Fresh acquisitions are refused from now on.
        assert!(!shard.acquire());
        // A repeated drain reports that it was already in progress.
        assert!(!shard.begin_drain());
        shard.release();
    }

    #[tokio::test]
    async fn wait_refs_blocks_until_writers_leave() {
        let (_dir, _db, shards) = registry();
        let shard = shards.create(0).unwrap();

        assert!(shard.acquire());
        shard.begin_drain();

        let s = shards.at(0).unwrap();
        let waiter = tokio::spawn(async move { s.wait_refs().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        shard.release();
        waiter.await.unwrap();
    }

    #[test]
    fn importing_reads_ask_the_former_master() {
        let (_dir, _db, shards) = registry();
        let shard = shards.add_importing(0, "donor:1234").unwrap();
        shard.set_largest_key(b"m");

        shard.put(b"a", b"1").unwrap();
        // Ingested region, present locally: answered locally.
        assert_eq!(shard.get(b"a").unwrap(), (Some(b"1".to_vec()), false));
        // Ingested region, absent: could be a donor key we do not have yet.
        assert_eq!(shard.get(b"b").unwrap(), (None, true));
        // Beyond the watermark: not even possibly answerable locally.
        assert_eq!(shard.get(b"z").unwrap(), (None, true));

        shard.set_importing(false);
        assert_eq!(shard.get(b"z").unwrap(), (None, false));
    }

    #[test]
    fn remove_drops_the_column_family() {
        let (_dir, db, shards) = registry();
        let shard = shards.create(5).unwrap();
        shard.put(b"k", b"v").unwrap();

        // An in-flight observer keeps the handle alive past removal.
        let observer = shards.at(5).unwrap();
        shards.remove(5).unwrap();
        assert!(shards.at(5).is_none());
        assert!(shards.is_empty());
        assert_eq!(observer.id(), 5);
        assert!(db.cf_handle("5").is_none());
    }

    #[test]
    fn cf_names_in_shard_order() {
        let (_dir, _db, shards) = registry();
        shards.create(7).unwrap();
        shards.create(2).unwrap();
        shards.create(4).unwrap();
        assert_eq!(shards.cf_names(), vec!["2", "4", "7"]);
    }
}
