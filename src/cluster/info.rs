//! Cluster state model and its replicated state machine
//!
//! [`Model`] is the deserialized ClusterInfo blob: the node table, the
//! shard→master map, and the lifecycle state. [`ClusterInfo`] wraps a
//! model behind a reader-writer lock together with a coordinator client;
//! every mutating method reads the current blob, mutates a copy in
//! memory and attempts a compare-and-swap, retrying on mismatch. This is
//! the only write path to cluster state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use prost::Message;

use crate::cluster::coordinator::{Coordinator, Watch, INFO_KEY};
use crate::common::{shard_for_key, Error, Result};
use crate::proto as pb;

/// Sentinel for "this handle never joined the cluster" (pure clients).
const NO_ID: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// In-memory cluster state, mirroring the coordinator blob.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Model {
    inner: pb::ClusterInfo,
}

impl Model {
    pub fn parse(blob: &[u8]) -> Result<Self> {
        Ok(Self {
            inner: pb::ClusterInfo::decode(blob)?,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.inner.encode_to_vec()
    }

    pub fn is_init(&self) -> bool {
        self.inner.state() == pb::ClusterState::Init
    }

    pub fn is_running(&self) -> bool {
        self.inner.state() == pb::ClusterState::Running
    }

    pub fn is_migrating(&self) -> bool {
        self.inner.state() == pb::ClusterState::Migrating
    }

    pub fn num_nodes(&self) -> u32 {
        self.inner.nodes.len() as u32
    }

    pub fn num_shards(&self) -> u32 {
        self.inner.shards.len() as u32
    }

    pub fn address(&self, id: u32) -> &str {
        &self.inner.nodes[id as usize].address
    }

    pub fn addresses(&self) -> Vec<String> {
        self.inner.nodes.iter().map(|n| n.address.clone()).collect()
    }

    pub fn is_available(&self, id: u32) -> bool {
        self.inner.nodes[id as usize].available
    }

    pub fn is_removed(&self, id: u32) -> bool {
        self.inner.nodes[id as usize].remove
    }

    pub fn index_of(&self, address: &str) -> Option<u32> {
        self.inner
            .nodes
            .iter()
            .position(|n| n.address == address)
            .map(|i| i as u32)
    }

    pub fn shard_for_key(&self, key: &[u8]) -> u32 {
        debug_assert!(!self.inner.shards.is_empty());
        shard_for_key(key, self.num_shards().max(1))
    }

    pub fn index_for_shard(&self, shard: u32) -> u32 {
        self.inner.shards[shard as usize].master
    }

    pub fn index_for_key(&self, key: &[u8]) -> u32 {
        self.index_for_shard(self.shard_for_key(key))
    }

    pub fn shard_is_migrating(&self, shard: u32) -> bool {
        self.inner.shards[shard as usize].migrating
    }

    /// Shards currently mastered by `id`.
    pub fn shards_of(&self, id: u32) -> Vec<u32> {
        self.inner
            .shards
            .iter()
            .enumerate()
            .filter(|(_, s)| s.master == id)
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Shards in flight towards `id`.
    pub fn future_of(&self, id: u32) -> Vec<u32> {
        self.inner
            .shards
            .iter()
            .enumerate()
            .filter(|(_, s)| s.migrating && s.to == id)
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Shards `id` must request from other nodes, grouped by donor.
    pub fn tasks(&self, id: u32) -> HashMap<u32, Vec<u32>> {
        let mut tasks: HashMap<u32, Vec<u32>> = HashMap::new();
        for (sid, s) in self.inner.shards.iter().enumerate() {
            if s.migrating && s.to == id {
                tasks.entry(s.from).or_default().push(sid as u32);
            }
        }
        tasks
    }

    /// Every shard is owned by a live, available node.
    pub fn is_healthy(&self) -> bool {
        self.inner.shards.iter().all(|s| {
            let node = &self.inner.nodes[s.master as usize];
            !node.address.is_empty() && node.available
        })
    }

    pub fn no_migrations(&self) -> bool {
        self.inner.shards.iter().all(|s| !s.migrating)
    }

    // --- mutations (applied in memory; persisted by the CAS loop) ---

    fn add_node_with_new_shards(&mut self, address: &str, num_shards: u32) -> u32 {
        let id = self.inner.nodes.len() as u32;
        self.inner.nodes.push(pb::NodeInfo {
            address: address.to_string(),
            num_shards,
            available: false,
            remove: false,
        });
        for _ in 0..num_shards {
            self.inner.shards.push(pb::ShardInfo {
                master: id,
                migrating: false,
                from: 0,
                to: 0,
            });
        }
        id
    }

    fn add_node(&mut self, address: &str) -> u32 {
        let id = self.inner.nodes.len() as u32;
        self.inner.nodes.push(pb::NodeInfo {
            address: address.to_string(),
            num_shards: 0,
            available: false,
            remove: false,
        });
        id
    }

    fn remove_node(&mut self, id: u32) {
        let node = &mut self.inner.nodes[id as usize];
        node.address.clear();
        node.available = false;
        node.remove = false;
    }

    fn mark_remove(&mut self, id: u32) {
        self.inner.nodes[id as usize].remove = true;
    }

    fn set_running(&mut self) {
        self.inner.set_state(pb::ClusterState::Running);
    }

    fn set_migrating(&mut self) {
        self.inner.set_state(pb::ClusterState::Migrating);
    }

    fn set_available(&mut self, id: u32, available: bool) {
        self.inner.nodes[id as usize].available = available;
    }

    /// Spread shards as evenly as possible over the live target nodes
    /// (available, not flagged for removal). Quotas follow the largest
    /// remainder: everyone gets `floor(n/k)`, and the `n % k` leftovers go
    /// to the nodes already holding the most shards so that as few shards
    /// as possible move. Shards whose master is not a target all move.
    fn redistribute(&mut self) {
        let targets: Vec<u32> = self
            .inner
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.address.is_empty() && n.available && !n.remove)
            .map(|(i, _)| i as u32)
            .collect();
        if targets.is_empty() {
            return;
        }

        let n = self.inner.shards.len();
        let k = targets.len();
        let base = n / k;
        let rem = n % k;

        let mut count: HashMap<u32, usize> = targets.iter().map(|&t| (t, 0)).collect();
        for s in &self.inner.shards {
            if let Some(c) = count.get_mut(&s.master) {
                *c += 1;
            }
        }

        let mut order = targets.clone();
        order.sort_by(|a, b| count[b].cmp(&count[a]).then(a.cmp(b)));
        let mut quota: HashMap<u32, usize> = targets.iter().map(|&t| (t, base)).collect();
        for &t in order.iter().take(rem) {
            *quota.get_mut(&t).unwrap() += 1;
        }

        // First pass: keep shards in place up to their master's quota.
        let mut kept: HashMap<u32, usize> = targets.iter().map(|&t| (t, 0)).collect();
        let mut moving: Vec<usize> = Vec::new();
        for (sid, s) in self.inner.shards.iter().enumerate() {
            match kept.get_mut(&s.master) {
                Some(c) if *c < quota[&s.master] => *c += 1,
                _ => moving.push(sid),
            }
        }

        // Second pass: hand the surplus to nodes below quota.
        let mut moving = moving.into_iter();
        for &t in &targets {
            while kept[&t] < quota[&t] {
                let Some(sid) = moving.next() else { return };
                let s = &mut self.inner.shards[sid];
                s.migrating = true;
                s.from = s.master;
                s.to = t;
                *kept.get_mut(&t).unwrap() += 1;
            }
        }
    }

    fn give_shard(&mut self, id: u32, shard: u32) {
        let s = &mut self.inner.shards[shard as usize];
        debug_assert!(s.migrating && s.from == id);
        s.master = s.to;
    }

    fn migration_over(&mut self, shard: u32) {
        let s = &mut self.inner.shards[shard as usize];
        s.migrating = false;
        s.from = 0;
        s.to = 0;
        if self.no_migrations() {
            self.set_running();
        }
    }

    /// Human-readable cluster summary for the control CLI.
    pub fn pretty(&self) -> String {
        use std::fmt::Write;

        let state = match self.inner.state() {
            pb::ClusterState::Init => "INIT",
            pb::ClusterState::Running => "RUNNING",
            pb::ClusterState::Migrating => "MIGRATING",
        };
        let mut out = String::new();
        writeln!(out, "state: {}", state).unwrap();
        writeln!(out, "nodes: {}", self.num_nodes()).unwrap();
        writeln!(out, "shards: {}", self.num_shards()).unwrap();
        for id in 0..self.num_nodes() {
            if self.address(id).is_empty() {
                continue;
            }
            writeln!(out, "node {}:", id).unwrap();
            writeln!(out, "  address: {}", self.address(id)).unwrap();
            let shards = self.shards_of(id);
            if !shards.is_empty() {
                writeln!(out, "  shards: {} ({})", ranges(&shards), shards.len()).unwrap();
            }
            let future = self.future_of(id);
            if !future.is_empty() {
                writeln!(out, "  future: {} ({})", ranges(&future), future.len()).unwrap();
            }
            if !self.is_available(id) {
                writeln!(out, "  available: false").unwrap();
            }
            if self.is_removed(id) {
                writeln!(out, "  remove: true").unwrap();
            }
        }
        out
    }
}

/// Compact a sorted id list into a comma-separated list of inclusive
/// ranges, e.g. `[1,2,3,5,7,8,9]` → `"1-3,5,7-9"`.
fn ranges(list: &[u32]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < list.len() {
        let start = list[i];
        let mut end = start;
        while i + 1 < list.len() && list[i + 1] == end + 1 {
            i += 1;
            end = list[i];
        }
        if !out.is_empty() {
            out.push(',');
        }
        if start == end {
            out.push_str(&start.to_string());
        } else {
            out.push_str(&format!("{}-{}", start, end));
        }
        i += 1;
    }
    out
}

// ---------------------------------------------------------------------------
// ClusterInfo
// ---------------------------------------------------------------------------

/// Shared handle on the cluster state: a local model refreshed from the
/// coordinator, plus the CAS mutation loops.
pub struct ClusterInfo {
    coordinator: Arc<dyn Coordinator>,
    model: RwLock<Model>,
    id: AtomicU32,
}

impl ClusterInfo {
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            coordinator,
            model: RwLock::new(Model::default()),
            id: AtomicU32::new(NO_ID),
        }
    }

    /// This node's id. Meaningless before [`ClusterInfo::add`] succeeded.
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    /// Run a closure against the current local model.
    pub fn read<R>(&self, f: impl FnOnce(&Model) -> R) -> R {
        f(&self.model.read().unwrap())
    }

    /// Snapshot the current local model.
    pub fn snapshot(&self) -> Model {
        self.model.read().unwrap().clone()
    }

    /// Re-read the blob from the coordinator into the local model.
    pub async fn refresh(&self) -> Result<()> {
        let blob = self
            .coordinator
            .get(INFO_KEY)
            .await?
            .ok_or_else(|| Error::Coordinator("cluster is not initialized".into()))?;
        *self.model.write().unwrap() = Model::parse(&blob)?;
        Ok(())
    }

    /// Join the cluster, returning this node's id.
    ///
    /// At INIT the declared shards are appended to the cluster; at RUNNING
    /// an empty slot is appended and the operator migrates later; at
    /// MIGRATING admission is refused. If `address` is already present and
    /// unavailable, the join is a crash recovery and the old id (and its
    /// shard assignment) is reused.
    pub async fn add(&self, address: &str, num_shards: u32) -> Result<u32> {
        loop {
            match self.coordinator.get(INFO_KEY).await? {
                Some(old) => {
                    let mut model = Model::parse(&old)?;
                    let id = if let Some(id) = model.index_of(address) {
                        if model.is_available(id) {
                            return Err(Error::AddressInUse(address.to_string()));
                        }
                        id
                    } else if model.is_init() {
                        model.add_node_with_new_shards(address, num_shards)
                    } else if model.is_running() {
                        model.add_node(address)
                    } else {
                        return Err(Error::Migrating);
                    };
                    if self
                        .coordinator
                        .put_if_equals(INFO_KEY, model.serialize(), &old)
                        .await?
                    {
                        self.id.store(id, Ordering::Relaxed);
                        *self.model.write().unwrap() = model;
                        return Ok(id);
                    }
                }
                None => {
                    let mut model = Model::default();
                    let id = model.add_node_with_new_shards(address, num_shards);
                    if self
                        .coordinator
                        .put_if_missing(INFO_KEY, model.serialize())
                        .await?
                    {
                        self.id.store(id, Ordering::Relaxed);
                        *self.model.write().unwrap() = model;
                        return Ok(id);
                    }
                }
            }
        }
    }

    /// Read-modify-CAS loop shared by every mutation below. The closure
    /// returns false to bail out without writing.
    async fn mutate(&self, mut f: impl FnMut(&mut Model) -> Result<bool>) -> Result<()> {
        loop {
            let old = self
                .coordinator
                .get(INFO_KEY)
                .await?
                .ok_or_else(|| Error::Coordinator("cluster is not initialized".into()))?;
            let mut model = Model::parse(&old)?;
            if !f(&mut model)? {
                *self.model.write().unwrap() = model;
                return Ok(());
            }
            let new = model.serialize();
            if self.coordinator.put_if_equals(INFO_KEY, new, &old).await? {
                *self.model.write().unwrap() = model;
                return Ok(());
            }
        }
    }

    /// Transition INIT → RUNNING. Idempotent; refuses nothing.
    pub async fn run(&self) -> Result<()> {
        self.mutate(|m| {
            if m.is_running() || !m.no_migrations() {
                return Ok(false);
            }
            m.set_running();
            Ok(true)
        })
        .await
    }

    /// Operator-initiated rebalance. Returns whether anything moves.
    pub async fn migrate(&self) -> Result<bool> {
        let mut moved = false;
        self.mutate(|m| {
            if m.is_migrating() {
                return Err(Error::Migrating);
            }
            m.redistribute();
            if m.no_migrations() {
                moved = false;
                return Ok(false);
            }
            m.set_migrating();
            moved = true;
            Ok(true)
        })
        .await?;
        Ok(moved)
    }

    /// Donor handoff: atomically publish `master := to` for `shard`.
    pub async fn give_shard(&self, shard: u32) -> Result<()> {
        let id = self.id();
        self.mutate(|m| {
            m.give_shard(id, shard);
            Ok(true)
        })
        .await
    }

    /// Recipient finalization: clear the migration fields of `shard`.
    pub async fn migration_over(&self, shard: u32) -> Result<()> {
        self.mutate(|m| {
            m.migration_over(shard);
            Ok(true)
        })
        .await
    }

    /// Flag `id` for eviction; its shards move on the next migrate.
    pub async fn mark_remove(&self, id: u32) -> Result<()> {
        self.mutate(|m| {
            if m.is_migrating() {
                return Err(Error::Migrating);
            }
            m.mark_remove(id);
            Ok(true)
        })
        .await
    }

    /// Clean decommission: clear this node's slot.
    pub async fn remove_self(&self) -> Result<()> {
        let id = self.id();
        self.mutate(|m| {
            m.remove_node(id);
            Ok(true)
        })
        .await
    }

    pub async fn set_available(&self, id: u32, available: bool) -> Result<()> {
        self.mutate(|m| {
            if m.is_available(id) == available {
                return Ok(false);
            }
            m.set_available(id, available);
            Ok(true)
        })
        .await
    }

    /// Start a watch on the info key, priming the local model first.
    pub async fn watch(&self) -> Result<Box<dyn Watch>> {
        let call = self.coordinator.watch(INFO_KEY).await?;
        self.refresh().await?;
        Ok(call)
    }

    /// Await the next blob from a watch and fold it into the local model.
    pub async fn watch_next(&self, call: &mut Box<dyn Watch>) -> Result<()> {
        let blob = call.next().await?;
        *self.model.write().unwrap() = Model::parse(&blob)?;
        Ok(())
    }

    /// Block until every shard has an available master.
    pub async fn wait_until_healthy(&self) -> Result<()> {
        let mut call = self.watch().await?;
        while !self.read(|m| m.is_healthy()) {
            self.watch_next(&mut call).await?;
        }
        call.cancel().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::coordinator::MemCoordinator;

    fn harness() -> (Arc<MemCoordinator>, ClusterInfo) {
        let coord = Arc::new(MemCoordinator::new());
        let info = ClusterInfo::new(coord.clone());
        (coord, info)
    }

    #[tokio::test]
    async fn first_join_seeds_the_cluster() {
        let (_, info) = harness();
        let id = info.add("host0:4000", 10).await.unwrap();
        assert_eq!(id, 0);
        let m = info.snapshot();
        assert!(m.is_init());
        assert_eq!(m.num_shards(), 10);
        assert_eq!(m.shards_of(0).len(), 10);
    }

    #[tokio::test]
    async fn init_joins_append_shards() {
        let (coord, info) = harness();
        info.add("host0:4000", 4).await.unwrap();

        let other = ClusterInfo::new(coord);
        let id = other.add("host1:4000", 6).await.unwrap();
        assert_eq!(id, 1);
        let m = other.snapshot();
        assert_eq!(m.num_shards(), 10);
        assert_eq!(m.shards_of(0), vec![0, 1, 2, 3]);
        assert_eq!(m.shards_of(1), vec![4, 5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn running_join_appends_empty_slot() {
        let (coord, info) = harness();
        info.add("host0:4000", 10).await.unwrap();
        info.run().await.unwrap();

        let other = ClusterInfo::new(coord);
        let id = other.add("host1:4000", 10).await.unwrap();
        assert_eq!(id, 1);
        let m = other.snapshot();
        assert!(m.is_running());
        assert_eq!(m.num_shards(), 10);
        assert!(m.shards_of(1).is_empty());
    }

    #[tokio::test]
    async fn rejoin_while_available_is_refused() {
        let (coord, info) = harness();
        info.add("host0:4000", 10).await.unwrap();
        info.set_available(0, true).await.unwrap();

        let other = ClusterInfo::new(coord);
        assert!(matches!(
            other.add("host0:4000", 10).await,
            Err(Error::AddressInUse(_))
        ));
    }

    #[tokio::test]
    async fn rejoin_after_crash_reuses_the_id() {
        let (coord, info) = harness();
        info.add("host0:4000", 10).await.unwrap();
        // Crash: available stays false, the slot stays populated.
        let recovered = ClusterInfo::new(coord);
        let id = recovered.add("host0:4000", 10).await.unwrap();
        assert_eq!(id, 0);
        assert_eq!(recovered.snapshot().shards_of(0).len(), 10);
    }

    #[tokio::test]
    async fn migrate_moves_half_to_the_new_node() {
        let (coord, info) = harness();
        info.add("host0:4000", 10).await.unwrap();
        info.set_available(0, true).await.unwrap();
        info.run().await.unwrap();

        let joiner = ClusterInfo::new(coord);
        joiner.add("host1:4000", 0).await.unwrap();
        joiner.set_available(1, true).await.unwrap();

        assert!(info.migrate().await.unwrap());
        let m = info.snapshot();
        assert!(m.is_migrating());

        let tasks = m.tasks(1);
        assert_eq!(tasks[&0].len(), 5);
        // Masters do not change until give_shard.
        assert_eq!(m.shards_of(0).len(), 10);
    }

    #[tokio::test]
    async fn migrate_with_nothing_to_move_is_a_noop() {
        let (_, info) = harness();
        info.add("host0:4000", 10).await.unwrap();
        info.set_available(0, true).await.unwrap();
        info.run().await.unwrap();
        assert!(!info.migrate().await.unwrap());
        assert!(info.snapshot().is_running());
    }

    #[tokio::test]
    async fn handoff_and_completion_round_trip() {
        let (coord, info) = harness();
        info.add("host0:4000", 2).await.unwrap();
        info.set_available(0, true).await.unwrap();
        info.run().await.unwrap();

        let joiner = ClusterInfo::new(coord);
        joiner.add("host1:4000", 0).await.unwrap();
        joiner.set_available(1, true).await.unwrap();
        info.migrate().await.unwrap();

        let shard = *info.snapshot().tasks(1)[&0].first().unwrap();
        info.give_shard(shard).await.unwrap();
        let m = info.snapshot();
        assert_eq!(m.index_for_shard(shard), 1);
        assert!(m.shard_is_migrating(shard));

        joiner.migration_over(shard).await.unwrap();
        let m = joiner.snapshot();
        assert!(!m.shard_is_migrating(shard));
        assert!(m.is_running());
    }

    #[tokio::test]
    async fn serialize_round_trip() {
        let (_, info) = harness();
        info.add("host0:4000", 10).await.unwrap();
        let m = info.snapshot();
        let blob = m.serialize();
        assert_eq!(Model::parse(&blob).unwrap(), m);
    }

    #[tokio::test]
    async fn health_tracks_availability() {
        let (_, info) = harness();
        info.add("host0:4000", 2).await.unwrap();
        assert!(!info.snapshot().is_healthy());
        info.set_available(0, true).await.unwrap();
        assert!(info.snapshot().is_healthy());
        info.set_available(0, false).await.unwrap();
        assert!(!info.snapshot().is_healthy());
    }

    #[tokio::test]
    async fn concurrent_joins_serialize_through_cas() {
        let coord = Arc::new(MemCoordinator::new());
        let mut handles = Vec::new();
        for i in 0..4u32 {
            let coord = coord.clone();
            handles.push(tokio::spawn(async move {
                let info = ClusterInfo::new(coord);
                info.add(&format!("host{}:4000", i), 5).await.unwrap()
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3]);

        let info = ClusterInfo::new(coord);
        info.refresh().await.unwrap();
        let m = info.snapshot();
        assert_eq!(m.num_shards(), 20);
        for id in 0..4 {
            assert_eq!(m.shards_of(id).len(), 5);
        }
    }

    #[test]
    fn ranges_compact_runs() {
        assert_eq!(ranges(&[1, 2, 3, 5, 7, 8, 9]), "1-3,5,7-9");
        assert_eq!(ranges(&[4]), "4");
        assert_eq!(ranges(&[]), "");
    }

    #[test]
    fn redistribute_excludes_removed_nodes() {
        let mut m = Model::default();
        m.add_node_with_new_shards("host0:4000", 6);
        m.add_node("host1:4000");
        m.set_available(0, true);
        m.set_available(1, true);
        m.mark_remove(0);
        m.redistribute();
        // Everything must leave node 0.
        for sid in 0..6 {
            assert!(m.shard_is_migrating(sid));
            assert_eq!(m.inner.shards[sid as usize].to, 1);
        }
    }

    #[test]
    fn redistribute_is_even_and_minimal() {
        let mut m = Model::default();
        m.add_node_with_new_shards("host0:4000", 10);
        m.add_node("host1:4000");
        m.add_node("host2:4000");
        for id in 0..3 {
            m.set_available(id, true);
        }
        m.redistribute();

        let moving: Vec<_> = m.inner.shards.iter().filter(|s| s.migrating).collect();
        // 10 shards over 3 nodes: node 0 keeps 4 (largest remainder), the
        // other two receive 3 each.
        assert_eq!(moving.len(), 6);
        assert_eq!(moving.iter().filter(|s| s.to == 1).count(), 3);
        assert_eq!(moving.iter().filter(|s| s.to == 2).count(), 3);
    }
}
