//! Storage engine glue
//!
//! RocksDB options, database opening with column-family recovery, and the
//! translation between wire batch updates and engine write batches. One
//! column family per shard, named by the decimal shard id; the `default`
//! family holds only per-shard recovery keys.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    ColumnFamilyDescriptor, DBWithThreadMode, MergeOperands, MultiThreaded, Options, WriteBatch,
};

use crate::common::{EngineTuning, Result};
use crate::proto as pb;

/// The storage engine handle shared by all shards on a node.
pub type Db = DBWithThreadMode<MultiThreaded>;

pub const DEFAULT_CF: &str = "default";

/// Recovery key: largest key in the last SST ingested for `shard`.
pub fn largest_key_key(shard: u32) -> String {
    format!("shard/{}/largest_key", shard)
}

/// Recovery key: number of SSTs fully ingested for `shard`.
pub fn importer_num_key(shard: u32) -> String {
    format!("shard/{}/importer_num", shard)
}

fn append_merge(_key: &[u8], existing: Option<&[u8]>, operands: &MergeOperands) -> Option<Vec<u8>> {
    let mut result = existing.map(|v| v.to_vec()).unwrap_or_default();
    for op in operands.iter() {
        result.extend_from_slice(op);
    }
    Some(result)
}

/// Database-level options.
pub fn db_options(tuning: &EngineTuning) -> Options {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);
    opts.increase_parallelism(tuning.parallelism);
    opts.set_write_buffer_size(tuning.write_buffer_size);
    opts
}

/// Per-shard column family options. The merge operator must be installed
/// on every family that can receive Merge updates or ingest SSTs carrying
/// merge operands.
pub fn cf_options(tuning: &EngineTuning) -> Options {
    let mut opts = Options::default();
    opts.optimize_level_style_compaction(tuning.memtable_memory_budget);
    opts.set_merge_operator_associative("append", append_merge);
    opts
}

/// Open the database, recovering whatever column families exist. Returns
/// the handle and the shard ids found on disk (empty on a fresh start).
pub fn open(path: &Path, tuning: &EngineTuning) -> Result<(Arc<Db>, Vec<u32>)> {
    let existing = Db::list_cf(&Options::default(), path).unwrap_or_default();

    let mut descriptors = vec![ColumnFamilyDescriptor::new(DEFAULT_CF, cf_options(tuning))];
    let mut shard_ids = Vec::new();
    for name in &existing {
        if name == DEFAULT_CF {
            continue;
        }
        descriptors.push(ColumnFamilyDescriptor::new(name, cf_options(tuning)));
        if let Ok(id) = name.parse::<u32>() {
            shard_ids.push(id);
        }
    }
    shard_ids.sort_unstable();

    let db = Db::open_cf_descriptors(&db_options(tuning), path, descriptors)?;
    Ok((Arc::new(db), shard_ids))
}

/// Fold one wire update into an engine write batch.
pub fn apply_batch_update(
    batch: &mut WriteBatch,
    cf: &impl rocksdb::AsColumnFamilyRef,
    update: &pb::BatchUpdate,
) {
    use pb::batch_update::Op;
    match update.op() {
        Op::Put => batch.put_cf(cf, &update.key, &update.value),
        Op::Delete => batch.delete_cf(cf, &update.key),
        Op::SingleDelete => batch.single_delete_cf(cf, &update.key),
        Op::Merge => batch.merge_cf(cf, &update.key, &update.value),
        Op::Clear => batch.clear(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::EngineTuning;

    fn update(op: pb::batch_update::Op, key: &[u8], value: &[u8]) -> pb::BatchUpdate {
        pb::BatchUpdate {
            op: op as i32,
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn open_fresh_then_recover_column_families() {
        let dir = tempfile::tempdir().unwrap();
        let tuning = EngineTuning::default();

        {
            let (db, shard_ids) = open(dir.path(), &tuning).unwrap();
            assert!(shard_ids.is_empty());
            db.create_cf("3", &cf_options(&tuning)).unwrap();
            db.create_cf("7", &cf_options(&tuning)).unwrap();
        }

        let (_db, shard_ids) = open(dir.path(), &tuning).unwrap();
        assert_eq!(shard_ids, vec![3, 7]);
    }

    #[test]
    fn batch_updates_apply_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let tuning = EngineTuning::default();
        let (db, _) = open(dir.path(), &tuning).unwrap();
        db.create_cf("0", &cf_options(&tuning)).unwrap();
        let cf = db.cf_handle("0").unwrap();

        use pb::batch_update::Op;
        let mut batch = WriteBatch::default();
        apply_batch_update(&mut batch, &cf, &update(Op::Put, b"a", b"1"));
        apply_batch_update(&mut batch, &cf, &update(Op::Put, b"b", b"2"));
        apply_batch_update(&mut batch, &cf, &update(Op::Put, b"c", b"3"));
        apply_batch_update(&mut batch, &cf, &update(Op::Delete, b"a", b""));
        apply_batch_update(&mut batch, &cf, &update(Op::SingleDelete, b"c", b""));
        db.write(batch).unwrap();

        assert!(db.get_cf(&cf, b"a").unwrap().is_none());
        assert_eq!(db.get_cf(&cf, b"b").unwrap().unwrap(), b"2");
        assert!(db.get_cf(&cf, b"c").unwrap().is_none());
    }

    #[test]
    fn clear_drops_buffered_updates() {
        let dir = tempfile::tempdir().unwrap();
        let tuning = EngineTuning::default();
        let (db, _) = open(dir.path(), &tuning).unwrap();
        db.create_cf("0", &cf_options(&tuning)).unwrap();
        let cf = db.cf_handle("0").unwrap();

        use pb::batch_update::Op;
        let mut batch = WriteBatch::default();
        apply_batch_update(&mut batch, &cf, &update(Op::Put, b"a", b"1"));
        apply_batch_update(&mut batch, &cf, &update(Op::Clear, b"", b""));
        apply_batch_update(&mut batch, &cf, &update(Op::Put, b"b", b"2"));
        db.write(batch).unwrap();

        assert!(db.get_cf(&cf, b"a").unwrap().is_none());
        assert_eq!(db.get_cf(&cf, b"b").unwrap().unwrap(), b"2");
    }

    #[test]
    fn merge_appends_operands() {
        let dir = tempfile::tempdir().unwrap();
        let tuning = EngineTuning::default();
        let (db, _) = open(dir.path(), &tuning).unwrap();
        db.create_cf("0", &cf_options(&tuning)).unwrap();
        let cf = db.cf_handle("0").unwrap();

        db.merge_cf(&cf, b"k", b"ab").unwrap();
        db.merge_cf(&cf, b"k", b"cd").unwrap();
        assert_eq!(db.get_cf(&cf, b"k").unwrap().unwrap(), b"abcd");
    }
}
