//! Shard migration: donor-side dump and recipient-side import
//!
//! The donor snapshots a quiesced shard into SST files and streams them
//! as chunks; the recipient assembles chunks into files and bulk-ingests
//! each finished SST. Both sides persist enough state to resume after a
//! crash: the recipient counts fully-ingested SSTs (the donor skips that
//! many on resume) and keeps the last ingested largest key so reads can
//! be answered during the import.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use rocksdb::SstFileWriter;

use crate::common::{EngineTuning, Error, Result};
use crate::proto as pb;
use crate::server::engine::{self, importer_num_key, largest_key_key, Db, DEFAULT_CF};
use crate::server::shard::Shard;

/// Split the dump into SSTs of roughly this size.
pub const SST_TARGET_SIZE: u64 = 64 << 20;

/// Bytes per streamed chunk.
pub const CHUNK_SIZE: usize = 1 << 20;

/// Sentinel file marking a completed dump, so a restarted donor streams
/// the existing SSTs instead of snapshotting again.
const DUMP_MARKER: &str = "DUMPED";

fn get_meta(db: &Db, key: &str) -> Result<Option<Vec<u8>>> {
    let cf = db
        .cf_handle(DEFAULT_CF)
        .ok_or_else(|| Error::Internal("missing default column family".into()))?;
    Ok(db.get_cf(&cf, key)?)
}

fn put_meta(db: &Db, key: &str, value: &[u8]) -> Result<()> {
    let cf = db
        .cf_handle(DEFAULT_CF)
        .ok_or_else(|| Error::Internal("missing default column family".into()))?;
    Ok(db.put_cf(&cf, key, value)?)
}

fn delete_meta(db: &Db, key: &str) -> Result<()> {
    let cf = db
        .cf_handle(DEFAULT_CF)
        .ok_or_else(|| Error::Internal("missing default column family".into()))?;
    Ok(db.delete_cf(&cf, key)?)
}

/// Largest ingested key recorded for a shard, if an import was underway.
pub fn load_largest_key(db: &Db, shard: u32) -> Result<Option<Vec<u8>>> {
    get_meta(db, &largest_key_key(shard))
}

struct SstMeta {
    path: PathBuf,
    largest_key: Vec<u8>,
}

/// Donor side: dumps a shard into SST files and serves them chunk by
/// chunk, starting from the SST index the recipient asks for.
pub struct ShardMigrator {
    db: Arc<Db>,
    shard: u32,
    dir: PathBuf,
    ssts: Vec<SstMeta>,
    index: usize,
    file: Option<(File, u64, u64)>,
    sst_target: u64,
}

impl ShardMigrator {
    pub fn new(db: Arc<Db>, shard: u32, start_from: u32) -> Result<Self> {
        let dir = db.path().join(format!("migrate-{}", shard));
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            db,
            shard,
            dir,
            ssts: Vec::new(),
            index: start_from as usize,
            file: None,
            sst_target: SST_TARGET_SIZE,
        })
    }

    #[cfg(test)]
    fn set_sst_target(&mut self, bytes: u64) {
        self.sst_target = bytes;
    }

    pub fn num_ssts(&self) -> usize {
        self.ssts.len()
    }

    /// Snapshot the shard's column family into SST files. Writers must
    /// have drained before this is called. If a completed dump already
    /// exists on disk, it is reused as is.
    pub fn dump(&mut self, tuning: &EngineTuning) -> Result<()> {
        if self.dir.join(DUMP_MARKER).exists() {
            return self.load_existing();
        }

        let cf = self
            .db
            .cf_handle(&self.shard.to_string())
            .ok_or(Error::WrongShard)?;
        let snapshot = self.db.snapshot();
        let mut it = snapshot.raw_iterator_cf(&cf);
        it.seek_to_first();

        let mut index = 0;
        while it.valid() {
            let path = self.dir.join(format!("{}.sst", index));
            let mut writer = SstFileWriter::create(&engine::cf_options(tuning));
            writer.open(&path)?;
            let mut largest = Vec::new();
            while it.valid() && writer.file_size() < self.sst_target {
                if let (Some(key), Some(value)) = (it.key(), it.value()) {
                    writer.put(key, value)?;
                    largest = key.to_vec();
                }
                it.next();
            }
            writer.finish()?;
            std::fs::write(self.dir.join(format!("{}.largest", index)), &largest)?;
            self.ssts.push(SstMeta {
                path,
                largest_key: largest,
            });
            index += 1;
        }
        std::fs::write(self.dir.join(DUMP_MARKER), b"")?;
        Ok(())
    }

    fn load_existing(&mut self) -> Result<()> {
        let mut index = 0;
        loop {
            let path = self.dir.join(format!("{}.sst", index));
            if !path.exists() {
                return Ok(());
            }
            let largest_key = std::fs::read(self.dir.join(format!("{}.largest", index)))?;
            self.ssts.push(SstMeta { path, largest_key });
            index += 1;
        }
    }

    /// Produce the next chunk to stream, or `None` once every SST from
    /// `start_from` on has been sent.
    pub fn next_chunk(&mut self) -> Result<Option<pb::MigrateResponse>> {
        if self.file.is_none() {
            if self.index >= self.ssts.len() {
                return Ok(None);
            }
            let file = File::open(&self.ssts[self.index].path)?;
            let len = file.metadata()?.len();
            self.file = Some((file, len, 0));
        }

        let (file, len, sent) = self.file.as_mut().unwrap();
        let mut chunk = vec![0u8; CHUNK_SIZE.min((*len - *sent) as usize)];
        file.read_exact(&mut chunk)?;
        *sent += chunk.len() as u64;

        let mut response = pb::MigrateResponse {
            chunk,
            ..Default::default()
        };
        if *sent >= *len {
            response.eof = true;
            response.largest_key = self.ssts[self.index].largest_key.clone();
            self.file = None;
            self.index += 1;
        }
        Ok(Some(response))
    }

    /// Delete the dump directory once the recipient confirmed receipt.
    pub fn clear_state(&self) -> Result<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

/// Recipient side: assembles streamed chunks into SST files and ingests
/// each finished one into the shard's column family.
pub struct ShardImporter {
    db: Arc<Db>,
    shard: u32,
    path: PathBuf,
    num: u32,
    largest_key: Vec<u8>,
    file: Option<File>,
}

impl ShardImporter {
    pub fn new(db: Arc<Db>, shard: u32) -> Result<Self> {
        let path = db.path().join(format!("import-{}.sst", shard));
        let num = match get_meta(&db, &importer_num_key(shard))? {
            Some(raw) => String::from_utf8_lossy(&raw).parse().unwrap_or(0),
            None => 0,
        };
        let largest_key = get_meta(&db, &largest_key_key(shard))?.unwrap_or_default();
        Ok(Self {
            db,
            shard,
            path,
            num,
            largest_key,
            file: None,
        })
    }

    /// SSTs fully ingested so far; the donor resumes after this many.
    pub fn num(&self) -> u32 {
        self.num
    }

    pub fn largest_key(&self) -> Vec<u8> {
        self.largest_key.clone()
    }

    /// After a crash there may be a complete SST on disk that was never
    /// ingested. Ingest it; a half-written file fails the ingest and is
    /// discarded, and the donor resends that SST.
    pub fn recover(&mut self, shard: &Shard) -> Result<()> {
        if !self.path.exists() {
            shard.set_largest_key(&self.largest_key);
            return Ok(());
        }
        match self.ingest_pending(shard) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(shard = self.shard, "discarding partial SST: {}", e);
                std::fs::remove_file(&self.path)?;
                shard.set_largest_key(&self.largest_key);
                Ok(())
            }
        }
    }

    /// Append one streamed chunk. Returns true when the current SST is
    /// complete and ready to ingest.
    pub fn write_chunk(&mut self, response: &pb::MigrateResponse) -> Result<bool> {
        if self.file.is_none() {
            // A resumed stream restarts the in-flight SST from scratch.
            self.file = Some(File::create(&self.path)?);
        }
        let file = self.file.as_mut().unwrap();
        file.write_all(&response.chunk)?;
        if !response.eof {
            return Ok(false);
        }
        file.sync_all()?;
        self.file = None;
        self.largest_key = response.largest_key.clone();
        put_meta(&self.db, &largest_key_key(self.shard), &self.largest_key)?;
        Ok(true)
    }

    /// Ingest the finished SST and persist the progress counter.
    pub fn ingest_pending(&mut self, shard: &Shard) -> Result<()> {
        shard.ingest(&self.path, &self.largest_key)?;
        self.num += 1;
        put_meta(
            &self.db,
            &importer_num_key(self.shard),
            self.num.to_string().as_bytes(),
        )?;
        Ok(())
    }

    /// Forget all importer state once the migration is over.
    pub fn clear_state(&mut self) -> Result<()> {
        delete_meta(&self.db, &importer_num_key(self.shard))?;
        delete_meta(&self.db, &largest_key_key(self.shard))?;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        self.num = 0;
        self.largest_key.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::EngineTuning;
    use crate::server::engine::open;
    use crate::server::shard::Shards;

    fn value_for(i: usize) -> String {
        format!("value{:0>100}", i)
    }

    fn node(num_keys: usize) -> (tempfile::TempDir, Arc<Db>, Shards) {
        let dir = tempfile::tempdir().unwrap();
        let tuning = EngineTuning::default();
        let (db, _) = open(dir.path(), &tuning).unwrap();
        let shards = Shards::new(db.clone(), tuning);
        let shard = shards.create(0).unwrap();
        for i in 0..num_keys {
            shard
                .put(format!("key{:05}", i).as_bytes(), value_for(i).as_bytes())
                .unwrap();
        }
        (dir, db, shards)
    }

    fn stream_all(
        migrator: &mut ShardMigrator,
        importer: &mut ShardImporter,
        shard: &Shard,
    ) -> usize {
        let mut ingested = 0;
        while let Some(response) = migrator.next_chunk().unwrap() {
            if importer.write_chunk(&response).unwrap() {
                importer.ingest_pending(shard).unwrap();
                ingested += 1;
            }
        }
        ingested
    }

    #[test]
    fn dump_stream_ingest_round_trip() {
        let tuning = EngineTuning::default();
        let (_donor_dir, donor_db, _donor_shards) = node(500);
        let (_rcpt_dir, rcpt_db, rcpt_shards) = node(0);
        let rcpt_shard = rcpt_shards.at(0).unwrap();
        rcpt_shard.set_importing(true);

        let mut migrator = ShardMigrator::new(donor_db.clone(), 0, 0).unwrap();
        migrator.set_sst_target(4 * 1024);
        migrator.dump(&tuning).unwrap();
        assert!(migrator.num_ssts() > 1);

        let mut importer = ShardImporter::new(rcpt_db.clone(), 0).unwrap();
        let ingested = stream_all(&mut migrator, &mut importer, &rcpt_shard);
        assert_eq!(ingested, migrator.num_ssts());
        rcpt_shard.set_importing(false);

        for i in 0..500 {
            let (value, ask) = rcpt_shard.get(format!("key{:05}", i).as_bytes()).unwrap();
            assert!(!ask);
            assert_eq!(value.unwrap(), value_for(i).as_bytes());
        }
        assert_eq!(importer.num(), migrator.num_ssts() as u32);
    }

    #[test]
    fn migration_resumes_from_the_last_ingested_sst() {
        let tuning = EngineTuning::default();
        let (_donor_dir, donor_db, _donor_shards) = node(500);
        let (_rcpt_dir, rcpt_db, rcpt_shards) = node(0);
        let rcpt_shard = rcpt_shards.at(0).unwrap();
        rcpt_shard.set_importing(true);

        let mut migrator = ShardMigrator::new(donor_db.clone(), 0, 0).unwrap();
        migrator.set_sst_target(4 * 1024);
        migrator.dump(&tuning).unwrap();
        let total = migrator.num_ssts();
        assert!(total >= 2);

        // First attempt dies after one ingested SST.
        {
            let mut importer = ShardImporter::new(rcpt_db.clone(), 0).unwrap();
            let response = loop {
                let response = migrator.next_chunk().unwrap().unwrap();
                if importer.write_chunk(&response).unwrap() {
                    importer.ingest_pending(&rcpt_shard).unwrap();
                    break response;
                }
            };
            assert!(!response.largest_key.is_empty());
        }

        // The retry opens a fresh importer, which remembers its progress,
        // and a fresh migrator that reuses the on-disk dump.
        let mut importer = ShardImporter::new(rcpt_db.clone(), 0).unwrap();
        assert_eq!(importer.num(), 1);
        importer.recover(&rcpt_shard).unwrap();

        let mut migrator = ShardMigrator::new(donor_db, 0, importer.num()).unwrap();
        migrator.dump(&tuning).unwrap();
        assert_eq!(migrator.num_ssts(), total);
        let ingested = stream_all(&mut migrator, &mut importer, &rcpt_shard);
        assert_eq!(ingested, total - 1);
        rcpt_shard.set_importing(false);

        for i in 0..500 {
            let (value, _) = rcpt_shard.get(format!("key{:05}", i).as_bytes()).unwrap();
            assert_eq!(value.unwrap(), value_for(i).as_bytes());
        }
    }

    #[test]
    fn recover_discards_a_half_written_sst() {
        let (_dir, db, shards) = node(0);
        let shard = shards.at(0).unwrap();
        shard.set_importing(true);

        // Simulate a crash mid-chunk: garbage that is not a valid SST.
        let path = db.path().join("import-0.sst");
        std::fs::write(&path, b"not an sst").unwrap();

        let mut importer = ShardImporter::new(db.clone(), 0).unwrap();
        importer.recover(&shard).unwrap();
        assert!(!path.exists());
        assert_eq!(importer.num(), 0);
    }

    #[test]
    fn empty_shard_dumps_no_ssts() {
        let tuning = EngineTuning::default();
        let (_dir, db, _shards) = node(0);
        let mut migrator = ShardMigrator::new(db, 0, 0).unwrap();
        migrator.dump(&tuning).unwrap();
        assert_eq!(migrator.num_ssts(), 0);
        assert!(migrator.next_chunk().unwrap().is_none());
    }

    #[test]
    fn clear_state_removes_importer_keys() {
        let (_dir, db, shards) = node(5);
        let shard = shards.at(0).unwrap();

        let mut importer = ShardImporter::new(db.clone(), 0).unwrap();
        let mut migrator = ShardMigrator::new(db.clone(), 0, 0).unwrap();
        migrator.dump(&EngineTuning::default()).unwrap();
        while let Some(response) = migrator.next_chunk().unwrap() {
            if importer.write_chunk(&response).unwrap() {
                importer.ingest_pending(&shard).unwrap();
            }
        }
        assert_eq!(importer.num(), 1);

        importer.clear_state().unwrap();
        let reopened = ShardImporter::new(db, 0).unwrap();
        assert_eq!(reopened.num(), 0);
        assert!(reopened.largest_key().is_empty());
    }
}
