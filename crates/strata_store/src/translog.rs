//! Per-shard transaction log.
//!
//! Every applied operation is appended as a crc-framed record before the
//! write is acknowledged. `sync(location)` makes everything up to and
//! including a location durable; with `Request` durability the shard syncs
//! after each operation, with `Async` durability syncs are left to the
//! background flush path.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Context;
use crc32fast::Hasher;

use strata_cluster::cluster::TranslogDurability;

const TRANSLOG_FILE: &str = "translog.log";

/// Position of one record in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location {
    pub generation: u64,
    pub offset: u64,
    pub size: u32,
}

impl Location {
    fn end(&self) -> u64 {
        self.offset + u64::from(self.size)
    }
}

struct LogFile {
    file: File,
    offset: u64,
}

pub struct Translog {
    dir: PathBuf,
    inner: Mutex<LogFile>,
    generation: AtomicU64,
    synced_offset: AtomicU64,
    durability: TranslogDurability,
    flush_threshold_bytes: u64,
}

impl Translog {
    pub fn open_dir(
        path: impl AsRef<Path>,
        durability: TranslogDurability,
        flush_threshold_bytes: u64,
    ) -> anyhow::Result<Self> {
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create translog dir")?;
        let log_path = dir.join(TRANSLOG_FILE);
        let file = open_log_for_append(&log_path)?;
        let offset = file.metadata().context("stat translog")?.len();
        Ok(Self {
            dir,
            inner: Mutex::new(LogFile { file, offset }),
            generation: AtomicU64::new(1),
            synced_offset: AtomicU64::new(offset),
            durability,
            flush_threshold_bytes,
        })
    }

    pub fn durability(&self) -> TranslogDurability {
        self.durability
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.inner.lock().expect("translog poisoned").offset
    }

    /// Append one record and return its location. The record is buffered, not
    /// yet durable; callers needing durability follow up with `sync`.
    pub fn append(&self, payload: &[u8]) -> anyhow::Result<Location> {
        let mut inner = self.inner.lock().expect("translog poisoned");
        let offset = inner.offset;
        let written = write_record(&mut inner.file, payload)?;
        inner.file.flush()?;
        inner.offset += written;
        Ok(Location {
            generation: self.generation.load(Ordering::Acquire),
            offset,
            size: written as u32,
        })
    }

    /// Make everything up to and including `location` durable. A no-op when a
    /// later sync already covered it or the location belongs to a rolled-over
    /// generation.
    pub fn sync(&self, location: &Location) -> anyhow::Result<()> {
        if location.generation != self.generation.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.synced_offset.load(Ordering::Acquire) >= location.end() {
            return Ok(());
        }
        let inner = self.inner.lock().expect("translog poisoned");
        let offset = inner.offset;
        inner.file.sync_data().context("sync translog")?;
        drop(inner);
        self.synced_offset.fetch_max(offset, Ordering::AcqRel);
        Ok(())
    }

    pub fn synced_offset(&self) -> u64 {
        self.synced_offset.load(Ordering::Acquire)
    }

    /// Whether the log has grown past the flush threshold.
    pub fn should_flush(&self) -> bool {
        self.size_in_bytes() >= self.flush_threshold_bytes
    }

    /// Start a new generation after the engine state has been flushed. Earlier
    /// locations become no-ops for `sync`.
    pub fn roll_generation(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("translog poisoned");
        inner.file.sync_data().context("sync translog before roll")?;
        let log_path = self.dir.join(TRANSLOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)
            .context("truncate translog")?;
        inner.file = file;
        inner.offset = 0;
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.synced_offset.store(0, Ordering::Release);
        Ok(())
    }

    /// Read every record back, verifying checksums. Used for recovery.
    pub fn read_operations(&self) -> anyhow::Result<Vec<Vec<u8>>> {
        read_log_records(&self.dir.join(TRANSLOG_FILE))
    }
}

fn open_log_for_append(path: &Path) -> anyhow::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("open translog")
}

fn write_record(file: &mut File, payload: &[u8]) -> anyhow::Result<u64> {
    let len = payload.len() as u32;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    file.write_all(&len.to_be_bytes())?;
    file.write_all(&checksum.to_be_bytes())?;
    file.write_all(payload)?;
    Ok(8 + u64::from(len))
}

fn read_log_records(path: &Path) -> anyhow::Result<Vec<Vec<u8>>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut reader = std::io::BufReader::new(file);
    let mut records = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let expected_crc = u32::from_be_bytes(crc_buf);
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        anyhow::ensure!(hasher.finalize() == expected_crc, "translog checksum mismatch");
        records.push(payload);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp(durability: TranslogDurability) -> (tempfile::TempDir, Translog) {
        let dir = tempfile::tempdir().expect("tempdir");
        let translog = Translog::open_dir(dir.path().join("translog"), durability, 1024)
            .expect("open translog");
        (dir, translog)
    }

    #[test]
    fn append_and_read_back() {
        let (_dir, translog) = open_temp(TranslogDurability::Request);
        let first = translog.append(b"op-1").unwrap();
        let second = translog.append(b"op-22").unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, first.end());

        let records = translog.read_operations().unwrap();
        assert_eq!(records, vec![b"op-1".to_vec(), b"op-22".to_vec()]);
    }

    #[test]
    fn sync_advances_synced_offset() {
        let (_dir, translog) = open_temp(TranslogDurability::Request);
        let location = translog.append(b"op-1").unwrap();
        assert_eq!(translog.synced_offset(), 0);
        translog.sync(&location).unwrap();
        assert!(translog.synced_offset() >= location.end());
        // A second sync for the same location is a no-op.
        translog.sync(&location).unwrap();
    }

    #[test]
    fn roll_generation_truncates_and_invalidates_old_locations() {
        let (_dir, translog) = open_temp(TranslogDurability::Async);
        let old = translog.append(b"op-1").unwrap();
        translog.roll_generation().unwrap();
        assert_eq!(translog.generation(), 2);
        assert_eq!(translog.size_in_bytes(), 0);
        assert!(translog.read_operations().unwrap().is_empty());
        // Locations from the previous generation sync as no-ops.
        translog.sync(&old).unwrap();
        assert_eq!(translog.synced_offset(), 0);
    }

    #[test]
    fn flush_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let translog =
            Translog::open_dir(dir.path().join("translog"), TranslogDurability::Async, 16)
                .unwrap();
        assert!(!translog.should_flush());
        translog.append(&[0u8; 32]).unwrap();
        assert!(translog.should_flush());
    }
}
