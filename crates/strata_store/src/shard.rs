//! Shard-local write surface.
//!
//! An `IndexShard` owns one copy of one shard: the document engine, the
//! translog, and the operation counter that keeps the shard open while
//! writes are in flight.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use fjall::{Keyspace, PersistMode};
use tracing::{trace, warn};

use strata_cluster::cluster::{IndexSettings, Mapping, ShardId, TranslogDurability};

use crate::action::error::ActionError;
use crate::engine::{Engine, IndexOperation, Origin, VersionType};
use crate::translog::{Location, Translog};

const STATE_STARTED: u8 = 0;
const STATE_CLOSED: u8 = 1;
const STATE_FAILED: u8 = 2;

/// Translog record, replayed on recovery.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct TranslogRecord {
    pub id: String,
    pub version: u64,
    pub source: serde_json::Value,
}

pub struct IndexShard {
    shard_id: ShardId,
    settings: IndexSettings,
    state: AtomicU8,
    operation_counter: AtomicI64,
    engine: Engine,
    translog: Translog,
    mapping: Arc<RwLock<Mapping>>,
    keyspace: Arc<Keyspace>,
    refresh_count: AtomicU64,
}

impl std::fmt::Debug for IndexShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexShard")
            .field("shard_id", &self.shard_id)
            .field("settings", &self.settings)
            .field("state", &self.state.load(Ordering::Relaxed))
            .field(
                "operation_counter",
                &self.operation_counter.load(Ordering::Relaxed),
            )
            .field("refresh_count", &self.refresh_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl IndexShard {
    pub fn create(
        shard_id: ShardId,
        settings: IndexSettings,
        mapping: Arc<RwLock<Mapping>>,
        keyspace: Arc<Keyspace>,
        shard_path: impl AsRef<std::path::Path>,
    ) -> anyhow::Result<Arc<Self>> {
        let partition_name = format!("docs_{}_{}", shard_id.index, shard_id.shard);
        let partition =
            keyspace.open_partition(&partition_name, fjall::PartitionCreateOptions::default())?;
        let translog = Translog::open_dir(
            shard_path.as_ref().join("translog"),
            settings.translog_durability,
            settings.flush_threshold_bytes,
        )?;
        Ok(Arc::new(Self {
            engine: Engine::new(shard_id.clone(), partition),
            shard_id,
            settings,
            state: AtomicU8::new(STATE_STARTED),
            operation_counter: AtomicI64::new(0),
            translog,
            mapping,
            keyspace,
            refresh_count: AtomicU64::new(0),
        }))
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    fn started(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_STARTED
    }

    fn illegal_state(&self, message: &str) -> ActionError {
        ActionError::IllegalShardState {
            shard_id: self.shard_id.clone(),
            message: message.to_string(),
        }
    }

    /// Reserve the shard for one in-flight operation. Fails once the shard is
    /// closed or failed.
    pub fn increment_operation_counter(&self) -> Result<(), ActionError> {
        if !self.started() {
            return Err(self.illegal_state("shard is not started"));
        }
        self.operation_counter.fetch_add(1, Ordering::AcqRel);
        // The shard may have closed between the check and the increment.
        if !self.started() {
            self.operation_counter.fetch_sub(1, Ordering::AcqRel);
            return Err(self.illegal_state("shard is not started"));
        }
        Ok(())
    }

    pub fn decrement_operation_counter(&self) {
        let previous = self.operation_counter.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "operation counter underflow");
    }

    pub fn active_operations(&self) -> i64 {
        self.operation_counter.load(Ordering::Acquire)
    }

    /// Close the shard. Refused while operations hold references.
    pub fn close(&self) -> Result<(), ActionError> {
        let active = self.active_operations();
        if active > 0 {
            return Err(self.illegal_state(&format!("{active} operations in flight")));
        }
        self.state.store(STATE_CLOSED, Ordering::Release);
        Ok(())
    }

    /// Mark the shard failed. Best-effort; in-flight operations drain on
    /// their own.
    pub fn fail_shard(&self, reason: &str, cause: &ActionError) {
        warn!(shard = %self.shard_id, reason, error = %cause, "failing shard");
        self.state.store(STATE_FAILED, Ordering::Release);
    }

    pub fn prepare_index(
        &self,
        id: impl Into<String>,
        source: serde_json::Value,
        version: u64,
        version_type: VersionType,
        origin: Origin,
        create: bool,
    ) -> Result<IndexOperation, ActionError> {
        if !self.started() {
            return Err(self.illegal_state("shard is not started"));
        }
        let mapping = self.mapping.read().expect("mapping lock poisoned").clone();
        Ok(self
            .engine
            .prepare_index(&mapping, id, source, version, version_type, origin, create))
    }

    /// Apply a prepared operation and append it to the translog.
    pub fn index(&self, op: &mut IndexOperation) -> Result<bool, ActionError> {
        if !self.started() {
            return Err(self.illegal_state("shard is not started"));
        }
        let created = self.engine.index(op)?;
        let record = TranslogRecord {
            id: op.id.clone(),
            version: op.version(),
            source: op.source.clone(),
        };
        let payload = serde_json::to_vec(&record).map_err(|err| ActionError::EngineFailure {
            message: format!("encode translog record: {err}"),
        })?;
        let location = self
            .translog
            .append(&payload)
            .map_err(|err| ActionError::EngineFailure {
                message: format!("translog append: {err}"),
            })?;
        op.set_location(location);
        Ok(created)
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn translog(&self) -> &Translog {
        &self.translog
    }

    pub fn translog_durability(&self) -> TranslogDurability {
        self.settings.translog_durability
    }

    pub fn sync(&self, location: &Location) -> Result<(), ActionError> {
        self.translog
            .sync(location)
            .map_err(|err| ActionError::EngineFailure {
                message: format!("translog sync: {err}"),
            })
    }

    /// Make recent writes visible to readers. Failures on this path are
    /// swallowed by callers; the write itself already succeeded.
    pub fn refresh(&self, reason: &str) {
        trace!(shard = %self.shard_id, reason, "refresh");
        self.refresh_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::Relaxed)
    }

    /// Flush when the translog has outgrown its threshold: persist the
    /// keyspace, then start a new translog generation.
    pub fn maybe_flush(&self) {
        if !self.translog.should_flush() {
            return;
        }
        if let Err(err) = self.keyspace.persist(PersistMode::SyncAll) {
            warn!(shard = %self.shard_id, error = %err, "flush: keyspace persist failed");
            return;
        }
        if let Err(err) = self.translog.roll_generation() {
            warn!(shard = %self.shard_id, error = %err, "flush: translog roll failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_shard(settings: IndexSettings) -> (tempfile::TempDir, Arc<IndexShard>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let keyspace = Arc::new(
            fjall::Config::new(dir.path().join("keyspace"))
                .open()
                .expect("open keyspace"),
        );
        let shard = IndexShard::create(
            ShardId::new("events", 0),
            settings,
            Arc::new(RwLock::new(Mapping::new())),
            keyspace,
            dir.path().join("shard"),
        )
        .expect("create shard");
        (dir, shard)
    }

    #[test]
    fn operation_counter_gates_close() {
        let (_dir, shard) = open_shard(IndexSettings::default());
        shard.increment_operation_counter().unwrap();
        assert_eq!(shard.active_operations(), 1);
        assert!(shard.close().is_err());

        shard.decrement_operation_counter();
        shard.close().unwrap();
        assert!(matches!(
            shard.increment_operation_counter().unwrap_err(),
            ActionError::IllegalShardState { .. }
        ));
    }

    #[test]
    fn index_appends_to_translog() {
        let (_dir, shard) = open_shard(IndexSettings::default());
        let mut op = shard
            .prepare_index(
                "doc-1",
                json!({"message": "hello"}),
                crate::engine::VERSION_MATCH_ANY,
                VersionType::Internal,
                Origin::Primary,
                false,
            )
            .unwrap();
        assert!(shard.index(&mut op).unwrap());
        let location = op.translog_location().expect("location");
        assert_eq!(location.offset, 0);
        shard.sync(&location).unwrap();
        assert!(shard.translog().synced_offset() >= location.size as u64);

        let records = shard.translog().read_operations().unwrap();
        assert_eq!(records.len(), 1);
        let record: TranslogRecord = serde_json::from_slice(&records[0]).unwrap();
        assert_eq!(record.id, "doc-1");
        assert_eq!(record.version, 1);
    }

    #[test]
    fn failed_shard_rejects_operations() {
        let (_dir, shard) = open_shard(IndexSettings::default());
        shard.fail_shard(
            "test",
            &ActionError::EngineFailure { message: "io".into() },
        );
        assert!(shard
            .prepare_index(
                "doc-1",
                json!({}),
                0,
                VersionType::Internal,
                Origin::Primary,
                false
            )
            .is_err());
    }

    #[test]
    fn maybe_flush_rolls_translog_past_threshold() {
        let settings = IndexSettings {
            flush_threshold_bytes: 8,
            ..IndexSettings::default()
        };
        let (_dir, shard) = open_shard(settings);
        let mut op = shard
            .prepare_index(
                "doc-1",
                json!({"message": "a long enough payload"}),
                crate::engine::VERSION_MATCH_ANY,
                VersionType::Internal,
                Origin::Primary,
                false,
            )
            .unwrap();
        shard.index(&mut op).unwrap();
        assert!(shard.translog().should_flush());
        shard.maybe_flush();
        assert_eq!(shard.translog().size_in_bytes(), 0);
        assert_eq!(shard.translog().generation(), 2);
    }
}
