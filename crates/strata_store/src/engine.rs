//! Versioned document engine.
//!
//! One engine wraps one fjall partition holding the documents of one shard
//! copy. Writes are versioned: the primary resolves the version under
//! `Internal` semantics and stamps the result, replicas re-apply the exact
//! stamped version under `Force` semantics so they are deterministic.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use strata_cluster::cluster::{Mapping, ShardId};

use crate::action::error::ActionError;
use crate::translog::Location;

/// Version value requesting "no concurrency check".
pub const VERSION_MATCH_ANY: u64 = 0;

/// How a requested version is interpreted against the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionType {
    /// Compare-and-set against the current version; `VERSION_MATCH_ANY`
    /// skips the check. The applied version is `current + 1`.
    Internal,
    /// The caller supplies the version; it must be beyond the current one.
    External,
    /// Apply the exact supplied version. Used on the replication and
    /// recovery paths; a copy that already advanced past it reports a
    /// conflict instead of regressing.
    Force,
}

impl VersionType {
    /// The flavor replicas apply after the primary stamped the version.
    pub fn for_replication(self) -> VersionType {
        VersionType::Force
    }

    pub fn validate_version_for_writes(self, version: u64) -> bool {
        match self {
            VersionType::Internal => true,
            VersionType::External | VersionType::Force => version > VERSION_MATCH_ANY,
        }
    }
}

/// Where an operation originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Primary,
    Replica,
    Recovery,
}

/// Stored form of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocRecord {
    pub version: u64,
    pub source: serde_json::Value,
}

/// A prepared index operation: parsed document plus any dynamic mapping
/// update the parse produced. Prepared against a snapshot of the index
/// mapping; applying it fills in the final version and translog location.
#[derive(Debug, Clone)]
pub struct IndexOperation {
    pub id: String,
    pub source: serde_json::Value,
    pub version: u64,
    pub version_type: VersionType,
    pub origin: Origin,
    pub create: bool,
    pub mapping_update: Option<Mapping>,
    applied_version: u64,
    location: Option<Location>,
}

impl IndexOperation {
    /// The version the engine applied. Only meaningful after `Engine::index`.
    pub fn version(&self) -> u64 {
        self.applied_version
    }

    pub fn translog_location(&self) -> Option<Location> {
        self.location
    }

    pub(crate) fn set_location(&mut self, location: Location) {
        self.location = Some(location);
    }
}

pub struct Engine {
    shard_id: ShardId,
    partition: fjall::PartitionHandle,
    write_lock: Mutex<()>,
}

impl Engine {
    pub fn new(shard_id: ShardId, partition: fjall::PartitionHandle) -> Self {
        Self {
            shard_id,
            partition,
            write_lock: Mutex::new(()),
        }
    }

    /// Parse `source` against `mapping` and build an operation. Fields the
    /// mapping does not know yet surface as a dynamic mapping update.
    pub fn prepare_index(
        &self,
        mapping: &Mapping,
        id: impl Into<String>,
        source: serde_json::Value,
        version: u64,
        version_type: VersionType,
        origin: Origin,
        create: bool,
    ) -> IndexOperation {
        let doc_mapping = Mapping::from_document(&source);
        let mapping_update = mapping.dynamic_update(&doc_mapping);
        IndexOperation {
            id: id.into(),
            source,
            version,
            version_type,
            origin,
            create,
            mapping_update,
            applied_version: 0,
            location: None,
        }
    }

    /// Apply a prepared operation. Returns whether the document was created
    /// (as opposed to updated) and records the applied version on the op.
    pub fn index(&self, op: &mut IndexOperation) -> Result<bool, ActionError> {
        if !op.version_type.validate_version_for_writes(op.version) {
            return Err(ActionError::EngineFailure {
                message: format!(
                    "illegal version value [{}] for version type [{:?}]",
                    op.version, op.version_type
                ),
            });
        }
        let _guard = self.write_lock.lock().expect("engine write lock poisoned");
        let existing = self.get(&op.id)?;
        let current = existing.as_ref().map(|record| record.version);
        if op.create && current.is_some() {
            return Err(ActionError::DocumentAlreadyExists {
                shard_id: self.shard_id.clone(),
                id: op.id.clone(),
            });
        }
        let applied = match op.version_type {
            VersionType::Internal => {
                let current = current.unwrap_or(VERSION_MATCH_ANY);
                if op.version != VERSION_MATCH_ANY && op.version != current {
                    return Err(self.version_conflict(&op.id, current, op.version));
                }
                current + 1
            }
            VersionType::External => {
                let current = current.unwrap_or(VERSION_MATCH_ANY);
                if op.version <= current {
                    return Err(self.version_conflict(&op.id, current, op.version));
                }
                op.version
            }
            VersionType::Force => {
                let current = current.unwrap_or(VERSION_MATCH_ANY);
                if current > op.version {
                    return Err(self.version_conflict(&op.id, current, op.version));
                }
                op.version
            }
        };
        let record = DocRecord {
            version: applied,
            source: op.source.clone(),
        };
        let value = serde_json::to_vec(&record).map_err(|err| ActionError::EngineFailure {
            message: format!("encode document [{}]: {err}", op.id),
        })?;
        self.partition
            .insert(op.id.as_bytes(), value)
            .map_err(|err| ActionError::EngineFailure {
                message: format!("write document [{}]: {err}", op.id),
            })?;
        op.applied_version = applied;
        Ok(current.is_none())
    }

    pub fn get(&self, id: &str) -> Result<Option<DocRecord>, ActionError> {
        let value = self
            .partition
            .get(id.as_bytes())
            .map_err(|err| ActionError::EngineFailure {
                message: format!("read document [{id}]: {err}"),
            })?;
        match value {
            Some(bytes) => {
                let record =
                    serde_json::from_slice(&bytes).map_err(|err| ActionError::EngineFailure {
                        message: format!("decode document [{id}]: {err}"),
                    })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn version_conflict(&self, id: &str, current: u64, provided: u64) -> ActionError {
        ActionError::VersionConflict {
            shard_id: self.shard_id.clone(),
            id: id.to_string(),
            message: format!("current version [{current}], provided [{provided}]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().expect("tempdir");
        let keyspace = fjall::Config::new(dir.path().join("keyspace"))
            .open()
            .expect("open keyspace");
        let partition = keyspace
            .open_partition("docs_events_0", fjall::PartitionCreateOptions::default())
            .expect("open partition");
        (dir, Engine::new(ShardId::new("events", 0), partition))
    }

    #[test]
    fn internal_versioning_increments() {
        let (_dir, engine) = open_engine();
        let mapping = Mapping::from_document(&json!({"message": "x"}));

        let mut op = engine.prepare_index(
            &mapping,
            "doc-1",
            json!({"message": "hello"}),
            VERSION_MATCH_ANY,
            VersionType::Internal,
            Origin::Primary,
            false,
        );
        assert!(engine.index(&mut op).unwrap());
        assert_eq!(op.version(), 1);

        let mut op = engine.prepare_index(
            &mapping,
            "doc-1",
            json!({"message": "again"}),
            VERSION_MATCH_ANY,
            VersionType::Internal,
            Origin::Primary,
            false,
        );
        assert!(!engine.index(&mut op).unwrap());
        assert_eq!(op.version(), 2);
        assert_eq!(engine.get("doc-1").unwrap().unwrap().version, 2);
    }

    #[test]
    fn internal_cas_conflicts() {
        let (_dir, engine) = open_engine();
        let mapping = Mapping::from_document(&json!({"message": "x"}));
        let mut op = engine.prepare_index(
            &mapping,
            "doc-1",
            json!({"message": "hello"}),
            VERSION_MATCH_ANY,
            VersionType::Internal,
            Origin::Primary,
            false,
        );
        engine.index(&mut op).unwrap();

        let mut stale = engine.prepare_index(
            &mapping,
            "doc-1",
            json!({"message": "stale"}),
            7,
            VersionType::Internal,
            Origin::Primary,
            false,
        );
        let err = engine.index(&mut stale).unwrap_err();
        assert!(matches!(err, ActionError::VersionConflict { .. }));
    }

    #[test]
    fn create_on_existing_conflicts() {
        let (_dir, engine) = open_engine();
        let mapping = Mapping::from_document(&json!({"message": "x"}));
        let mut op = engine.prepare_index(
            &mapping,
            "doc-1",
            json!({"message": "hello"}),
            VERSION_MATCH_ANY,
            VersionType::Internal,
            Origin::Primary,
            true,
        );
        engine.index(&mut op).unwrap();

        let mut again = engine.prepare_index(
            &mapping,
            "doc-1",
            json!({"message": "dupe"}),
            VERSION_MATCH_ANY,
            VersionType::Internal,
            Origin::Primary,
            true,
        );
        let err = engine.index(&mut again).unwrap_err();
        assert!(matches!(err, ActionError::DocumentAlreadyExists { .. }));
        assert!(err.is_conflict());
    }

    #[test]
    fn force_apply_is_deterministic_and_refuses_regression() {
        let (_dir, engine) = open_engine();
        let mapping = Mapping::from_document(&json!({"message": "x"}));

        let mut op = engine.prepare_index(
            &mapping,
            "doc-1",
            json!({"message": "v5"}),
            5,
            VersionType::Force,
            Origin::Replica,
            false,
        );
        engine.index(&mut op).unwrap();
        assert_eq!(engine.get("doc-1").unwrap().unwrap().version, 5);

        // A late, older replica delivery reports the conflict instead of
        // regressing the copy.
        let mut late = engine.prepare_index(
            &mapping,
            "doc-1",
            json!({"message": "v4"}),
            4,
            VersionType::Force,
            Origin::Replica,
            false,
        );
        let err = engine.index(&mut late).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn force_requires_concrete_version() {
        let (_dir, engine) = open_engine();
        let mapping = Mapping::new();
        let mut op = engine.prepare_index(
            &mapping,
            "doc-1",
            json!({}),
            VERSION_MATCH_ANY,
            VersionType::Force,
            Origin::Replica,
            false,
        );
        assert!(matches!(
            engine.index(&mut op).unwrap_err(),
            ActionError::EngineFailure { .. }
        ));
        assert!(!VersionType::Force.validate_version_for_writes(VERSION_MATCH_ANY));
        assert!(VersionType::Internal.validate_version_for_writes(VERSION_MATCH_ANY));
    }

    #[test]
    fn prepare_surfaces_dynamic_mapping_update() {
        let (_dir, engine) = open_engine();
        let mut mapping = Mapping::new();
        mapping.merge(&Mapping::from_document(&json!({"message": "x"})));

        let op = engine.prepare_index(
            &mapping,
            "doc-1",
            json!({"message": "hello", "count": 2}),
            VERSION_MATCH_ANY,
            VersionType::Internal,
            Origin::Primary,
            false,
        );
        let update = op.mapping_update.as_ref().expect("dynamic update");
        assert!(update.contains("count"));
        assert!(!update.contains("message"));
    }
}
