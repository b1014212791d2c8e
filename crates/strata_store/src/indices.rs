//! Node-local index and shard registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use fjall::Keyspace;
use tracing::debug;

use strata_cluster::cluster::{IndexMetadata, IndexSettings, Mapping, ShardId};

use crate::action::error::ActionError;
use crate::shard::IndexShard;

/// All indices hosted (fully or partially) on this node, sharing one fjall
/// keyspace.
pub struct IndicesService {
    keyspace: Arc<Keyspace>,
    data_path: PathBuf,
    indices: RwLock<HashMap<String, Arc<IndexService>>>,
}

impl IndicesService {
    pub fn open(data_path: impl Into<PathBuf>) -> anyhow::Result<Arc<Self>> {
        let data_path = data_path.into();
        std::fs::create_dir_all(&data_path).context("create data dir")?;
        let keyspace = Arc::new(
            fjall::Config::new(data_path.join("keyspace"))
                .open()
                .context("open keyspace")?,
        );
        Ok(Arc::new(Self {
            keyspace,
            data_path,
            indices: RwLock::new(HashMap::new()),
        }))
    }

    /// Register an index on this node. Idempotent for the same index name.
    pub fn create_index(&self, metadata: &IndexMetadata) -> anyhow::Result<Arc<IndexService>> {
        let mut indices = self.indices.write().expect("indices lock poisoned");
        if let Some(existing) = indices.get(&metadata.index) {
            return Ok(existing.clone());
        }
        let service = Arc::new(IndexService {
            index: metadata.index.clone(),
            index_uuid: metadata.index_uuid.clone(),
            settings: metadata.settings.clone(),
            mapping: Arc::new(RwLock::new(metadata.mapping.clone())),
            keyspace: self.keyspace.clone(),
            path: self.data_path.join("indices").join(&metadata.index),
            shards: RwLock::new(HashMap::new()),
        });
        indices.insert(metadata.index.clone(), service.clone());
        debug!(index = %metadata.index, "created index service");
        Ok(service)
    }

    pub fn index_service(&self, index: &str) -> Option<Arc<IndexService>> {
        self.indices
            .read()
            .expect("indices lock poisoned")
            .get(index)
            .cloned()
    }

    pub fn index_service_safe(&self, index: &str) -> Result<Arc<IndexService>, ActionError> {
        self.index_service(index).ok_or_else(|| ActionError::IndexNotFound {
            index: index.to_string(),
        })
    }

    pub fn remove_index(&self, index: &str) {
        self.indices
            .write()
            .expect("indices lock poisoned")
            .remove(index);
    }

    /// Resolve the shard for `shard_id` on this node.
    pub fn shard_safe(&self, shard_id: &ShardId) -> Result<Arc<IndexShard>, ActionError> {
        self.index_service_safe(&shard_id.index)?.shard_safe(shard_id.shard)
    }
}

/// One index on this node: shared mapping plus the shard copies it hosts.
pub struct IndexService {
    index: String,
    index_uuid: String,
    settings: IndexSettings,
    mapping: Arc<RwLock<Mapping>>,
    keyspace: Arc<Keyspace>,
    path: PathBuf,
    shards: RwLock<HashMap<u32, Arc<IndexShard>>>,
}

impl std::fmt::Debug for IndexService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexService")
            .field("index", &self.index)
            .field("index_uuid", &self.index_uuid)
            .field("settings", &self.settings)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl IndexService {
    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn index_uuid(&self) -> &str {
        &self.index_uuid
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    /// Create the local copy of `shard`. Idempotent per shard number.
    pub fn create_shard(&self, shard: u32) -> anyhow::Result<Arc<IndexShard>> {
        let mut shards = self.shards.write().expect("shards lock poisoned");
        if let Some(existing) = shards.get(&shard) {
            return Ok(existing.clone());
        }
        let shard_id = ShardId::new(self.index.clone(), shard);
        let created = IndexShard::create(
            shard_id,
            self.settings.clone(),
            self.mapping.clone(),
            self.keyspace.clone(),
            self.path.join(shard.to_string()),
        )?;
        shards.insert(shard, created.clone());
        Ok(created)
    }

    pub fn shard(&self, shard: u32) -> Option<Arc<IndexShard>> {
        self.shards
            .read()
            .expect("shards lock poisoned")
            .get(&shard)
            .cloned()
    }

    pub fn shard_safe(&self, shard: u32) -> Result<Arc<IndexShard>, ActionError> {
        self.shard(shard).ok_or_else(|| ActionError::ShardNotFound {
            shard_id: ShardId::new(self.index.clone(), shard),
        })
    }

    pub fn remove_shard(&self, shard: u32) {
        self.shards
            .write()
            .expect("shards lock poisoned")
            .remove(&shard);
    }

    /// Snapshot of the index mapping.
    pub fn mapping(&self) -> Mapping {
        self.mapping.read().expect("mapping lock poisoned").clone()
    }

    /// Merge a mapping update into the node-local mapping.
    pub fn apply_mapping(&self, update: &Mapping) {
        self.mapping
            .write()
            .expect("mapping lock poisoned")
            .merge(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_cluster::cluster::IndexMetadata;

    #[test]
    fn index_and_shard_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let indices = IndicesService::open(dir.path()).unwrap();

        assert!(matches!(
            indices.index_service_safe("events").unwrap_err(),
            ActionError::IndexNotFound { .. }
        ));

        let metadata = IndexMetadata::new("events", "uuid-1", IndexSettings::default());
        let service = indices.create_index(&metadata).unwrap();
        assert!(matches!(
            service.shard_safe(0).unwrap_err(),
            ActionError::ShardNotFound { .. }
        ));

        let shard = service.create_shard(0).unwrap();
        assert_eq!(shard.shard_id(), &ShardId::new("events", 0));
        assert!(Arc::ptr_eq(&shard, &indices.shard_safe(&ShardId::new("events", 0)).unwrap()));

        // Creating again returns the existing copy.
        let again = service.create_shard(0).unwrap();
        assert!(Arc::ptr_eq(&shard, &again));
    }

    #[test]
    fn mapping_updates_are_shared_with_shards() {
        let dir = tempfile::tempdir().unwrap();
        let indices = IndicesService::open(dir.path()).unwrap();
        let metadata = IndexMetadata::new("events", "uuid-1", IndexSettings::default());
        let service = indices.create_index(&metadata).unwrap();
        let shard = service.create_shard(0).unwrap();

        let doc = serde_json::json!({"message": "hello"});
        let op = shard
            .prepare_index(
                "doc-1",
                doc.clone(),
                crate::engine::VERSION_MATCH_ANY,
                crate::engine::VersionType::Internal,
                crate::engine::Origin::Primary,
                false,
            )
            .unwrap();
        assert!(op.mapping_update.is_some());

        service.apply_mapping(&Mapping::from_document(&doc));
        let op = shard
            .prepare_index(
                "doc-1",
                doc,
                crate::engine::VERSION_MATCH_ANY,
                crate::engine::VersionType::Internal,
                crate::engine::Origin::Primary,
                false,
            )
            .unwrap();
        assert!(op.mapping_update.is_none());
    }
}
