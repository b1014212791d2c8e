//! Per-index metadata: settings, mappings, and alias resolution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// When translog writes become durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranslogDurability {
    /// Fsync before acknowledging each request.
    Request,
    /// Fsync in the background.
    Async,
}

/// Typed index settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSettings {
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    /// Shadow replicas share storage with the primary and are skipped by the
    /// replication phase.
    pub shadow_replicas: bool,
    pub translog_durability: TranslogDurability,
    /// Translog size at which the shard asks for a flush.
    pub flush_threshold_bytes: u64,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            number_of_shards: 1,
            number_of_replicas: 1,
            shadow_replicas: false,
            translog_durability: TranslogDurability::Request,
            flush_threshold_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Scalar type recorded for a mapped field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Text,
    Long,
    Double,
    Boolean,
    Object,
}

/// Field name to type map for an index.
///
/// Mappings only grow; a dynamic update carries the fields a document
/// introduced that the current mapping does not know yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    fields: BTreeMap<String, FieldType>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn field_type(&self, field: &str) -> Option<FieldType> {
        self.fields.get(field).copied()
    }

    pub fn insert(&mut self, field: impl Into<String>, field_type: FieldType) {
        self.fields.insert(field.into(), field_type);
    }

    /// Merge `update` into this mapping. Existing fields keep their type.
    pub fn merge(&mut self, update: &Mapping) {
        for (field, field_type) in &update.fields {
            self.fields.entry(field.clone()).or_insert(*field_type);
        }
    }

    /// Derive a mapping from the top-level fields of a JSON document.
    pub fn from_document(source: &serde_json::Value) -> Self {
        let mut mapping = Mapping::new();
        if let serde_json::Value::Object(map) = source {
            for (field, value) in map {
                let field_type = match value {
                    serde_json::Value::Bool(_) => FieldType::Boolean,
                    serde_json::Value::Number(n) if n.is_f64() => FieldType::Double,
                    serde_json::Value::Number(_) => FieldType::Long,
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => FieldType::Object,
                    _ => FieldType::Text,
                };
                mapping.insert(field.clone(), field_type);
            }
        }
        mapping
    }

    /// Fields of `other` that this mapping does not contain yet, or `None` if
    /// everything is covered.
    pub fn dynamic_update(&self, other: &Mapping) -> Option<Mapping> {
        let mut update = Mapping::new();
        for (field, field_type) in &other.fields {
            if !self.contains(field) {
                update.insert(field.clone(), *field_type);
            }
        }
        if update.is_empty() {
            None
        } else {
            Some(update)
        }
    }
}

/// Metadata for one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub index: String,
    pub index_uuid: String,
    pub settings: IndexSettings,
    pub mapping: Mapping,
}

impl IndexMetadata {
    pub fn new(index: impl Into<String>, index_uuid: impl Into<String>, settings: IndexSettings) -> Self {
        Self {
            index: index.into(),
            index_uuid: index_uuid.into(),
            settings,
            mapping: Mapping::new(),
        }
    }
}

/// Index metadata and alias registry for a cluster-state snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    indices: BTreeMap<String, IndexMetadata>,
    aliases: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_index(&mut self, metadata: IndexMetadata) {
        self.indices.insert(metadata.index.clone(), metadata);
    }

    pub fn remove_index(&mut self, index: &str) {
        self.indices.remove(index);
    }

    pub fn add_alias(&mut self, alias: impl Into<String>, index: impl Into<String>) {
        self.aliases.insert(alias.into(), index.into());
    }

    pub fn index(&self, index: &str) -> Option<&IndexMetadata> {
        self.indices.get(index)
    }

    pub fn index_mut(&mut self, index: &str) -> Option<&mut IndexMetadata> {
        self.indices.get_mut(index)
    }

    pub fn indices(&self) -> impl Iterator<Item = &IndexMetadata> {
        self.indices.values()
    }

    /// Resolve `name` (an index name or alias) to a concrete index name.
    pub fn resolve_concrete_index<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        if self.indices.contains_key(name) {
            return Some(name);
        }
        self.aliases
            .get(name)
            .filter(|target| self.indices.contains_key(*target))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mapping_from_document_types() {
        let mapping = Mapping::from_document(&json!({
            "message": "hello",
            "count": 3,
            "ratio": 0.5,
            "enabled": true,
            "nested": {"a": 1}
        }));
        assert_eq!(mapping.field_type("message"), Some(FieldType::Text));
        assert_eq!(mapping.field_type("count"), Some(FieldType::Long));
        assert_eq!(mapping.field_type("ratio"), Some(FieldType::Double));
        assert_eq!(mapping.field_type("enabled"), Some(FieldType::Boolean));
        assert_eq!(mapping.field_type("nested"), Some(FieldType::Object));
    }

    #[test]
    fn dynamic_update_only_reports_new_fields() {
        let mut known = Mapping::new();
        known.insert("message", FieldType::Text);

        let doc = Mapping::from_document(&json!({"message": "hi", "count": 1}));
        let update = known.dynamic_update(&doc).unwrap();
        assert_eq!(update.len(), 1);
        assert!(update.contains("count"));

        known.merge(&update);
        assert!(known.dynamic_update(&doc).is_none());
    }

    #[test]
    fn alias_resolution() {
        let mut metadata = Metadata::new();
        metadata.add_index(IndexMetadata::new("events-000001", "uuid-1", IndexSettings::default()));
        metadata.add_alias("events", "events-000001");
        metadata.add_alias("dangling", "missing");

        assert_eq!(metadata.resolve_concrete_index("events-000001"), Some("events-000001"));
        assert_eq!(metadata.resolve_concrete_index("events"), Some("events-000001"));
        assert_eq!(metadata.resolve_concrete_index("dangling"), None);
        assert_eq!(metadata.resolve_concrete_index("missing"), None);
    }
}
