use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Attribute type tags as the remote store describes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeType {
    Bool,
    Integer,
    Decimal,
    Float,
    Text,
    Memo,
    Timestamp,
    Uuid,
    Lookup,
    OptionSet,
    Money,
}

impl AttributeType {
    pub fn type_name(&self) -> &'static str {
        match self {
            AttributeType::Bool => "bit",
            AttributeType::Integer => "bigint",
            AttributeType::Decimal => "decimal",
            AttributeType::Float => "float",
            AttributeType::Text => "nvarchar",
            AttributeType::Memo => "nvarchar(max)",
            AttributeType::Timestamp => "datetime",
            AttributeType::Uuid => "uniqueidentifier",
            AttributeType::Lookup => "lookup",
            AttributeType::OptionSet => "optionset",
            AttributeType::Money => "money",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeMetadata {
    pub logical_name: String,
    pub attribute_type: AttributeType,
    pub display_name: Option<String>,
    pub required: bool,
    /// Entities a lookup attribute may target; empty otherwise.
    pub lookup_targets: Vec<String>,
    /// Option-set values for OptionSet attributes; empty otherwise.
    pub options: Vec<OptionSetValue>,
}

impl AttributeMetadata {
    pub fn new(logical_name: impl Into<String>, attribute_type: AttributeType) -> Self {
        Self {
            logical_name: logical_name.into(),
            attribute_type,
            display_name: None,
            required: false,
            lookup_targets: Vec::new(),
            options: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionSetValue {
    pub code: i64,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipMetadata {
    pub schema_name: String,
    pub referencing_entity: String,
    pub referencing_attribute: String,
    pub referenced_entity: String,
    pub referenced_attribute: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub logical_name: String,
    pub display_name: Option<String>,
    pub primary_key: String,
    /// Timestamp column used by the adaptive aggregate partitioner.
    pub created_on_attribute: Option<String>,
    pub attributes: Vec<AttributeMetadata>,
    pub relationships: Vec<RelationshipMetadata>,
}

impl EntityMetadata {
    pub fn attribute(&self, logical_name: &str) -> Option<&AttributeMetadata> {
        self.attributes
            .iter()
            .find(|a| a.logical_name.eq_ignore_ascii_case(logical_name))
    }
}

#[derive(Default)]
struct Snapshot {
    entities: HashMap<String, Arc<EntityMetadata>>,
}

/// Process-wide, read-through schema cache. Readers take cheap immutable
/// snapshots; writers swap a copy in, so the execution hot path never holds
/// the lock across a row.
#[derive(Default)]
pub struct MetadataCache {
    inner: RwLock<Arc<Snapshot>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(&self, logical_name: &str) -> Option<Arc<EntityMetadata>> {
        let snap = self.inner.read().clone();
        snap.entities.get(&logical_name.to_lowercase()).cloned()
    }

    pub fn entity_names(&self) -> Vec<String> {
        let snap = self.inner.read().clone();
        let mut names: Vec<String> = snap
            .entities
            .values()
            .map(|e| e.logical_name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn entities(&self) -> Vec<Arc<EntityMetadata>> {
        let snap = self.inner.read().clone();
        let mut entities: Vec<_> = snap.entities.values().cloned().collect();
        entities.sort_by(|a, b| a.logical_name.cmp(&b.logical_name));
        entities
    }

    pub fn insert(&self, entity: EntityMetadata) {
        let mut guard = self.inner.write();
        let mut next = Snapshot {
            entities: guard.entities.clone(),
        };
        next.entities
            .insert(entity.logical_name.to_lowercase(), Arc::new(entity));
        *guard = Arc::new(next);
    }

    /// Drop every cached entity. Only callers invalidate; execution never
    /// does.
    pub fn invalidate(&self) {
        *self.inner.write() = Arc::new(Snapshot::default());
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> EntityMetadata {
        EntityMetadata {
            logical_name: "account".into(),
            display_name: Some("Account".into()),
            primary_key: "accountid".into(),
            created_on_attribute: Some("createdon".into()),
            attributes: vec![
                AttributeMetadata::new("accountid", AttributeType::Uuid),
                AttributeMetadata::new("name", AttributeType::Text),
            ],
            relationships: Vec::new(),
        }
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let cache = MetadataCache::new();
        cache.insert(account());
        let entity = cache.entity("Account").unwrap();
        assert_eq!(entity.primary_key, "accountid");
        assert!(entity.attribute("NAME").is_some());
    }

    #[test]
    fn test_invalidate_empties_cache() {
        let cache = MetadataCache::new();
        cache.insert(account());
        assert!(!cache.is_empty());
        cache.invalidate();
        assert!(cache.is_empty());
        assert!(cache.entity("account").is_none());
    }

    #[test]
    fn test_snapshot_survives_invalidate() {
        let cache = MetadataCache::new();
        cache.insert(account());
        let held = cache.entity("account").unwrap();
        cache.invalidate();
        assert_eq!(held.logical_name, "account");
    }
}
