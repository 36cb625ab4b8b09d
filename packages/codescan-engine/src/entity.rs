//! Entity Graph - identity-stable registry for higher-level analysis units
//!
//! An entity is a unit larger than one artifact (typically one node per
//! fully-qualified type) that several rules, possibly running against
//! different artifacts in the same stage, accumulate properties onto.
//! `get_or_create` is the single-creator guarantee: the same name always
//! resolves to the same `Arc<Entity>` within a run.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::artifact::ArtifactId;
use crate::store::TagValue;

/// Higher-level analysis unit with identity stable across artifacts.
pub struct Entity {
    fq_name: String,
    origin: ArtifactId,
    properties: DashMap<String, TagValue>,
}

impl Entity {
    fn new(fq_name: String, origin: ArtifactId) -> Self {
        Self {
            fq_name,
            origin,
            properties: DashMap::new(),
        }
    }

    pub fn fq_name(&self) -> &str {
        &self.fq_name
    }

    /// Artifact that first caused this entity to be created.
    pub fn origin(&self) -> &ArtifactId {
        &self.origin
    }

    pub fn set_property(&self, key: &str, value: impl Into<TagValue>) {
        self.properties.insert(key.to_string(), value.into());
    }

    pub fn get_property(&self, key: &str) -> Option<TagValue> {
        self.properties.get(key).map(|v| v.clone())
    }

    /// Snapshot of the final property map (for the exporter).
    pub fn properties(&self) -> HashMap<String, TagValue> {
        self.properties
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("fq_name", &self.fq_name)
            .field("origin", &self.origin)
            .field("properties", &self.properties.len())
            .finish()
    }
}

/// Registry of entities keyed by fully-qualified name.
#[derive(Debug)]
pub struct EntityGraph {
    entities: DashMap<String, Arc<Entity>>,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
        }
    }

    /// Get-or-create by fully-qualified name, atomic with respect to
    /// concurrent creation from stage-parallel work items. Readers never
    /// observe a partially-initialized entity: the `Arc` is fully built
    /// before the map entry becomes visible.
    pub fn get_or_create(&self, fq_name: &str, origin: &ArtifactId) -> Arc<Entity> {
        self.entities
            .entry(fq_name.to_string())
            .or_insert_with(|| Arc::new(Entity::new(fq_name.to_string(), origin.clone())))
            .clone()
    }

    pub fn get(&self, fq_name: &str) -> Option<Arc<Entity>> {
        self.entities.get(fq_name).map(|e| e.clone())
    }

    /// Read-only iteration over all entities, sorted by name for
    /// deterministic export.
    pub fn snapshot(&self) -> Vec<Arc<Entity>> {
        let mut all: Vec<_> = self.entities.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.fq_name().cmp(b.fq_name()));
        all
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for EntityGraph {
    fn default() -> Self {
        Self::new()
    }
}
