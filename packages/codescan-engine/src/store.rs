//! Tag Store - concurrent per-artifact property bag
//!
//! The shared substrate all rules read and write. Uses DashMap for
//! fine-grained, artifact-scoped locking: two rules touching different
//! artifacts within the same stage never contend.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::artifact::ArtifactId;

/// Heterogeneous tag value: a closed variant type with typed accessors
/// instead of an untyped object reference. Read sites stay explicit about
/// the shape they expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Str(String),
    Struct(serde_json::Value),
}

impl TagValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TagValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&serde_json::Value> {
        match self {
            TagValue::Struct(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for TagValue {
    fn from(b: bool) -> Self {
        TagValue::Bool(b)
    }
}

impl From<&str> for TagValue {
    fn from(s: &str) -> Self {
        TagValue::Str(s.to_string())
    }
}

impl From<String> for TagValue {
    fn from(s: String) -> Self {
        TagValue::Str(s)
    }
}

impl From<serde_json::Value> for TagValue {
    fn from(v: serde_json::Value) -> Self {
        TagValue::Struct(v)
    }
}

/// Thread-safe tag store keyed by artifact.
///
/// Tag keys are opaque namespaced strings (`"<rule>.<fact>"` by convention).
/// Multiple rules may write the same key; last write wins, and write order
/// is fully determined by the stage order.
#[derive(Debug)]
pub struct TagStore {
    tags: DashMap<ArtifactId, DashMap<String, TagValue>>,
}

impl TagStore {
    pub fn new() -> Self {
        Self {
            tags: DashMap::new(),
        }
    }

    /// Register an artifact so it appears in the export surface even if no
    /// rule ever tags it. Called once per artifact at run start.
    pub fn register(&self, artifact: &ArtifactId) {
        self.tags.entry(artifact.clone()).or_insert_with(DashMap::new);
    }

    pub fn set_tag(&self, artifact: &ArtifactId, key: &str, value: impl Into<TagValue>) {
        self.tags
            .entry(artifact.clone())
            .or_insert_with(DashMap::new)
            .insert(key.to_string(), value.into());
    }

    pub fn get_tag(&self, artifact: &ArtifactId, key: &str) -> Option<TagValue> {
        self.tags
            .get(artifact)
            .and_then(|bag| bag.get(key).map(|v| v.clone()))
    }

    pub fn has_tag(&self, artifact: &ArtifactId, key: &str) -> bool {
        self.tags
            .get(artifact)
            .map(|bag| bag.contains_key(key))
            .unwrap_or(false)
    }

    /// Snapshot of one artifact's final tag map (for the exporter).
    pub fn tags_for(&self, artifact: &ArtifactId) -> HashMap<String, TagValue> {
        self.tags
            .get(artifact)
            .map(|bag| {
                bag.iter()
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Read-only iteration over all artifacts with their final tag maps.
    pub fn snapshot(&self) -> Vec<(ArtifactId, HashMap<String, TagValue>)> {
        let mut all: Vec<_> = self
            .tags
            .iter()
            .map(|e| {
                let bag = e
                    .value()
                    .iter()
                    .map(|t| (t.key().clone(), t.value().clone()))
                    .collect();
                (e.key().clone(), bag)
            })
            .collect();
        // Deterministic export order
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn artifact_count(&self) -> usize {
        self.tags.len()
    }
}

impl Default for TagStore {
    fn default() -> Self {
        Self::new()
    }
}
