//! Rule contract and registration
//!
//! Rules are the external collaborators: simple pattern detectors over
//! parsed artifacts. The engine only sees their static metadata
//! ([`RuleDescriptor`]) and the three-operation contract
//! (`identity`/`applies`/`decorate`). Descriptors are explicit values built
//! at registration time so the dependency graph can be validated before any
//! rule runs.

use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

use crate::artifact::{Artifact, ArtifactId};
use crate::entity::{Entity, EntityGraph};
use crate::error::{EngineError, Result};
use crate::store::{TagStore, TagValue};

/// Error raised by a rule's `decorate`. Deliberately separate from
/// [`EngineError`]: a rule failure aborts only its own (rule, artifact)
/// work item, never the run.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct RuleError(pub String);

impl RuleError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<&str> for RuleError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RuleError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Static per-rule metadata.
///
/// - `requires`: tag preconditions; scheduling hint, not an access-control
///   boundary. Producers of these tags are ordered into earlier stages.
/// - `need`: hard ordering on other rule identities.
/// - `produces`: tags the rule guarantees after running.
/// - `priority`: stage-internal tie-break (descending, then name ascending);
///   affects only diagnostic reproducibility, never correctness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDescriptor {
    pub name: String,
    pub requires: BTreeSet<String>,
    pub need: BTreeSet<String>,
    pub produces: BTreeSet<String>,
    pub priority: i32,
}

impl RuleDescriptor {
    pub fn builder(name: impl Into<String>) -> RuleDescriptorBuilder {
        RuleDescriptorBuilder {
            descriptor: RuleDescriptor {
                name: name.into(),
                requires: BTreeSet::new(),
                need: BTreeSet::new(),
                produces: BTreeSet::new(),
                priority: 0,
            },
        }
    }
}

/// Builder for [`RuleDescriptor`] (the explicit, reflection-free replacement
/// for annotation-style metadata).
pub struct RuleDescriptorBuilder {
    descriptor: RuleDescriptor,
}

impl RuleDescriptorBuilder {
    pub fn requires(mut self, tag: impl Into<String>) -> Self {
        self.descriptor.requires.insert(tag.into());
        self
    }

    pub fn need(mut self, rule: impl Into<String>) -> Self {
        self.descriptor.need.insert(rule.into());
        self
    }

    pub fn produces(mut self, tag: impl Into<String>) -> Self {
        self.descriptor.produces.insert(tag.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.descriptor.priority = priority;
        self
    }

    pub fn build(self) -> RuleDescriptor {
        self.descriptor
    }
}

/// Read/write surface handed to rules: the tag store plus entity resolution.
/// This is the only mutable shared state a rule may touch; everything else
/// is local to the (rule, artifact) invocation.
#[derive(Clone, Copy)]
pub struct StoreView<'a> {
    store: &'a TagStore,
    entities: &'a EntityGraph,
}

impl<'a> StoreView<'a> {
    pub(crate) fn new(store: &'a TagStore, entities: &'a EntityGraph) -> Self {
        Self { store, entities }
    }

    pub fn get_tag(&self, artifact: &ArtifactId, key: &str) -> Option<TagValue> {
        self.store.get_tag(artifact, key)
    }

    pub fn has_tag(&self, artifact: &ArtifactId, key: &str) -> bool {
        self.store.has_tag(artifact, key)
    }

    pub fn set_tag(&self, artifact: &ArtifactId, key: &str, value: impl Into<TagValue>) {
        self.store.set_tag(artifact, key, value);
    }

    /// Resolve (get-or-create) an entity by fully-qualified name. A rule may
    /// resolve zero or more entities per artifact.
    pub fn entity(&self, fq_name: &str, origin: &ArtifactId) -> Arc<Entity> {
        self.entities.get_or_create(fq_name, origin)
    }

    pub fn find_entity(&self, fq_name: &str) -> Option<Arc<Entity>> {
        self.entities.get(fq_name)
    }
}

/// The contract every inspection rule implements.
pub trait Rule: Send + Sync {
    /// Static metadata; `descriptor().name` is the rule identity used for
    /// `need` edges and diagnostics.
    fn descriptor(&self) -> RuleDescriptor;

    /// Pure applicability predicate. No side effects; safe to call any
    /// number of times and in any order relative to other rules' `applies`.
    fn applies(&self, artifact: &Artifact, view: &StoreView<'_>) -> bool;

    /// Decorate one artifact. Called only when `applies` returned true.
    /// Must handle absent `requires` tags defensively: a requirement with no
    /// registered producer is a warning, not a guarantee.
    fn decorate(&self, artifact: &Artifact, view: &StoreView<'_>)
        -> std::result::Result<(), RuleError>;
}

/// Registered rule set. Registration is where configuration errors are
/// caught: duplicate identities and self-referential `need` sets never reach
/// the scheduler.
pub struct RuleSet {
    rules: Vec<Arc<dyn Rule>>,
    descriptors: Vec<RuleDescriptor>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    pub fn register(&mut self, rule: Arc<dyn Rule>) -> Result<()> {
        let descriptor = rule.descriptor();

        if descriptor.need.contains(&descriptor.name) {
            return Err(EngineError::SelfDependency(descriptor.name));
        }
        if self.descriptors.iter().any(|d| d.name == descriptor.name) {
            return Err(EngineError::DuplicateRule(descriptor.name));
        }

        self.descriptors.push(descriptor);
        self.rules.push(rule);
        Ok(())
    }

    pub fn descriptors(&self) -> &[RuleDescriptor] {
        &self.descriptors
    }

    pub fn rule(&self, index: usize) -> &Arc<dyn Rule> {
        &self.rules[index]
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopRule {
        descriptor: RuleDescriptor,
    }

    impl Rule for NoopRule {
        fn descriptor(&self) -> RuleDescriptor {
            self.descriptor.clone()
        }

        fn applies(&self, _artifact: &Artifact, _view: &StoreView<'_>) -> bool {
            true
        }

        fn decorate(
            &self,
            _artifact: &Artifact,
            _view: &StoreView<'_>,
        ) -> std::result::Result<(), RuleError> {
            Ok(())
        }
    }

    fn noop(descriptor: RuleDescriptor) -> Arc<dyn Rule> {
        Arc::new(NoopRule { descriptor })
    }

    #[test]
    fn test_descriptor_builder() {
        let d = RuleDescriptor::builder("jndi-detect")
            .requires("parse.is_source")
            .need("Parse")
            .produces("jndi.lookup")
            .priority(10)
            .build();

        assert_eq!(d.name, "jndi-detect");
        assert!(d.requires.contains("parse.is_source"));
        assert!(d.need.contains("Parse"));
        assert!(d.produces.contains("jndi.lookup"));
        assert_eq!(d.priority, 10);
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let mut rules = RuleSet::new();
        rules
            .register(noop(RuleDescriptor::builder("R").build()))
            .unwrap();

        let err = rules
            .register(noop(RuleDescriptor::builder("R").build()))
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateRule(name) if name == "R"));
    }

    #[test]
    fn test_self_need_rejected_at_registration() {
        let mut rules = RuleSet::new();
        let err = rules
            .register(noop(RuleDescriptor::builder("R").need("R").build()))
            .unwrap_err();
        assert!(matches!(err, EngineError::SelfDependency(name) if name == "R"));
    }
}
