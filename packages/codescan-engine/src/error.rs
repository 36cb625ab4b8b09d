use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Fatal engine errors. Everything here aborts the run before (or instead of)
/// rule execution; per-item rule failures are *not* modeled as `EngineError`,
/// they degrade to recorded [`crate::executor::ItemFailure`] entries.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("duplicate rule identity: {0}")]
    DuplicateRule(String),

    #[error("rule '{0}' declares itself in its own need set")]
    SelfDependency(String),

    #[error("rule '{rule}' needs unregistered rule '{missing}'")]
    UnknownNeed { rule: String, missing: String },

    #[error("dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    #[error("rule '{rule}' requires tag '{tag}' which no registered rule produces")]
    UnsatisfiedRequires { rule: String, tag: String },

    #[error("engine internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Configuration errors abort before any rule executes.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EngineError::DuplicateRule(_)
                | EngineError::SelfDependency(_)
                | EngineError::UnknownNeed { .. }
                | EngineError::CycleDetected { .. }
                | EngineError::UnsatisfiedRequires { .. }
        )
    }
}
