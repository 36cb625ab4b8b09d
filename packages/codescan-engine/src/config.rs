use serde::{Deserialize, Serialize};

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker threads for the stage pool.
    pub worker_threads: usize,
    /// Stop dispatching further stages after a stage records any failure.
    /// The failing stage still runs to completion (the barrier holds).
    pub fail_fast: bool,
    /// Treat a `requires` tag with no registered producer as a fatal
    /// configuration error instead of a warning.
    pub unsatisfied_requires_fatal: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: (num_cpus::get() * 3 / 4).max(1), // 75% of cores
            fail_fast: false,
            unsatisfied_requires_fatal: false,
        }
    }
}
