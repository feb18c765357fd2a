//! Engine-wide configuration shared by every query run against a database.

/// Default number of rows pulled from the execution engine per batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;
/// Default cap on the number of candidate plans the optimizer keeps.
pub const DEFAULT_MAX_PLANS: usize = 192;

/// Tunables applied when a query does not override them through its options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum rows per batch pulled from the execution engine.
    pub batch_size: usize,
    /// Optimizer candidate cap used when `maxNumberOfPlans` is absent or non-positive.
    pub max_plans: usize,
    /// Attach a phase profile to results unless the query options say otherwise.
    pub profile: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_plans: DEFAULT_MAX_PLANS,
            profile: false,
        }
    }
}

impl EngineConfig {
    /// Small batches and profiling on; handy when stepping through queries.
    pub fn debugging() -> Self {
        Self {
            batch_size: 16,
            max_plans: DEFAULT_MAX_PLANS,
            profile: true,
        }
    }

    /// Large batches and a narrow optimizer search.
    pub fn throughput() -> Self {
        Self {
            batch_size: 10_000,
            max_plans: 32,
            profile: false,
        }
    }

    /// Returns a copy with the batch size replaced; zero is clamped to one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}
