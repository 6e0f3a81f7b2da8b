use serde::Serialize;

use crate::limiter::DEFAULT_MAX_PARALLEL;
use crate::retry::RetryPolicy;

/// Workload knobs shared by every run mode.
#[derive(Debug, Clone, Serialize)]
pub struct HarnessConfig {
    /// Total CRUD tasks for a run.
    pub requests: u64,
    /// Tasks per batch in convergence mode.
    pub insert_count: u64,
    /// Bound on concurrently running tasks.
    pub parallelism: usize,
    pub insert_only: bool,
    /// Issue a whole-table count at the end of the run.
    pub final_count: bool,
    /// Group keys are drawn from `user0..user{group_key_space - 1}`.
    pub group_key_space: u32,
    /// Budget for the per-batch count comparison.
    pub verify: RetryPolicy,
    /// Per-task view row comparison after the update step.
    pub view_check: Option<RetryPolicy>,
    /// 0 draws a random seed.
    pub seed: u64,
    pub select_iterations: u64,
    pub select_limit: i64,
    /// Load mode logs progress every this many submitted tasks.
    pub progress_every: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            requests: 1000,
            insert_count: 1000,
            parallelism: DEFAULT_MAX_PARALLEL,
            insert_only: false,
            final_count: false,
            group_key_space: 10_000,
            verify: RetryPolicy::default(),
            view_check: None,
            seed: 0,
            select_iterations: 10_000,
            select_limit: 100,
            progress_every: 10_000,
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.parallelism > 0, "parallelism must be > 0");
        anyhow::ensure!(self.insert_count > 0, "insert_count must be > 0");
        anyhow::ensure!(self.group_key_space > 0, "group_key_space must be > 0");
        anyhow::ensure!(self.select_limit > 0, "select_limit must be > 0");
        anyhow::ensure!(self.progress_every > 0, "progress_every must be > 0");
        Ok(())
    }

    /// Batch sizes for a convergence run: full batches followed by the remainder.
    pub fn batch_sizes(&self) -> Vec<u64> {
        if self.insert_count == 0 {
            return Vec::new();
        }
        let full = self.requests / self.insert_count;
        let rest = self.requests % self.insert_count;
        let mut sizes = vec![self.insert_count; full as usize];
        if rest > 0 {
            sizes.push(rest);
        }
        sizes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = HarnessConfig::default();
        config.validate().expect("valid");
        assert_eq!(config.batch_sizes(), vec![1000]);
        assert_eq!(config.verify.max_retries, 100);
    }

    #[test]
    fn remainder_runs_as_short_final_batch() {
        let config = HarnessConfig {
            requests: 2500,
            insert_count: 1000,
            ..HarnessConfig::default()
        };
        assert_eq!(config.batch_sizes(), vec![1000, 1000, 500]);

        let config = HarnessConfig {
            requests: 0,
            ..HarnessConfig::default()
        };
        assert!(config.batch_sizes().is_empty());
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let config = HarnessConfig {
            parallelism: 0,
            ..HarnessConfig::default()
        };
        let err = config.validate().expect_err("invalid");
        assert!(err.to_string().contains("parallelism"));
    }
}
