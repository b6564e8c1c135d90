//! Run configuration with all tuning parameters.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pipeline run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Size of the worker thread pool; 0 means hardware parallelism.
    pub worker_count: usize,
    /// Maximum notifications absorbed into one batch per stage.
    pub batch_cap: usize,
    /// Force every stage non-eager: no work on a key until its predecessors
    /// have finalized.
    pub deliberate_mode: bool,
    /// Default per-batch time limit; a stage can override it. An overrunning
    /// batch is treated as failed and unwound.
    pub per_stage_timeout: Option<Duration>,
    /// Trigger graceful cancellation on SIGINT/SIGTERM.
    pub cancel_on_signal: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            batch_cap: 10,
            deliberate_mode: false,
            per_stage_timeout: None,
            cancel_on_signal: false,
        }
    }
}

impl RunConfig {
    /// Create a new builder for RunConfig
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_cap == 0 {
            return Err(PipelineError::config("batch_cap must be greater than 0"));
        }
        if let Some(timeout) = self.per_stage_timeout {
            if timeout.is_zero() {
                return Err(PipelineError::config(
                    "per_stage_timeout must be nonzero when set",
                ));
            }
        }
        Ok(())
    }

    /// The worker pool size this configuration resolves to.
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            num_cpus::get().max(1)
        } else {
            self.worker_count
        }
    }
}

/// Builder for RunConfig
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RunConfig::default(),
        }
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = count;
        self
    }

    pub fn batch_cap(mut self, cap: usize) -> Self {
        self.config.batch_cap = cap;
        self
    }

    pub fn deliberate_mode(mut self, deliberate: bool) -> Self {
        self.config.deliberate_mode = deliberate;
        self
    }

    pub fn per_stage_timeout(mut self, limit: Option<Duration>) -> Self {
        self.config.per_stage_timeout = limit;
        self
    }

    pub fn cancel_on_signal(mut self, enabled: bool) -> Self {
        self.config.cancel_on_signal = enabled;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<RunConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for RunConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_cap, 10);
        assert!(config.effective_worker_count() >= 1);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = RunConfig::default();
        config.batch_cap = 0;
        assert!(config.validate().is_err());

        config.batch_cap = 10;
        config.per_stage_timeout = Some(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = RunConfig::builder()
            .worker_count(4)
            .batch_cap(32)
            .deliberate_mode(true)
            .per_stage_timeout(Some(Duration::from_secs(5)))
            .build()
            .unwrap();

        assert_eq!(config.worker_count, 4);
        assert_eq!(config.effective_worker_count(), 4);
        assert_eq!(config.batch_cap, 32);
        assert!(config.deliberate_mode);
        assert!(!config.cancel_on_signal);
    }
}
