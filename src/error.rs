use std::time::Duration;
use thiserror::Error;

/// Errors observable at the pipeline boundary.
///
/// `Transform` and `BatchTimeout` are contained at the stage that produced
/// them (the batch is skipped); they surface here so call sites can log and
/// count them. `Protocol` and the configuration variants abort the run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("transform failed at stage {stage}: {reason}")]
    Transform { stage: usize, reason: String },

    #[error("batch at stage {stage} ran {elapsed:?}, over the {limit:?} limit")]
    BatchTimeout {
        stage: usize,
        elapsed: Duration,
        limit: Duration,
    },

    #[error("protocol violation at stage {stage}: {detail}")]
    Protocol { stage: usize, detail: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("generation vector has {found} slots, pipeline has {expected} stages")]
    GensLength { expected: usize, found: usize },

    #[error("stage instance already added at index {index}")]
    DuplicateStage { index: usize },

    #[error("step added after the run started")]
    AddStepAfterStart,

    #[error("run already executed; a Run is single-use")]
    RunReused,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a protocol violation for a stage
    pub fn protocol(stage: usize, detail: impl Into<String>) -> Self {
        Self::Protocol {
            stage,
            detail: detail.into(),
        }
    }

    /// Whether this error aborts the whole run rather than a single batch
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::Config(_)
                | Self::GensLength { .. }
                | Self::DuplicateStage { .. }
                | Self::AddStepAfterStart
                | Self::RunReused
        )
    }
}

/// Result type alias for PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(PipelineError::protocol(1, "bad vector").is_fatal());
        assert!(PipelineError::config("no steps").is_fatal());
        assert!(PipelineError::RunReused.is_fatal());

        let contained = PipelineError::Transform {
            stage: 0,
            reason: "boom".to_string(),
        };
        assert!(!contained.is_fatal());

        let timeout = PipelineError::BatchTimeout {
            stage: 2,
            elapsed: Duration::from_millis(50),
            limit: Duration::from_millis(10),
        };
        assert!(!timeout.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = PipelineError::GensLength {
            expected: 3,
            found: 2,
        };
        let display = err.to_string();
        assert!(display.contains('3'));
        assert!(display.contains('2'));
    }
}
