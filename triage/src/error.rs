//! Error taxonomy for stage calls and the pipeline.
//!
//! ## Stage errors
//!
//! | Kind                     | Retriable |
//! |--------------------------|-----------|
//! | Timeout                  | yes       |
//! | ProviderError(transient) | yes       |
//! | ProviderError(permanent) | no        |
//! | InvalidInput             | no        |
//!
//! ## Pipeline errors
//!
//! Stage-local problems are absorbed into workflow flags. Only persistence
//! failures and broken engine invariants are hard failures that reach the
//! dispatcher.

use std::fmt;

use thiserror::Error;

use crate::state_machine::IllegalTransition;

/// Classification used by the invocation wrapper to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    /// Call exceeded its deadline.
    Timeout,
    /// Provider hiccup (rate limit, 5xx, connection reset).
    Transient,
    /// Request was rejected as malformed; retrying cannot help.
    InvalidInput,
    /// Provider failed in a way that will not heal on retry.
    Permanent,
}

impl RetryCategory {
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Timeout | Self::Transient)
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Transient => write!(f, "transient"),
            Self::InvalidInput => write!(f, "invalid_input"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Failure of a single Stage Capability call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StageError {
    #[error("Stage call timed out after {0} ms")]
    Timeout(u64),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Provider error: {message}")]
    ProviderError { message: String, retriable: bool },
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::ProviderError {
            message: message.into(),
            retriable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::ProviderError {
            message: message.into(),
            retriable: false,
        }
    }

    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Timeout(_) => RetryCategory::Timeout,
            Self::InvalidInput(_) => RetryCategory::InvalidInput,
            Self::ProviderError {
                retriable: true, ..
            } => RetryCategory::Transient,
            Self::ProviderError {
                retriable: false, ..
            } => RetryCategory::Permanent,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.retry_category().is_retriable()
    }
}

/// Pipeline-level error classes.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Provider kept failing after every retry (absorbed into fallbacks).
    #[error("Transient provider error in {stage} after {attempts} attempts: {last_error}")]
    TransientProviderError {
        stage: String,
        attempts: u32,
        last_error: StageError,
    },

    #[error("Low classification confidence {confidence:.2} (threshold {threshold:.2})")]
    LowConfidence { confidence: f64, threshold: f64 },

    #[error("Contradictory signals: {0}")]
    ContradictorySignals(String),

    #[error("Validation loop exhausted after {0} drafts")]
    ValidationLoopExhausted(u32),

    /// Durable recording of a finished workflow failed; decisions are kept
    /// and the resolution is queued for manual reprocessing.
    #[error("Persistence failure for workflow {workflow_id}: {message}")]
    PersistenceFailure {
        workflow_id: String,
        message: String,
    },

    #[error("Workflow exceeded its overall budget of {0} ms")]
    OverallTimeout(u64),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("Priority score {0} out of range 1..=5")]
    PriorityOutOfRange(u8),

    #[error("Invariant violated: {0}")]
    InvariantViolated(String),

    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),
}

impl PipelineError {
    /// Whether this error must surface to the operator layer.
    pub fn is_hard_failure(&self) -> bool {
        matches!(
            self,
            Self::PersistenceFailure { .. }
                | Self::IllegalTransition(_)
                | Self::PriorityOutOfRange(_)
                | Self::InvariantViolated(_)
        )
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid environment override {var}={value}")]
    Env { var: String, value: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}
