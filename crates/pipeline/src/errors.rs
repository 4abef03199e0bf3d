//! Top-level error type for the Conduit pipeline engine.
//!
//! [`PipelineError`] covers every condition that can stop a pipeline run:
//! misconfiguration detected at build time, resolution failures at the
//! resource-resolver boundary, failures raised by step bodies, filters and
//! branches, and cooperative cancellation.
//!
//! Channel-specific failures are defined next to the channel in
//! [`crate::channel::ChannelError`] and convert into
//! [`PipelineError::Channel`].

use thiserror::Error;

use crate::channel::ChannelError;

/// Boxed error accepted from user code (step bodies, predicates, jobs).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The outcome of one step, one branch, or a whole pipeline run.
pub type StepResult = Result<(), PipelineError>;

// ---------------------------------------------------------------------------
// Pipeline-level errors
// ---------------------------------------------------------------------------

/// Errors produced while building or running a pipeline.
///
/// Errors propagate outward through every enclosing step (each step observes
/// them through its inspectors' `on_exception` hook) until they reach the
/// caller of [`crate::Pipeline::run`] or the nearest `try_*` construct.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The pipeline was assembled incorrectly.
    ///
    /// Produced by: building twice, wrapping a step when none exists,
    /// attaching a filter chain twice, a fan-out step without its input
    /// filter, invalid chunk sizes, unknown registry names.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// The resource resolver has no registration for the requested type.
    ///
    /// Never caught by the engine.
    #[error("Service not found: {type_name}")]
    ServiceNotFound {
        /// Rust type name of the requested service.
        type_name: &'static str,
    },

    /// A step body, filter, inspector or job failed.
    #[error("Step execution failed: {source}")]
    StepExecution {
        /// The underlying failure raised by user code.
        #[source]
        source: BoxError,
    },

    /// A skip condition or branch predicate failed while being evaluated.
    #[error("Predicate evaluation failed: {source}")]
    PredicateEvaluation {
        /// The underlying failure raised by the predicate.
        #[source]
        source: BoxError,
    },

    /// A concurrently running branch panicked.
    #[error("Branch panicked: {message}")]
    BranchPanicked {
        /// Panic payload, when it was a string.
        message: String,
    },

    /// A channel operation failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The run was cancelled through its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Creates a [`PipelineError::Configuration`] from a message.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Wraps an arbitrary error raised by user code as a step failure.
    pub fn step(source: impl Into<BoxError>) -> Self {
        Self::StepExecution {
            source: source.into(),
        }
    }

    /// Wraps an error raised by a predicate.
    pub fn predicate(source: impl Into<BoxError>) -> Self {
        Self::PredicateEvaluation {
            source: source.into(),
        }
    }

    /// Returns `true` for [`PipelineError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` for [`PipelineError::Configuration`].
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}
