use thiserror::Error;

use crate::graph::validator::GraphValidationError;

/// Unified error type for the job graph library
#[derive(Debug, Error)]
pub enum JobGraphError {
    /// Submission rejected before anything ran
    #[error(transparent)]
    Validation(#[from] GraphValidationError),

    /// A call across the service boundary failed (submission, query, upload)
    #[error("Transport failure during {operation}: {message}")]
    Transport {
        operation: String,
        message: String,
        retryable: bool,
    },

    /// A task's operation reported a failure
    #[error("Task {task} failed: [{code}] {message}")]
    TaskExecution {
        task: String,
        code: String,
        message: String,
    },

    /// Caller-side polling bound exhausted before the job reached a terminal state
    #[error("Polling job {job_id} timed out after {attempts} attempts")]
    PollTimeout { job_id: String, attempts: u32 },

    /// Subscribing to the event channel failed
    #[error("Subscription to '{topic}' failed: {message}")]
    Subscription { topic: String, message: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Rejected state machine transition
    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl JobGraphError {
    /// Create a transport error
    pub fn transport<O: Into<String>, M: Into<String>>(
        operation: O,
        message: M,
        retryable: bool,
    ) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
            retryable,
        }
    }

    pub fn task_execution<T: Into<String>, C: Into<String>, M: Into<String>>(
        task: T,
        code: C,
        message: M,
    ) -> Self {
        Self::TaskExecution {
            task: task.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a subscription error
    pub fn subscription<T: Into<String>, M: Into<String>>(topic: T, message: M) -> Self {
        Self::Subscription {
            topic: topic.into(),
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(kind: &'static str, id: S) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the same call can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::PollTimeout { .. } | Self::Io { .. } => true,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Transport { .. } => "transport",
            Self::TaskExecution { .. } => "task",
            Self::PollTimeout { .. } => "poll_timeout",
            Self::Subscription { .. } => "subscription",
            Self::NotFound { .. } => "not_found",
            Self::InvalidTransition { .. } => "state",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, JobGraphError>;

impl From<std::io::Error> for JobGraphError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for JobGraphError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for JobGraphError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<anyhow::Error> for JobGraphError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}
