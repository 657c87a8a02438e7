// Core infrastructure: errors, configuration, logging
pub mod core;

// Job graph model, submission shape and validation
pub mod graph;

// Dependency bookkeeping
pub mod scheduler;

// Operation handlers and the job runner
pub mod executor;

// Authoritative state and event notification
pub mod tracker;

// Facade used by embedding applications
pub mod service;

// Re-exports for convenience
pub use crate::core::{
    init_logging, ConfigOverrides, EngineConfig, EngineConfigBuilder, JobGraphError, Result,
    RetryStrategy,
};
pub use crate::executor::{
    OperationContext, OperationHandler, OperationRegistry, ResolvedInput, UploadedFile,
};
pub use crate::graph::{
    FailureCause, InputRef, JobFailureReason, JobSnapshot, JobSpec, JobStatus, Task, TaskFailure,
    TaskOutput, TaskResult, TaskSpec, TaskStatus, UploadForm,
};
pub use crate::scheduler::{Scheduler, SchedulerStep};
pub use crate::service::{JobService, PollOptions, PollOutcome, StatusReport};
pub use crate::tracker::{Delivery, EventEnvelope, JobEvent, Subscription, Topic};
