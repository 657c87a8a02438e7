// Job graph: submission shape, runtime model and validation

pub mod model;
pub mod spec;
pub mod validator;

pub use model::{
    FailureCause, InputRef, Job, JobFailureReason, JobId, JobSnapshot, JobStatus, Task,
    TaskFailure, TaskId, TaskOutput, TaskResult, TaskStatus, UploadForm,
};
pub use spec::{InputSpec, JobSpec, TaskSpec};
pub use validator::{GraphValidationError, GraphValidator, ValidatedGraph, Violation};
