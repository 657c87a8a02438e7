// Operation execution: handler trait, registry, built-ins and the job runner

pub mod handler;
pub mod operations;
pub mod registry;
pub mod runner;
pub mod uploads;

pub use handler::{validate_with_schema, OperationContext, OperationHandler, ResolvedInput};
pub use operations::register_builtin_operations;
pub use registry::OperationRegistry;
pub use runner::JobExecutor;
pub use uploads::{UploadRegistry, UploadedFile};
