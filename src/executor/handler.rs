//! Operation handlers.
//!
//! A handler turns the resolved inputs of a task into a result. It never
//! touches job state directly: it returns a [`TaskOutput`] or a
//! [`TaskFailure`] and the executor records the outcome.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::executor::uploads::UploadRegistry;
use crate::graph::model::{JobId, TaskFailure, TaskId, TaskOutput, UploadForm};
use crate::graph::spec::TaskSpec;

/// Output of an upstream task, as seen by a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInput {
    /// Task name for in-job inputs, task id for external ones
    pub reference: String,
    pub task_id: TaskId,
    pub output: TaskOutput,
}

/// Everything a handler may read while executing one task
#[derive(Clone)]
pub struct OperationContext {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub task_name: String,
    pub operation: String,
    /// Upstream outputs in declared order
    pub inputs: Vec<ResolvedInput>,
    pub output_format: Option<String>,
    pub options: Map<String, Value>,
    pub params: Map<String, Value>,
    /// 1-based attempt number
    pub attempt: u32,
    pub uploads: UploadRegistry,
}

impl OperationContext {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(Value::as_bool)
    }

    pub fn option(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    /// The single input of a one-input operation
    pub fn single_input(&self) -> Result<&ResolvedInput, TaskFailure> {
        match self.inputs.as_slice() {
            [input] => Ok(input),
            other => Err(TaskFailure::new(
                "invalid_input",
                format!("'{}' expects exactly one input, got {}", self.operation, other.len()),
            )),
        }
    }
}

#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Operation kind this handler serves, e.g. `convert`
    fn operation(&self) -> &str;

    /// JSON schema for the task's `options`
    fn options_schema(&self) -> Option<Value> {
        None
    }

    /// Checked at submission. The message ends up in the validation error.
    fn validate_options(&self, spec: &TaskSpec) -> Result<(), String> {
        match self.options_schema() {
            Some(schema) => validate_with_schema(&schema, &Value::Object(spec.options.clone())),
            None => Ok(()),
        }
    }

    async fn execute(&self, ctx: &OperationContext) -> Result<TaskOutput, TaskFailure>;

    /// Post-process a successful output before it is recorded
    fn produce_result(&self, _ctx: &OperationContext, output: TaskOutput) -> TaskOutput {
        output
    }

    /// Form descriptor handed to the caller at submission, for operations
    /// fed by an external upload
    fn upload_form(&self, _job_id: &str, _task_id: &str) -> Option<UploadForm> {
        None
    }

    /// Whether running the task takes one of the shared execution slots
    fn uses_slot(&self) -> bool {
        true
    }

    /// Whether the engine's per-task timeout applies. Handlers returning
    /// false bound their own waiting.
    fn honors_task_timeout(&self) -> bool {
        true
    }
}

/// Validate an instance against a JSON schema, joining every error found
pub fn validate_with_schema(schema: &Value, instance: &Value) -> Result<(), String> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| format!("invalid options schema: {e}"))?;
    let errors: Vec<String> = validator
        .iter_errors(instance)
        .map(|e| e.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Resize;

    #[async_trait]
    impl OperationHandler for Resize {
        fn operation(&self) -> &str {
            "resize"
        }

        fn options_schema(&self) -> Option<Value> {
            Some(json!({
                "type": "object",
                "properties": { "width": { "type": "integer", "minimum": 1 } },
                "required": ["width"]
            }))
        }

        async fn execute(&self, _ctx: &OperationContext) -> Result<TaskOutput, TaskFailure> {
            Ok(TaskOutput::default())
        }
    }

    #[test]
    fn test_default_validation_uses_schema() {
        let ok = TaskSpec::new("resize").option("width", 300);
        assert!(Resize.validate_options(&ok).is_ok());

        let bad = TaskSpec::new("resize").option("width", 0);
        let message = Resize.validate_options(&bad).unwrap_err();
        assert!(message.contains("minimum"), "{message}");

        assert!(Resize.validate_options(&TaskSpec::new("resize")).is_err());
    }
}
