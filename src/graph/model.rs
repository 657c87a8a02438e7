use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// Type aliases
pub type JobId = String;
pub type TaskId = String;

/// Generate a job or task id
pub fn generate_id() -> String {
    cuid2::create_id()
}

/// Task lifecycle: pending -> waiting -> running -> {completed, failed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    /// Waiting on upstream dependencies or an execution slot
    Waiting,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate job status, always derived from the task statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// completed iff every task completed; failed iff some task failed and
    /// every task is terminal; pending while no task has moved.
    pub fn derive(tasks: &[Task]) -> JobStatus {
        if tasks.iter().all(|t| t.status == TaskStatus::Completed) {
            return JobStatus::Completed;
        }
        let all_terminal = tasks.iter().all(|t| t.status.is_terminal());
        if all_terminal {
            return JobStatus::Failed;
        }
        if tasks.iter().all(|t| t.status == TaskStatus::Pending) {
            JobStatus::Pending
        } else {
            JobStatus::Running
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A resolved input reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputRef {
    /// Another task of the same job, by name
    Task(String),
    /// A task of another job, by id
    External(TaskId),
}

impl InputRef {
    pub fn key(&self) -> &str {
        match self {
            InputRef::Task(name) => name,
            InputRef::External(id) => id,
        }
    }
}

/// Upload form descriptor handed out for `import/upload` tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadForm {
    pub url: String,
    pub parameters: BTreeMap<String, String>,
}

/// Success payload of a task: location plus metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form: Option<UploadForm>,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl TaskOutput {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn with_form(form: UploadForm) -> Self {
        Self {
            form: Some(form),
            ..Default::default()
        }
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// File format (extension) of the produced file, if known
    pub fn format(&self) -> Option<&str> {
        self.metadata.get("format").and_then(Value::as_str)
    }

    pub fn filename(&self) -> Option<&str> {
        self.metadata.get("filename").and_then(Value::as_str)
    }
}

pub const CODE_DEPENDENCY_FAILED: &str = "dependency_failed";
pub const CODE_CANCELLED: &str = "cancelled";
pub const CODE_UPLOAD_FAILED: &str = "upload_failed";
pub const CODE_TIMEOUT: &str = "timeout";

/// Failure payload of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    #[serde(rename = "errorCode")]
    pub error_code: String,
    pub msg: String,
    /// Whether the executor may run the operation again
    #[serde(skip)]
    pub retryable: bool,
}

impl TaskFailure {
    pub fn new(error_code: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            msg: msg.into(),
            retryable: false,
        }
    }

    pub fn retryable(error_code: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(error_code, msg)
        }
    }

    pub fn propagated(upstream: &str) -> Self {
        Self::new(
            CODE_DEPENDENCY_FAILED,
            format!("upstream task '{upstream}' failed"),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(CODE_CANCELLED, "job was cancelled")
    }

    pub fn upload_failed(reason: impl Into<String>) -> Self {
        Self::new(CODE_UPLOAD_FAILED, reason)
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] - {}", self.error_code, self.msg.trim())
    }
}

/// Result object exposed on a task (or job)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskResult {
    Failure(TaskFailure),
    Output(TaskOutput),
}

impl TaskResult {
    pub fn output(&self) -> Option<&TaskOutput> {
        match self {
            TaskResult::Output(out) => Some(out),
            TaskResult::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            TaskResult::Failure(err) => Some(err),
            TaskResult::Output(_) => None,
        }
    }
}

/// Why a task ended up failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// The operation itself failed
    Execution,
    /// An upstream task failed; this one never ran
    Propagated { upstream: String },
    Cancelled,
    /// The external upload never arrived or was rejected
    Upload,
}

/// Superset of job-level failure reasons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum JobFailureReason {
    TaskFailure { task: String, error: TaskFailure },
    Cancelled,
    UploadFailed { task: String, error: TaskFailure },
}

impl JobFailureReason {
    pub fn error(&self) -> TaskFailure {
        match self {
            JobFailureReason::TaskFailure { error, .. }
            | JobFailureReason::UploadFailed { error, .. } => error.clone(),
            JobFailureReason::Cancelled => TaskFailure::cancelled(),
        }
    }
}

/// A task and its current state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub job_id: JobId,
    pub operation: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn output(&self) -> Option<&TaskOutput> {
        self.result.as_ref().and_then(TaskResult::output)
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        self.result.as_ref().and_then(TaskResult::failure)
    }
}

/// A job: tasks in submission order
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub tag: Option<String>,
    pub tasks: Vec<Task>,
    pub created_at: DateTime<Utc>,
    /// Set once the job was cancelled by a caller
    pub cancelled: bool,
}

impl Job {
    pub fn new(id: JobId, tag: Option<String>, tasks: Vec<Task>) -> Self {
        Self {
            id,
            tag,
            tasks,
            created_at: Utc::now(),
            cancelled: false,
        }
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::derive(&self.tasks)
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Last task in submission order that no other task of the job consumes
    pub fn final_task(&self) -> Option<&Task> {
        let consumed: HashSet<&str> = self
            .tasks
            .iter()
            .flat_map(|t| t.inputs.iter())
            .filter_map(|input| match input {
                InputRef::Task(name) => Some(name.as_str()),
                InputRef::External(_) => None,
            })
            .collect();
        self.tasks
            .iter()
            .rev()
            .find(|t| !consumed.contains(t.name.as_str()))
    }

    /// Reason a failed job failed: cancellation, else the earliest task that
    /// failed on its own (ties broken by submission order).
    pub fn failure_reason(&self) -> Option<JobFailureReason> {
        if self.status() != JobStatus::Failed {
            return None;
        }
        if self.cancelled {
            return Some(JobFailureReason::Cancelled);
        }
        let root = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| matches!(t.cause, Some(FailureCause::Execution | FailureCause::Upload)))
            .min_by_key(|(idx, t)| (t.ended_at, *idx))
            .map(|(_, t)| t);

        if let Some(task) = root {
            let error = task
                .failure()
                .cloned()
                .unwrap_or_else(|| TaskFailure::new("unknown", "task failed"));
            return Some(match task.cause {
                Some(FailureCause::Upload) => JobFailureReason::UploadFailed {
                    task: task.name.clone(),
                    error,
                },
                _ => JobFailureReason::TaskFailure {
                    task: task.name.clone(),
                    error,
                },
            });
        }

        // Only propagated failures left: an external input failed
        self.tasks
            .iter()
            .find(|t| t.status == TaskStatus::Failed)
            .map(|task| JobFailureReason::TaskFailure {
                task: task.name.clone(),
                error: task
                    .failure()
                    .cloned()
                    .unwrap_or_else(|| TaskFailure::new(CODE_DEPENDENCY_FAILED, "input failed")),
            })
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let status = self.status();
        let failure = self.failure_reason();
        let result = match status {
            JobStatus::Completed => self
                .final_task()
                .and_then(|t| t.output().cloned())
                .map(TaskResult::Output),
            JobStatus::Failed => failure.as_ref().map(|f| TaskResult::Failure(f.error())),
            _ => None,
        };
        JobSnapshot {
            id: self.id.clone(),
            tag: self.tag.clone(),
            status,
            created_at: self.created_at,
            tasks: self.tasks.clone(),
            result,
            failure,
        }
    }
}

/// Point-in-time view of a job, as returned by status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailureReason>,
}

impl JobSnapshot {
    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn task_by_id(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn task(name: &str, status: TaskStatus, inputs: &[&str]) -> Task {
        Task {
            id: format!("id-{name}"),
            name: name.to_string(),
            job_id: "job".to_string(),
            operation: "convert".to_string(),
            inputs: inputs.iter().map(|n| InputRef::Task(n.to_string())).collect(),
            output_format: None,
            options: Map::new(),
            params: Map::new(),
            status,
            result: None,
            cause: None,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    fn job(tasks: Vec<Task>) -> Job {
        Job::new("job".to_string(), None, tasks)
    }

    #[test]
    fn test_job_status_derivation() {
        use TaskStatus::*;
        let cases = [
            (vec![Pending, Pending], JobStatus::Pending),
            (vec![Running, Waiting], JobStatus::Running),
            (vec![Completed, Pending], JobStatus::Running),
            (vec![Completed, Completed], JobStatus::Completed),
            (vec![Failed, Running], JobStatus::Running),
            (vec![Failed, Completed], JobStatus::Failed),
        ];
        for (statuses, expected) in cases {
            let tasks: Vec<Task> = statuses
                .iter()
                .enumerate()
                .map(|(i, s)| task(&format!("t{i}"), *s, &[]))
                .collect();
            assert_eq!(JobStatus::derive(&tasks), expected, "{statuses:?}");
        }
    }

    #[test]
    fn test_final_task_is_last_unconsumed() {
        let j = job(vec![
            task("import", TaskStatus::Completed, &[]),
            task("thumb", TaskStatus::Completed, &["import"]),
            task("export", TaskStatus::Completed, &["import"]),
        ]);
        assert_eq!(j.final_task().map(|t| t.name.as_str()), Some("export"));
    }

    #[test]
    fn test_failure_reason_prefers_root_cause() {
        let mut failed = task("convert", TaskStatus::Failed, &["import"]);
        failed.cause = Some(FailureCause::Execution);
        failed.result = Some(TaskResult::Failure(TaskFailure::new("422", "bad input")));
        let mut export = task("export", TaskStatus::Failed, &["convert"]);
        export.cause = Some(FailureCause::Propagated {
            upstream: "convert".to_string(),
        });
        export.result = Some(TaskResult::Failure(TaskFailure::propagated("convert")));

        let j = job(vec![task("import", TaskStatus::Completed, &[]), failed, export]);
        let snap = j.snapshot();
        assert_eq!(snap.status, JobStatus::Failed);
        assert_eq!(
            snap.failure,
            Some(JobFailureReason::TaskFailure {
                task: "convert".to_string(),
                error: TaskFailure::new("422", "bad input"),
            })
        );
        assert_eq!(
            serde_json::to_value(&snap.result).unwrap(),
            json!({"errorCode": "422", "msg": "bad input"})
        );
    }

    #[test]
    fn test_cancelled_job_reports_cancellation() {
        let mut j = job(vec![task("import", TaskStatus::Failed, &[])]);
        j.cancelled = true;
        assert_eq!(j.failure_reason(), Some(JobFailureReason::Cancelled));
        assert_eq!(
            j.snapshot().result,
            Some(TaskResult::Failure(TaskFailure::cancelled()))
        );
    }

    #[test]
    fn test_task_result_wire_shape() {
        let ok: TaskResult = serde_json::from_value(json!({
            "url": "https://storage/x.jpg",
            "filename": "x.jpg"
        }))
        .unwrap();
        assert_eq!(ok.output().and_then(|o| o.filename()), Some("x.jpg"));

        let err: TaskResult =
            serde_json::from_value(json!({"errorCode": "422", "msg": "nope"})).unwrap();
        assert_eq!(err.failure().map(|f| f.error_code.as_str()), Some("422"));
    }
}
