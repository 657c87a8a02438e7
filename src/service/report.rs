//! Human-readable summary of a finished (or unfinished) job

use std::fmt;

use serde::Serialize;

use crate::graph::model::{JobSnapshot, JobStatus, Task, TaskResult, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskLine {
    pub name: String,
    pub operation: String,
    pub status: TaskStatus,
    /// Result url of a completed task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// `[errorCode] - msg` of a failed task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskLine {
    fn from_task(task: &Task) -> Self {
        let (url, error) = match &task.result {
            Some(TaskResult::Output(output)) if task.status == TaskStatus::Completed => {
                (output.url.clone(), None)
            }
            Some(TaskResult::Failure(failure)) => (None, Some(failure.to_string())),
            _ => (None, None),
        };
        Self {
            name: task.name.clone(),
            operation: task.operation.clone(),
            status: task.status,
            url,
            error,
        }
    }
}

/// Final per-task report; every task keeps its location or its error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub tasks: Vec<TaskLine>,
}

impl StatusReport {
    pub fn from_snapshot(snapshot: &JobSnapshot) -> Self {
        let (url, error) = match &snapshot.result {
            Some(TaskResult::Output(output)) => (output.url.clone(), None),
            Some(TaskResult::Failure(failure)) => (None, Some(failure.to_string())),
            None => (None, None),
        };
        Self {
            job_id: snapshot.id.clone(),
            status: snapshot.status,
            error,
            url,
            tasks: snapshot.tasks.iter().map(TaskLine::from_task).collect(),
        }
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskLine> {
        self.tasks.iter().filter(|t| t.status == TaskStatus::Failed)
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.status, &self.error) {
            (JobStatus::Completed, _) => write!(f, "Job {} completed.", self.job_id)?,
            (JobStatus::Failed, Some(error)) => write!(f, "Job {} failed. {error}", self.job_id)?,
            (status, _) => write!(f, "Job {} is {status}.", self.job_id)?,
        }
        if let Some(url) = &self.url {
            write!(f, " result.url: {url}")?;
        }
        for task in &self.tasks {
            writeln!(f)?;
            match (&task.url, &task.error) {
                (Some(url), _) => write!(f, "Task {} completed. result.url: {url}", task.name)?,
                (None, Some(error)) => write!(f, "Task {} failed. {error}", task.name)?,
                (None, None) => write!(f, "Task {} is {}.", task.name, task.status)?,
            }
        }
        Ok(())
    }
}
