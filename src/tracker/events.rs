//! Events published on the bus

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::JobGraphError;
use crate::graph::model::{JobId, JobSnapshot, Task, TaskId};

/// State change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    TaskStarted { task: Task },
    TaskCompleted { task: Task },
    TaskFailed { task: Task },
    JobCompleted { job: JobSnapshot },
    JobFailed { job: JobSnapshot },
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::TaskStarted { .. } => "task_started",
            JobEvent::TaskCompleted { .. } => "task_completed",
            JobEvent::TaskFailed { .. } => "task_failed",
            JobEvent::JobCompleted { .. } => "job_completed",
            JobEvent::JobFailed { .. } => "job_failed",
        }
    }

    /// Topic the event is delivered on
    pub fn topic(&self) -> Topic {
        match self {
            JobEvent::TaskStarted { task }
            | JobEvent::TaskCompleted { task }
            | JobEvent::TaskFailed { task } => Topic::Task(task.id.clone()),
            JobEvent::JobCompleted { job } | JobEvent::JobFailed { job } => {
                Topic::Job(job.id.clone())
            }
        }
    }

    /// Whether this event ends the life of its subject
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::TaskStarted { .. })
    }
}

/// Event envelope with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub sequence: u64,
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    pub topic: Topic,
    pub event: JobEvent,
}

/// Subscription key: `job.<id>` or `task.<id>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Topic {
    Job(JobId),
    Task(TaskId),
}

impl Topic {
    pub fn id(&self) -> &str {
        match self {
            Topic::Job(id) | Topic::Task(id) => id,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Job(id) => write!(f, "job.{id}"),
            Topic::Task(id) => write!(f, "task.{id}"),
        }
    }
}

impl FromStr for Topic {
    type Err = JobGraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || JobGraphError::subscription(s, "expected 'job.<id>' or 'task.<id>'");
        let (kind, id) = s.split_once('.').ok_or_else(malformed)?;
        if id.is_empty() || id.contains('.') {
            return Err(malformed());
        }
        match kind {
            "job" => Ok(Topic::Job(id.to_string())),
            "task" => Ok(Topic::Task(id.to_string())),
            _ => Err(malformed()),
        }
    }
}

impl TryFrom<String> for Topic {
    type Error = JobGraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.to_string()
    }
}
