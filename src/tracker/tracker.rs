//! Authoritative job and task state.
//!
//! Every mutation goes through [`StatusTracker::transition`] (or
//! [`StatusTracker::cancel`]) under the job's mutex. Events for a job are
//! published while that mutex is held, so subscribers see them in the order
//! the state changed.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::core::errors::{JobGraphError, Result};
use crate::graph::model::{
    FailureCause, Job, JobId, JobSnapshot, JobStatus, Task, TaskFailure, TaskId, TaskOutput,
    TaskResult, TaskStatus,
};
use crate::tracker::bus::{Delivery, EventBus, Subscription};
use crate::tracker::events::{JobEvent, Topic};

/// A requested change of a task's state
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Blocked on dependencies or an execution slot
    Wait,
    Start,
    Complete(TaskOutput),
    Fail {
        failure: TaskFailure,
        cause: FailureCause,
    },
}

impl Transition {
    fn target(&self) -> TaskStatus {
        match self {
            Transition::Wait => TaskStatus::Waiting,
            Transition::Start => TaskStatus::Running,
            Transition::Complete(_) => TaskStatus::Completed,
            Transition::Fail { .. } => TaskStatus::Failed,
        }
    }

    fn allowed_from(&self, from: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Transition::Wait => from == Pending,
            Transition::Start => matches!(from, Pending | Waiting),
            Transition::Complete(_) => from == Running,
            Transition::Fail { .. } => !from.is_terminal(),
        }
    }
}

struct JobState {
    job: Job,
    terminal_emitted: bool,
}

#[derive(Clone)]
pub struct StatusTracker {
    jobs: Arc<DashMap<JobId, Arc<Mutex<JobState>>>>,
    /// task id -> owning job id
    task_index: Arc<DashMap<TaskId, JobId>>,
    bus: EventBus,
}

impl StatusTracker {
    pub fn new(bus: EventBus) -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            task_index: Arc::new(DashMap::new()),
            bus,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Start tracking a job. Its tasks must still be pending.
    pub fn insert_job(&self, job: Job) -> JobSnapshot {
        for task in &job.tasks {
            self.task_index.insert(task.id.clone(), job.id.clone());
        }
        let snapshot = job.snapshot();
        let id = job.id.clone();
        self.jobs.insert(
            id,
            Arc::new(Mutex::new(JobState {
                job,
                terminal_emitted: false,
            })),
        );
        snapshot
    }

    pub fn contains_job(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn contains_task(&self, task_id: &str) -> bool {
        self.task_index.contains_key(task_id)
    }

    pub fn job_of_task(&self, task_id: &str) -> Option<JobId> {
        self.task_index.get(task_id).map(|entry| entry.value().clone())
    }

    fn state(&self, job_id: &str) -> Result<Arc<Mutex<JobState>>> {
        self.jobs
            .get(job_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| JobGraphError::not_found("job", job_id))
    }

    /// Apply a transition to one task.
    ///
    /// Returns `Ok(false)` when the task is already terminal; the request is
    /// then ignored. Transitions the state machine does not allow are errors.
    pub fn transition(&self, job_id: &str, task: &str, transition: Transition) -> Result<bool> {
        let state = self.state(job_id)?;
        let mut guard = state.lock();
        let JobState {
            job,
            terminal_emitted,
        } = &mut *guard;

        let idx = job
            .tasks
            .iter()
            .position(|t| t.name == task)
            .ok_or_else(|| JobGraphError::not_found("task", format!("{job_id}/{task}")))?;

        let from = job.tasks[idx].status;
        if from.is_terminal() {
            debug!(job_id, task, status = %from, "ignoring transition on terminal task");
            return Ok(false);
        }
        if !transition.allowed_from(from) {
            return Err(JobGraphError::InvalidTransition {
                task: task.to_string(),
                from: from.to_string(),
                to: transition.target().to_string(),
            });
        }

        let now = Utc::now();
        let entry = &mut job.tasks[idx];
        entry.status = transition.target();
        let event = match transition {
            Transition::Wait => None,
            Transition::Start => {
                entry.started_at = Some(now);
                entry.attempts = entry.attempts.max(1);
                Some(JobEvent::TaskStarted {
                    task: entry.clone(),
                })
            }
            Transition::Complete(output) => {
                entry.ended_at = Some(now);
                entry.result = Some(TaskResult::Output(output));
                Some(JobEvent::TaskCompleted {
                    task: entry.clone(),
                })
            }
            Transition::Fail { failure, cause } => {
                entry.ended_at = Some(now);
                entry.result = Some(TaskResult::Failure(failure));
                entry.cause = Some(cause);
                Some(JobEvent::TaskFailed {
                    task: entry.clone(),
                })
            }
        };

        if let Some(event) = event {
            self.bus.publish(&job.id, event);
        }
        Self::settle(&self.bus, job, terminal_emitted);
        Ok(true)
    }

    /// Record a retry of a running task
    pub fn record_attempt(&self, job_id: &str, task: &str, attempt: u32) -> Result<()> {
        let state = self.state(job_id)?;
        let mut guard = state.lock();
        if let Some(entry) = guard.job.tasks.iter_mut().find(|t| t.name == task) {
            if entry.status == TaskStatus::Running {
                entry.attempts = attempt;
            }
        }
        Ok(())
    }

    /// Fail every non-terminal task of the job by cancellation.
    ///
    /// Completed results are kept. Returns false if the job had already
    /// finished.
    pub fn cancel(&self, job_id: &str) -> Result<bool> {
        let state = self.state(job_id)?;
        let mut guard = state.lock();
        let JobState {
            job,
            terminal_emitted,
        } = &mut *guard;

        if job.status().is_terminal() {
            return Ok(false);
        }

        job.cancelled = true;
        let now = Utc::now();
        let mut cancelled = Vec::new();
        for task in job.tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
            task.status = TaskStatus::Failed;
            task.ended_at = Some(now);
            task.result = Some(TaskResult::Failure(TaskFailure::cancelled()));
            task.cause = Some(FailureCause::Cancelled);
            cancelled.push(task.clone());
        }
        info!(job_id, tasks = cancelled.len(), "job cancelled");

        for task in cancelled {
            self.bus.publish(&job.id, JobEvent::TaskFailed { task });
        }
        Self::settle(&self.bus, job, terminal_emitted);
        Ok(true)
    }

    // Emit the one terminal job event once the job can make no more progress
    fn settle(bus: &EventBus, job: &Job, terminal_emitted: &mut bool) {
        let status = job.status();
        if !status.is_terminal() || *terminal_emitted {
            return;
        }
        *terminal_emitted = true;
        let snapshot = job.snapshot();
        match status {
            JobStatus::Completed => {
                info!(job_id = %job.id, "job completed");
                bus.publish(&job.id, JobEvent::JobCompleted { job: snapshot });
            }
            _ => {
                warn!(job_id = %job.id, reason = ?snapshot.failure, "job failed");
                bus.publish(&job.id, JobEvent::JobFailed { job: snapshot });
            }
        }
    }

    pub fn job_snapshot(&self, job_id: &str) -> Result<JobSnapshot> {
        let state = self.state(job_id)?;
        let guard = state.lock();
        Ok(guard.job.snapshot())
    }

    /// Aggregate status without cloning the job
    pub fn job_status(&self, job_id: &str) -> Result<JobStatus> {
        let state = self.state(job_id)?;
        let guard = state.lock();
        Ok(guard.job.status())
    }

    pub fn task_snapshot(&self, task_id: &str) -> Result<Task> {
        let job_id = self
            .job_of_task(task_id)
            .ok_or_else(|| JobGraphError::not_found("task", task_id))?;
        let state = self.state(&job_id)?;
        let guard = state.lock();
        guard
            .job
            .tasks
            .iter()
            .find(|t| t.id == task_id)
            .cloned()
            .ok_or_else(|| JobGraphError::not_found("task", task_id))
    }

    /// Subscribe to a known job or task
    pub fn subscribe(&self, topic: Topic) -> Result<Subscription> {
        let known = match &topic {
            Topic::Job(id) => self.contains_job(id),
            Topic::Task(id) => self.contains_task(id),
        };
        if !known {
            return Err(JobGraphError::subscription(
                topic.to_string(),
                format!("unknown id '{}'", topic.id()),
            ));
        }
        Ok(self.bus.subscribe(topic))
    }

    /// Wait until the task is terminal
    pub async fn wait_for_task(&self, task_id: &str) -> Result<Task> {
        let mut sub = self.subscribe(Topic::Task(task_id.to_string()))?;
        let task = self.task_snapshot(task_id)?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        while let Some(delivery) = sub.next().await {
            match delivery {
                Delivery::Event(envelope) => match &envelope.event {
                    JobEvent::TaskCompleted { task } | JobEvent::TaskFailed { task } => {
                        return Ok(task.clone());
                    }
                    _ => {}
                },
                // The terminal event may be among the lost ones
                Delivery::Lagged(_) => {
                    let task = self.task_snapshot(task_id)?;
                    if task.status.is_terminal() {
                        return Ok(task);
                    }
                }
            }
        }
        // The bus closed; the snapshot is still authoritative
        let task = self.task_snapshot(task_id)?;
        if task.status.is_terminal() {
            Ok(task)
        } else {
            Err(JobGraphError::subscription(
                sub.topic().to_string(),
                "event stream ended before the task finished",
            ))
        }
    }

    /// Wait until the job is terminal
    pub async fn wait_for_job(&self, job_id: &str) -> Result<JobSnapshot> {
        let mut sub = self.subscribe(Topic::Job(job_id.to_string()))?;
        let snapshot = self.job_snapshot(job_id)?;
        if snapshot.is_terminal() {
            return Ok(snapshot);
        }
        while let Some(delivery) = sub.next().await {
            match delivery {
                Delivery::Event(envelope) => match &envelope.event {
                    JobEvent::JobCompleted { job } | JobEvent::JobFailed { job } => {
                        return Ok(job.clone());
                    }
                    _ => {}
                },
                Delivery::Lagged(_) => {
                    let snapshot = self.job_snapshot(job_id)?;
                    if snapshot.is_terminal() {
                        return Ok(snapshot);
                    }
                }
            }
        }
        let snapshot = self.job_snapshot(job_id)?;
        if snapshot.is_terminal() {
            Ok(snapshot)
        } else {
            Err(JobGraphError::subscription(
                sub.topic().to_string(),
                "event stream ended before the job finished",
            ))
        }
    }
}
