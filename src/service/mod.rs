//! The service facade: job submission, status queries, subscriptions,
//! uploads, cancellation and polling over one shared executor.

pub mod poll;
pub mod report;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::config::EngineConfig;
use crate::core::errors::{JobGraphError, Result};
use crate::executor::operations::register_builtin_operations;
use crate::executor::registry::OperationRegistry;
use crate::executor::runner::JobExecutor;
use crate::executor::uploads::{UploadRegistry, UploadedFile};
use crate::graph::model::{
    generate_id, Job, JobId, JobSnapshot, Task, TaskOutput, TaskResult, TaskStatus, UploadForm,
};
use crate::graph::spec::{JobSpec, TaskSpec};
use crate::graph::validator::GraphValidator;
use crate::tracker::{EventBus, StatusTracker, Subscription, Topic};

pub use poll::{PollOptions, PollOutcome};
pub use report::{StatusReport, TaskLine};

/// Entry point for embedding applications
#[derive(Clone)]
pub struct JobService {
    config: Arc<EngineConfig>,
    registry: OperationRegistry,
    tracker: StatusTracker,
    uploads: UploadRegistry,
    executor: JobExecutor,
    /// Cancellation handles of runs still in progress
    runs: Arc<DashMap<JobId, oneshot::Sender<()>>>,
}

impl JobService {
    /// Service with the built-in operations registered
    pub fn new(config: EngineConfig) -> Result<Self> {
        let registry = OperationRegistry::new();
        register_builtin_operations(&registry, &config);
        Self::with_registry(config, registry)
    }

    /// Service over a caller-assembled registry
    pub fn with_registry(config: EngineConfig, registry: OperationRegistry) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let tracker = StatusTracker::new(EventBus::new(config.event_buffer));
        let uploads = UploadRegistry::new();
        let executor = JobExecutor::new(
            registry.clone(),
            tracker.clone(),
            uploads.clone(),
            config.clone(),
        );
        info!(
            max_concurrency = config.max_concurrency,
            operations = ?registry.operations(),
            "job service ready"
        );
        Ok(Self {
            config,
            registry,
            tracker,
            uploads,
            executor,
            runs: Arc::new(DashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    /// Validate and start a job. Must be called from within a tokio runtime.
    ///
    /// The returned snapshot lists the tasks with their ids; `import/upload`
    /// tasks carry their upload form in `result.form`.
    pub async fn submit_job(&self, spec: JobSpec) -> Result<JobSnapshot> {
        let tracker = self.tracker.clone();
        let is_external = move |id: &str| tracker.contains_task(id);
        let graph = GraphValidator::new(&self.registry, &is_external).validate(&spec)?;

        let job_id = generate_id();
        let mut tasks = Vec::with_capacity(spec.len());
        for (name, task_spec) in &spec.tasks {
            let task_id = generate_id();
            let handler = self
                .registry
                .get(&task_spec.operation)
                .ok_or_else(|| JobGraphError::internal("handler vanished after validation"))?;
            let result = handler.upload_form(&job_id, &task_id).map(|form| {
                self.uploads.register(&task_id, form.clone());
                TaskResult::Output(TaskOutput::with_form(form))
            });
            tasks.push(Task {
                id: task_id,
                name: name.clone(),
                job_id: job_id.clone(),
                operation: task_spec.operation.clone(),
                inputs: graph.inputs(name).to_vec(),
                output_format: task_spec.output_format.clone(),
                options: task_spec.options.clone(),
                params: task_spec.params.clone(),
                status: TaskStatus::Pending,
                result,
                cause: None,
                attempts: 0,
                created_at: chrono::Utc::now(),
                started_at: None,
                ended_at: None,
            });
        }

        let snapshot = self
            .tracker
            .insert_job(Job::new(job_id.clone(), spec.tag.clone(), tasks));
        info!(job_id = %job_id, tasks = snapshot.tasks.len(), tag = ?spec.tag, "job submitted");

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.runs.insert(job_id.clone(), cancel_tx);
        let executor = self.executor.clone();
        let runs = self.runs.clone();
        let uploads = self.uploads.clone();
        let upload_ids: Vec<String> = snapshot
            .tasks
            .iter()
            .filter(|t| uploads.form(&t.id).is_some())
            .map(|t| t.id.clone())
            .collect();
        tokio::spawn(async move {
            if let Err(e) = executor.run(job_id.clone(), graph, cancel_rx).await {
                error!(job_id = %job_id, error = %e, category = e.category(), "job run aborted");
            }
            // Uploads of tasks that never ran (propagated failure, aborted run)
            for id in &upload_ids {
                uploads.remove(id);
            }
            runs.remove(&job_id);
        });

        Ok(snapshot)
    }

    /// A standalone single-task job; its task id can feed other jobs
    pub async fn create_task(&self, spec: TaskSpec) -> Result<Task> {
        let name = spec.operation.replace('/', "-");
        let job = self.submit_job(JobSpec::new().task(name, spec)).await?;
        job.tasks
            .into_iter()
            .next()
            .ok_or_else(|| JobGraphError::internal("submitted job has no task"))
    }

    pub fn get_job(&self, job_id: &str) -> Result<JobSnapshot> {
        self.tracker.job_snapshot(job_id)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task> {
        self.tracker.task_snapshot(task_id)
    }

    /// Subscribe to `job.<id>` or `task.<id>`
    pub fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let topic: Topic = topic.parse()?;
        self.tracker.subscribe(topic)
    }

    /// No-op returning false when already unsubscribed
    pub fn unsubscribe(&self, subscription_id: Uuid) -> bool {
        self.tracker.bus().unsubscribe(subscription_id)
    }

    /// Second phase of an upload: post the file against the task's form
    pub fn complete_upload(&self, task_id: &str, file: UploadedFile) -> Result<()> {
        self.ensure_pending_upload(task_id)?;
        self.uploads.complete(task_id, file)
    }

    /// Form of an upload still awaiting its file
    pub fn upload_form(&self, task_id: &str) -> Option<UploadForm> {
        self.uploads.form(task_id)
    }

    /// Abandon an upload; the task fails with `upload_failed`
    pub fn reject_upload(&self, task_id: &str, reason: impl Into<String>) -> Result<()> {
        self.ensure_pending_upload(task_id)?;
        self.uploads.reject(task_id, reason)
    }

    fn ensure_pending_upload(&self, task_id: &str) -> Result<()> {
        let task = self.tracker.task_snapshot(task_id)?;
        if task.status.is_terminal() {
            return Err(JobGraphError::transport(
                "upload",
                format!("task {task_id} is already {}", task.status),
                false,
            ));
        }
        Ok(())
    }

    /// Cancel a job. Returns false when it had already finished.
    pub fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let cancelled = self.tracker.cancel(job_id)?;
        for task in self.tracker.job_snapshot(job_id)?.tasks {
            self.uploads.remove(&task.id);
        }
        if let Some((_, cancel)) = self.runs.remove(job_id) {
            // The run may have just finished on its own
            let _ = cancel.send(());
        }
        if cancelled {
            warn!(job_id, "job cancelled by caller");
        } else {
            debug!(job_id, "cancel ignored, job already finished");
        }
        Ok(cancelled)
    }

    /// Wait for the job's terminal event
    pub async fn wait_for_job(&self, job_id: &str) -> Result<JobSnapshot> {
        self.tracker.wait_for_job(job_id).await
    }

    pub async fn wait_for_task(&self, task_id: &str) -> Result<Task> {
        self.tracker.wait_for_task(task_id).await
    }

    /// Poll the job status until terminal or the attempts run out
    pub async fn poll_job(
        &self,
        job_id: &str,
        options: PollOptions,
    ) -> Result<PollOutcome<JobSnapshot>> {
        poll::poll_until(options, || self.get_job(job_id), JobSnapshot::is_terminal).await
    }

    pub async fn poll_task(&self, task_id: &str, options: PollOptions) -> Result<PollOutcome<Task>> {
        poll::poll_until(options, || self.get_task(task_id), |t: &Task| t.status.is_terminal()).await
    }

    /// Report of the job's current state
    pub fn report(&self, job_id: &str) -> Result<StatusReport> {
        Ok(StatusReport::from_snapshot(&self.get_job(job_id)?))
    }
}
