use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{oneshot, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

use crate::core::config::EngineConfig;
use crate::core::errors::{JobGraphError, Result};
use crate::executor::handler::{OperationContext, OperationHandler, ResolvedInput};
use crate::executor::registry::OperationRegistry;
use crate::executor::uploads::UploadRegistry;
use crate::graph::model::{
    FailureCause, InputRef, JobId, JobSnapshot, TaskFailure, TaskOutput, TaskStatus,
    CODE_TIMEOUT, CODE_UPLOAD_FAILED,
};
use crate::graph::validator::ValidatedGraph;
use crate::scheduler::{Scheduler, SchedulerStep};
use crate::tracker::{StatusTracker, Transition};

/// Outcome of one unit of work driven by the run loop
enum Progress {
    Finished {
        task: String,
        outcome: std::result::Result<TaskOutput, TaskFailure>,
    },
    /// The task was already terminal when its slot came up
    Skipped { task: String },
    External { id: String, completed: bool },
}

/// Runs jobs: releases ready tasks, executes them through their handlers
/// with bounded parallelism, and records every outcome in the tracker.
#[derive(Clone)]
pub struct JobExecutor {
    registry: OperationRegistry,
    tracker: StatusTracker,
    uploads: UploadRegistry,
    config: Arc<EngineConfig>,
    /// Execution slots shared by every job of this executor
    slots: Arc<Semaphore>,
}

impl JobExecutor {
    pub fn new(
        registry: OperationRegistry,
        tracker: StatusTracker,
        uploads: UploadRegistry,
        config: Arc<EngineConfig>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            registry,
            tracker,
            uploads,
            config,
            slots,
        }
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    /// Drive a submitted job to a terminal state.
    ///
    /// A message on `cancel` (or the job being cancelled through the tracker)
    /// stops the run; in-flight handler futures are dropped.
    #[instrument(name = "job_run", skip_all, fields(job_id = %job_id))]
    pub async fn run(
        &self,
        job_id: JobId,
        graph: ValidatedGraph,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<JobSnapshot> {
        let mut scheduler = Scheduler::new(&graph);
        let mut running: FuturesUnordered<BoxFuture<'static, Progress>> = FuturesUnordered::new();
        let mut cancel_armed = true;

        info!(tasks = graph.task_names().len(), "job started");

        for name in graph.task_names() {
            self.tracker.transition(&job_id, name, Transition::Wait)?;
        }
        for id in graph.external_refs() {
            running.push(self.watch_external(id.clone()));
        }
        let step = scheduler.initial_ready();
        self.apply_step(&job_id, &graph, &mut scheduler, step, None, &mut running)?;

        while !scheduler.is_finished() {
            tokio::select! {
                res = &mut cancel, if cancel_armed => {
                    match res {
                        Ok(()) => {
                            self.tracker.cancel(&job_id)?;
                            info!(in_flight = running.len(), "job run stopped by cancellation");
                            break;
                        }
                        // Sender dropped: nobody can cancel any more
                        Err(_) => cancel_armed = false,
                    }
                }
                progress = running.next() => {
                    let Some(progress) = progress else {
                        error!("nothing in flight but the job is not finished");
                        return Err(JobGraphError::internal(format!(
                            "job {job_id} stalled with unsettled tasks"
                        )));
                    };
                    let (step, upstream) = match progress {
                        Progress::Finished { task, outcome } => {
                            (self.record(&job_id, &task, outcome, &mut scheduler)?, None)
                        }
                        Progress::Skipped { task } => {
                            debug!(task = %task, "task already settled, skipping");
                            scheduler.mark_settled(&task);
                            (SchedulerStep::default(), None)
                        }
                        Progress::External { id, completed: true } => {
                            (scheduler.on_external_completed(&id), None)
                        }
                        Progress::External { id, completed: false } => {
                            warn!(external = %id, "external input failed");
                            (scheduler.on_external_failed(&id), Some(id))
                        }
                    };
                    self.apply_step(
                        &job_id,
                        &graph,
                        &mut scheduler,
                        step,
                        upstream.as_deref(),
                        &mut running,
                    )?;
                }
            }

            // Cancelled through the tracker while work was still queued
            if self.tracker.job_status(&job_id)?.is_terminal() && !scheduler.is_finished() {
                info!(in_flight = running.len(), "job settled externally, dropping work");
                break;
            }
        }

        let snapshot = self.tracker.job_snapshot(&job_id)?;
        info!(status = %snapshot.status, "job finished");
        Ok(snapshot)
    }

    // Record a handler outcome and feed it to the scheduler
    fn record(
        &self,
        job_id: &str,
        task: &str,
        outcome: std::result::Result<TaskOutput, TaskFailure>,
        scheduler: &mut Scheduler,
    ) -> Result<SchedulerStep> {
        match outcome {
            Ok(output) => {
                if self
                    .tracker
                    .transition(job_id, task, Transition::Complete(output))?
                {
                    info!(task, "task completed");
                    Ok(scheduler.on_completed(task))
                } else {
                    scheduler.mark_settled(task);
                    Ok(SchedulerStep::default())
                }
            }
            Err(failure) => {
                let cause = if failure.error_code == CODE_UPLOAD_FAILED {
                    FailureCause::Upload
                } else {
                    FailureCause::Execution
                };
                warn!(task, error = %failure, "task failed");
                self.tracker
                    .transition(job_id, task, Transition::Fail { failure, cause })?;
                let step = scheduler.on_failed(task);
                self.propagate(job_id, task, &step)?;
                Ok(SchedulerStep {
                    newly_ready: step.newly_ready,
                    newly_failed: Vec::new(),
                })
            }
        }
    }

    fn propagate(&self, job_id: &str, upstream: &str, step: &SchedulerStep) -> Result<()> {
        for dependent in &step.newly_failed {
            debug!(task = %dependent, upstream, "failing by propagation");
            self.tracker.transition(
                job_id,
                dependent,
                Transition::Fail {
                    failure: TaskFailure::propagated(upstream),
                    cause: FailureCause::Propagated {
                        upstream: upstream.to_string(),
                    },
                },
            )?;
        }
        Ok(())
    }

    fn apply_step(
        &self,
        job_id: &str,
        graph: &ValidatedGraph,
        scheduler: &mut Scheduler,
        step: SchedulerStep,
        upstream: Option<&str>,
        running: &mut FuturesUnordered<BoxFuture<'static, Progress>>,
    ) -> Result<()> {
        if let Some(upstream) = upstream {
            self.propagate(job_id, upstream, &step)?;
        }
        for task in step.newly_ready {
            match self.prepare(job_id, graph, &task) {
                Ok((handler, ctx)) => running.push(self.execute_task(handler, ctx)),
                Err(failure) => {
                    // Could not even build the context; fail like an execution error
                    let outcome = self.record(job_id, &task, Err(failure), scheduler)?;
                    self.apply_step(job_id, graph, scheduler, outcome, None, running)?;
                }
            }
        }
        Ok(())
    }

    // Build the handler context from the current snapshots
    fn prepare(
        &self,
        job_id: &str,
        graph: &ValidatedGraph,
        task: &str,
    ) -> std::result::Result<(Arc<dyn OperationHandler>, OperationContext), TaskFailure> {
        let internal = |e: JobGraphError| TaskFailure::new("internal_error", e.to_string());
        let snapshot = self.tracker.job_snapshot(job_id).map_err(internal)?;
        let entry = snapshot
            .task(task)
            .ok_or_else(|| TaskFailure::new("internal_error", format!("unknown task '{task}'")))?;
        let handler = self.registry.get(&entry.operation).ok_or_else(|| {
            TaskFailure::new(
                "unknown_operation",
                format!("no handler for '{}'", entry.operation),
            )
        })?;

        let mut inputs = Vec::new();
        for input in graph.inputs(task) {
            let upstream = match input {
                InputRef::Task(name) => snapshot.task(name).cloned(),
                InputRef::External(id) => self.tracker.task_snapshot(id).ok(),
            };
            let resolved = upstream.and_then(|t| {
                t.output().cloned().map(|output| ResolvedInput {
                    reference: input.key().to_string(),
                    task_id: t.id.clone(),
                    output,
                })
            });
            match resolved {
                Some(resolved) => inputs.push(resolved),
                None => {
                    return Err(TaskFailure::new(
                        "internal_error",
                        format!("input '{}' has no result", input.key()),
                    ))
                }
            }
        }

        let ctx = OperationContext {
            job_id: job_id.to_string(),
            task_id: entry.id.clone(),
            task_name: entry.name.clone(),
            operation: entry.operation.clone(),
            inputs,
            output_format: entry.output_format.clone(),
            options: entry.options.clone(),
            params: entry.params.clone(),
            attempt: 1,
            uploads: self.uploads.clone(),
        };
        Ok((handler, ctx))
    }

    fn execute_task(
        &self,
        handler: Arc<dyn OperationHandler>,
        mut ctx: OperationContext,
    ) -> BoxFuture<'static, Progress> {
        let slots = self.slots.clone();
        let tracker = self.tracker.clone();
        let config = self.config.clone();

        async move {
            let task = ctx.task_name.clone();
            let _permit = if handler.uses_slot() {
                match slots.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        return Progress::Finished {
                            task,
                            outcome: Err(TaskFailure::new(
                                "internal_error",
                                "execution slots closed",
                            )),
                        }
                    }
                }
            } else {
                None
            };

            match tracker.transition(&ctx.job_id, &task, Transition::Start) {
                Ok(true) => {}
                Ok(false) => return Progress::Skipped { task },
                Err(e) => {
                    error!(task = %task, error = %e, "could not start task");
                    return Progress::Skipped { task };
                }
            }
            debug!(task = %task, operation = %ctx.operation, "task started");

            let max_attempts = config.max_attempts.max(1);
            let limit = config
                .task_timeout()
                .filter(|_| handler.honors_task_timeout());
            let outcome = loop {
                let result = match limit {
                    Some(limit) => match timeout(limit, handler.execute(&ctx)).await {
                        Ok(result) => result,
                        Err(_) => Err(TaskFailure::retryable(
                            CODE_TIMEOUT,
                            format!("operation timed out after {}s", limit.as_secs()),
                        )),
                    },
                    None => handler.execute(&ctx).await,
                };

                match result {
                    Ok(output) => break Ok(handler.produce_result(&ctx, output)),
                    Err(failure) if failure.retryable && ctx.attempt < max_attempts => {
                        let delay = config.retry_strategy.delay_for(ctx.attempt);
                        warn!(
                            task = %task,
                            attempt = ctx.attempt,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %failure,
                            "task attempt failed, retrying"
                        );
                        sleep(delay).await;
                        ctx.attempt += 1;
                        if let Err(e) = tracker.record_attempt(&ctx.job_id, &task, ctx.attempt) {
                            warn!(task = %task, error = %e, "could not record attempt");
                        }
                    }
                    Err(failure) => break Err(failure),
                }
            };
            Progress::Finished { task, outcome }
        }
        .boxed()
    }

    // Resolve once a task of another job is terminal
    fn watch_external(&self, id: String) -> BoxFuture<'static, Progress> {
        let tracker = self.tracker.clone();
        async move {
            let completed = match tracker.wait_for_task(&id).await {
                Ok(task) => task.status == TaskStatus::Completed,
                Err(e) => {
                    warn!(external = %id, error = %e, "lost track of external input");
                    false
                }
            };
            Progress::External { id, completed }
        }
        .boxed()
    }
}
