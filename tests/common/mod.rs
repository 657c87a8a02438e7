//! Handlers and helpers shared by the integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use jobgraph::core::RetryStrategy;
use jobgraph::executor::register_builtin_operations;
use jobgraph::{
    EngineConfig, JobService, OperationContext, OperationHandler, OperationRegistry, TaskFailure,
    TaskOutput,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mark {
    Started(String),
    Finished(String),
}

/// Shared start/finish log with a high-water mark of concurrent tasks
#[derive(Clone, Default)]
pub struct Timeline {
    marks: Arc<Mutex<Vec<Mark>>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Timeline {
    pub fn marks(&self) -> Vec<Mark> {
        self.marks.lock().clone()
    }

    pub fn position(&self, mark: &Mark) -> Option<usize> {
        self.marks.lock().iter().position(|m| m == mark)
    }

    pub fn started(&self, task: &str) -> bool {
        self.position(&Mark::Started(task.to_string())).is_some()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn start(&self, task: &str) {
        self.marks.lock().push(Mark::Started(task.to_string()));
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn finish(&self, task: &str) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.marks.lock().push(Mark::Finished(task.to_string()));
    }
}

/// Runs for `delay`, logging start and finish. Fails with code "scripted"
/// when the task has `fail: true` in its params.
pub struct Recording {
    pub operation: &'static str,
    pub delay: Duration,
    pub timeline: Timeline,
}

impl Recording {
    pub fn new(operation: &'static str, timeline: &Timeline) -> Self {
        Self {
            operation,
            delay: Duration::from_millis(5),
            timeline: timeline.clone(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl OperationHandler for Recording {
    fn operation(&self) -> &str {
        self.operation
    }

    async fn execute(&self, ctx: &OperationContext) -> Result<TaskOutput, TaskFailure> {
        self.timeline.start(&ctx.task_name);
        tokio::time::sleep(self.delay).await;
        self.timeline.finish(&ctx.task_name);
        if ctx.param_bool("fail") == Some(true) {
            return Err(TaskFailure::new("scripted", "told to fail"));
        }
        Ok(TaskOutput::with_url(format!("mem://{}/{}", ctx.job_id, ctx.task_name))
            .meta("inputs", ctx.inputs.len()))
    }
}

/// Always fails with the given code
pub struct Failing {
    pub operation: &'static str,
    pub code: &'static str,
    pub msg: &'static str,
}

#[async_trait]
impl OperationHandler for Failing {
    fn operation(&self) -> &str {
        self.operation
    }

    async fn execute(&self, _ctx: &OperationContext) -> Result<TaskOutput, TaskFailure> {
        Err(TaskFailure::new(self.code, self.msg))
    }
}

/// Fails retryably `failures` times, then succeeds
pub struct Flaky {
    pub operation: &'static str,
    pub failures: AtomicU32,
    pub calls: Arc<AtomicU32>,
}

impl Flaky {
    pub fn new(operation: &'static str, failures: u32) -> Self {
        Self {
            operation,
            failures: AtomicU32::new(failures),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl OperationHandler for Flaky {
    fn operation(&self) -> &str {
        self.operation
    }

    async fn execute(&self, ctx: &OperationContext) -> Result<TaskOutput, TaskFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(TaskFailure::retryable("503", "service unavailable"));
        }
        Ok(TaskOutput::with_url(format!("mem://{}", ctx.task_name)).meta("attempt", ctx.attempt))
    }
}

/// Never finishes on its own
pub struct Hanging {
    pub operation: &'static str,
}

#[async_trait]
impl OperationHandler for Hanging {
    fn operation(&self) -> &str {
        self.operation
    }

    async fn execute(&self, _ctx: &OperationContext) -> Result<TaskOutput, TaskFailure> {
        futures::future::pending::<()>().await;
        Err(TaskFailure::new("unreachable", "pending future resolved"))
    }
}

/// Fast settings for tests
pub fn test_config() -> EngineConfig {
    EngineConfig::builder()
        .poll_interval(Duration::from_millis(5))
        .retry_strategy(RetryStrategy::Immediate)
        .build()
        .unwrap()
}

/// Service with the built-ins plus the given handlers
pub fn service_with(config: EngineConfig, handlers: Vec<Arc<dyn OperationHandler>>) -> JobService {
    let registry = OperationRegistry::new();
    register_builtin_operations(&registry, &config);
    for handler in handlers {
        registry.register(handler);
    }
    JobService::with_registry(config, registry).unwrap()
}

pub async fn with_timeout<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("test timed out")
}
