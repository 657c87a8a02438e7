//! Two-phase uploads.
//!
//! At submission an `import/upload` task gets a form descriptor (target url
//! plus signed parameters). The caller then posts the file with those
//! parameters echoed back; only then can the task, and everything
//! downstream of it, proceed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::core::errors::{JobGraphError, Result};
use crate::graph::model::{TaskFailure, TaskId, UploadForm};

/// A file posted against an upload form
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub filename: String,
    pub content: Bytes,
    /// Form fields sent along with the file
    pub fields: BTreeMap<String, String>,
}

impl UploadedFile {
    pub fn new(filename: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Echo every parameter of the form, as a browser form post would
    pub fn with_form(mut self, form: &UploadForm) -> Self {
        self.fields.extend(form.parameters.clone());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

type UploadOutcome = std::result::Result<UploadedFile, String>;

struct PendingUpload {
    form: UploadForm,
    sender: Option<oneshot::Sender<UploadOutcome>>,
    receiver: Option<oneshot::Receiver<UploadOutcome>>,
}

/// Uploads announced at submission and not yet consumed
#[derive(Clone, Default)]
pub struct UploadRegistry {
    pending: Arc<DashMap<TaskId, PendingUpload>>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_id: &str, form: UploadForm) {
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(
            task_id.to_string(),
            PendingUpload {
                form,
                sender: Some(sender),
                receiver: Some(receiver),
            },
        );
    }

    pub fn form(&self, task_id: &str) -> Option<UploadForm> {
        self.pending.get(task_id).map(|p| p.form.clone())
    }

    /// Second phase: deliver the file. The form parameters must be echoed
    /// unchanged.
    pub fn complete(&self, task_id: &str, file: UploadedFile) -> Result<()> {
        let mut pending = self
            .pending
            .get_mut(task_id)
            .ok_or_else(|| JobGraphError::not_found("upload", task_id))?;

        let mismatched: Vec<&str> = pending
            .form
            .parameters
            .iter()
            .filter(|(key, value)| file.fields.get(*key) != Some(*value))
            .map(|(key, _)| key.as_str())
            .collect();
        if !mismatched.is_empty() {
            warn!(task_id, fields = ?mismatched, "upload rejected: signature mismatch");
            return Err(JobGraphError::transport(
                "upload",
                format!("form parameters do not match: {}", mismatched.join(", ")),
                false,
            ));
        }

        let sender = pending.sender.take().ok_or_else(|| {
            JobGraphError::transport("upload", format!("upload for {task_id} already finished"), false)
        })?;
        info!(task_id, filename = %file.filename, size = file.size(), "upload received");
        // The receiver is gone only when the task already ended
        let _ = sender.send(Ok(file));
        Ok(())
    }

    /// Abort the upload; the waiting task fails with `upload_failed`
    pub fn reject(&self, task_id: &str, reason: impl Into<String>) -> Result<()> {
        let mut pending = self
            .pending
            .get_mut(task_id)
            .ok_or_else(|| JobGraphError::not_found("upload", task_id))?;
        let sender = pending.sender.take().ok_or_else(|| {
            JobGraphError::transport("upload", format!("upload for {task_id} already finished"), false)
        })?;
        let reason = reason.into();
        warn!(task_id, reason = %reason, "upload rejected");
        let _ = sender.send(Err(reason));
        Ok(())
    }

    /// Wait for the file of an announced upload, at most `limit`
    pub async fn wait(
        &self,
        task_id: &str,
        limit: Option<Duration>,
    ) -> std::result::Result<UploadedFile, TaskFailure> {
        let mut receiver = self
            .pending
            .get_mut(task_id)
            .and_then(|mut p| p.receiver.take())
            .ok_or_else(|| TaskFailure::upload_failed(format!("no pending upload for {task_id}")))?;

        let received = match limit {
            Some(limit) => match tokio::time::timeout(limit, &mut receiver).await {
                Ok(received) => received,
                Err(_) => {
                    // Leave the channel in place for another wait
                    if let Some(mut pending) = self.pending.get_mut(task_id) {
                        pending.receiver = Some(receiver);
                    }
                    warn!(task_id, limit_secs = limit.as_secs(), "upload not received in time");
                    return Err(TaskFailure::upload_failed(format!(
                        "no file received within {}s",
                        limit.as_secs()
                    )));
                }
            },
            None => receiver.await,
        };
        match received {
            Ok(Ok(file)) => Ok(file),
            Ok(Err(reason)) => Err(TaskFailure::upload_failed(reason)),
            Err(_) => Err(TaskFailure::upload_failed("upload was abandoned")),
        }
    }

    /// Forget an upload once its task is terminal
    pub fn remove(&self, task_id: &str) -> bool {
        self.pending.remove(task_id).is_some()
    }
}
