//! Bounded status polling, for callers that cannot hold a subscription

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::config::EngineConfig;
use crate::core::errors::{JobGraphError, Result};

/// How often and how long to poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOptions {
    /// Pause before each status query
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollOptions {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.poll_interval(), config.poll_max_attempts)
    }
}

impl Default for PollOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Result of a bounded poll. Running out of attempts is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
    Terminal(T),
    /// `last` is `None` when no query succeeded
    TimedOut { last: Option<T>, attempts: u32 },
}

impl<T> PollOutcome<T> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PollOutcome::Terminal(_))
    }

    /// Latest observed state either way
    pub fn last(&self) -> Option<&T> {
        match self {
            PollOutcome::Terminal(value) => Some(value),
            PollOutcome::TimedOut { last, .. } => last.as_ref(),
        }
    }

    /// Turn a timeout into [`JobGraphError::PollTimeout`] for `id`
    pub fn into_result(self, id: &str) -> Result<T> {
        match self {
            PollOutcome::Terminal(value) => Ok(value),
            PollOutcome::TimedOut { attempts, .. } => Err(JobGraphError::PollTimeout {
                job_id: id.to_string(),
                attempts,
            }),
        }
    }
}

/// Query until `is_terminal` holds or the attempts run out.
///
/// Query errors that are recoverable use up an attempt; others end the
/// poll immediately.
pub async fn poll_until<T, Q, F>(
    options: PollOptions,
    mut query: Q,
    is_terminal: F,
) -> Result<PollOutcome<T>>
where
    Q: FnMut() -> Result<T>,
    F: Fn(&T) -> bool,
{
    let attempts = options.max_attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        tokio::time::sleep(options.interval).await;
        match query() {
            Ok(value) if is_terminal(&value) => return Ok(PollOutcome::Terminal(value)),
            Ok(value) => {
                tracing::debug!(attempt, "poll: not terminal yet");
                last = Some(value);
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(attempt, error = %e, "poll query failed, will retry");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(PollOutcome::TimedOut { last, attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_poll_times_out_without_error() {
        let mut calls = 0;
        let outcome = poll_until(
            PollOptions::new(Duration::from_millis(1), 3),
            || {
                calls += 1;
                Ok(calls)
            },
            |_| false,
        )
        .await
        .unwrap();
        assert_eq!(
            outcome,
            PollOutcome::TimedOut {
                last: Some(3),
                attempts: 3
            }
        );
    }

    #[tokio::test]
    async fn test_poll_stops_at_terminal() {
        let mut calls = 0;
        let outcome = poll_until(
            PollOptions::new(Duration::from_millis(1), 10),
            || {
                calls += 1;
                Ok(calls)
            },
            |n| *n == 2,
        )
        .await
        .unwrap();
        assert_eq!(outcome, PollOutcome::Terminal(2));
    }

    #[tokio::test]
    async fn test_failing_queries_time_out() {
        let outcome = poll_until(
            PollOptions::new(Duration::from_millis(1), 3),
            || Err::<u32, _>(JobGraphError::transport("status_query", "connection reset", true)),
            |_| true,
        )
        .await
        .unwrap();
        assert_eq!(
            outcome,
            PollOutcome::TimedOut {
                last: None,
                attempts: 3
            }
        );
        assert!(matches!(
            outcome.into_result("job-1"),
            Err(JobGraphError::PollTimeout { attempts: 3, ref job_id }) if job_id == "job-1"
        ));
    }

    #[tokio::test]
    async fn test_unrecoverable_query_error_ends_poll() {
        let result = poll_until(
            PollOptions::new(Duration::from_millis(1), 10),
            || Err::<u32, _>(JobGraphError::not_found("job", "x")),
            |_| true,
        )
        .await;
        assert!(matches!(result, Err(JobGraphError::NotFound { .. })));
    }
}
