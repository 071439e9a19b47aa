use shared::error::RemoteError;
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

use crate::{Diagnostics, Sleeper};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
#[error("{operation} rejected after {attempts} attempt(s): {source}")]
pub struct Unauthorized {
    pub operation: &'static str,
    pub attempts: u64,
    pub source: RemoteError,
}

enum RetryState<T> {
    Attempting { attempt: u64 },
    Sleeping { attempt: u64 },
    TerminalAuth { attempt: u64, error: RemoteError },
    Done { attempt: u64, value: T },
}

/// Re-runs a remote operation at a fixed delay until it succeeds.
///
/// A `401` ends the loop at once. Every other failure is reported to
/// [`Diagnostics`] and retried after `delay`, with no upper bound on attempts.
pub struct RetryController {
    delay: Duration,
    sleeper: Arc<dyn Sleeper>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl RetryController {
    pub fn new(delay: Duration, sleeper: Arc<dyn Sleeper>, diagnostics: Arc<dyn Diagnostics>) -> Self {
        Self {
            delay,
            sleeper,
            diagnostics,
        }
    }

    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut attempt_once: F) -> Result<T, Unauthorized>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut state = RetryState::Attempting { attempt: 1 };
        loop {
            state = match state {
                RetryState::Attempting { attempt } => match attempt_once().await {
                    Ok(value) => RetryState::Done { attempt, value },
                    Err(error) if error.is_unauthorized() => RetryState::TerminalAuth { attempt, error },
                    Err(error) => {
                        self.diagnostics.report_remote_error(operation, attempt, &error);
                        RetryState::Sleeping { attempt }
                    }
                },
                RetryState::Sleeping { attempt } => {
                    self.sleeper.sleep(self.delay).await;
                    RetryState::Attempting {
                        attempt: attempt + 1,
                    }
                }
                RetryState::TerminalAuth { attempt, error } => {
                    warn!(operation, attempt, "sync: unauthorized, abandoning operation");
                    return Err(Unauthorized {
                        operation,
                        attempts: attempt,
                        source: error,
                    });
                }
                RetryState::Done { attempt, value } => {
                    if attempt > 1 {
                        info!(operation, attempts = attempt, "sync: operation succeeded after retries");
                    }
                    return Ok(value);
                }
            };
        }
    }
}

#[cfg(test)]
#[path = "tests/retry_tests.rs"]
mod tests;
