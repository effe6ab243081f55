use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use gdrive_core::{ApiErrorClass, DriveError};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::backoff::Backoff;
use super::rate_limit::RateLimiter;
use crate::report::{SyncEvent, SyncObserver};

/// The remote actions the executor knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    GetFile,
    ListChildren,
    FindByName,
    CreateFolder,
    CopyFile,
    MoveFolder,
    TrashFile,
    Download,
}

impl RemoteOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteOp::GetFile => "get_file",
            RemoteOp::ListChildren => "list_children",
            RemoteOp::FindByName => "find_by_name",
            RemoteOp::CreateFolder => "create_folder",
            RemoteOp::CopyFile => "copy_file",
            RemoteOp::MoveFolder => "move_folder",
            RemoteOp::TrashFile => "trash_file",
            RemoteOp::Download => "download",
        }
    }
}

impl fmt::Display for RemoteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    RateLimit,
    Transient,
    Fatal,
}

/// Errors that can say whether retrying the same call may succeed.
pub trait Retryable {
    fn failure_class(&self) -> FailureClass;
}

impl Retryable for DriveError {
    fn failure_class(&self) -> FailureClass {
        match self.classification() {
            Some(ApiErrorClass::RateLimit) => FailureClass::RateLimit,
            Some(ApiErrorClass::Transient) => FailureClass::Transient,
            _ => FailureClass::Fatal,
        }
    }
}

#[derive(Debug, Error)]
pub enum CallError<E: std::error::Error + 'static> {
    #[error("{op} failed: {source}")]
    Remote { op: RemoteOp, source: E },
    #[error("{op} still failing after {attempts} attempts: {source}")]
    RetriesExhausted {
        op: RemoteOp,
        attempts: u32,
        source: E,
    },
    #[error("{op} still failing after {elapsed:?}: {source}")]
    DeadlineExceeded {
        op: RemoteOp,
        elapsed: Duration,
        source: E,
    },
}

impl<E: std::error::Error + 'static> CallError<E> {
    pub fn op(&self) -> RemoteOp {
        match self {
            CallError::Remote { op, .. }
            | CallError::RetriesExhausted { op, .. }
            | CallError::DeadlineExceeded { op, .. } => *op,
        }
    }

    pub fn remote_error(&self) -> &E {
        match self {
            CallError::Remote { source, .. }
            | CallError::RetriesExhausted { source, .. }
            | CallError::DeadlineExceeded { source, .. } => source,
        }
    }
}

/// Bounds on the retry loop. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub deadline: Option<Duration>,
}

pub struct ResilientCaller {
    limiter: RateLimiter,
    backoff: Backoff,
    policy: RetryPolicy,
    observer: Arc<dyn SyncObserver>,
}

impl ResilientCaller {
    pub fn new(
        limiter: RateLimiter,
        backoff: Backoff,
        policy: RetryPolicy,
        observer: Arc<dyn SyncObserver>,
    ) -> Self {
        Self {
            limiter,
            backoff,
            policy,
            observer,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Runs `call` under the rate limiter, retrying rate-limit and transient
    /// failures with quadratic backoff until it succeeds, fails fatally, or
    /// the retry policy gives up.
    pub async fn execute<T, E, F, Fut>(&self, op: RemoteOp, mut call: F) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::error::Error + 'static,
    {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            self.limiter.admit().await;
            let err = match call().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(%op, attempt, "remote call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = err.failure_class();
            if class == FailureClass::Fatal {
                return Err(CallError::Remote { op, source: err });
            }

            attempt = attempt.saturating_add(1);
            if let Some(max_attempts) = self.policy.max_attempts
                && attempt >= max_attempts
            {
                warn!(%op, attempts = attempt, error = %err, "retry limit exhausted");
                return Err(CallError::RetriesExhausted {
                    op,
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.backoff.delay(attempt);
            if let Some(deadline) = self.policy.deadline
                && started.elapsed() + delay > deadline
            {
                warn!(%op, attempts = attempt, error = %err, "retry deadline exceeded");
                return Err(CallError::DeadlineExceeded {
                    op,
                    elapsed: started.elapsed(),
                    source: err,
                });
            }

            warn!(
                %op,
                attempt,
                ?class,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "remote call failed, backing off"
            );
            self.observer.notify(&SyncEvent::Retrying {
                op,
                class,
                attempt,
                delay,
            });
            tokio::time::sleep(delay).await;
        }
    }
}
