//! Supervision of sub-compiler execution.
//!
//! A [`SupervisionPolicy`] decides how long one `execute` may take and what
//! happens when it fails. The default policy escalates immediately.
//! `SubCompilerCrashed` is never retried.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{CastError, CastResult};
use crate::kind::BackendKind;
use crate::orchestrator::message::{self, Envelope, Request, Response, SessionId};
use crate::sample::ExecutionSample;

/// Decision after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supervision {
    /// Try again after waiting.
    Retry { backoff: Duration },
    /// Give up and report the error to the cast site.
    Escalate,
}

/// Fault-handling policy around `execute`.
pub trait SupervisionPolicy: Send + Sync + fmt::Debug {
    /// Limit for one attempt. `None` waits forever.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Decide what to do after attempt number `attempt` (1-based) failed.
    fn on_failure(&self, attempt: u32, error: &CastError) -> Supervision;
}

/// Never retry, never time out.
#[derive(Debug, Clone, Copy, Default)]
pub struct Escalate;

impl SupervisionPolicy for Escalate {
    fn on_failure(&self, _attempt: u32, _error: &CastError) -> Supervision {
        Supervision::Escalate
    }
}

/// Retry transient failures (including timeouts) a bounded number of times.
#[derive(Debug, Clone, Copy)]
pub struct RetryTransient {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub backoff: Duration,
    pub timeout: Option<Duration>,
}

impl Default for RetryTransient {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
            timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl SupervisionPolicy for RetryTransient {
    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn on_failure(&self, attempt: u32, error: &CastError) -> Supervision {
        if error.is_transient() && attempt < self.max_attempts {
            Supervision::Retry {
                backoff: self.backoff,
            }
        } else {
            Supervision::Escalate
        }
    }
}

/// Applies a policy to execution requests.
#[derive(Debug, Clone)]
pub struct Supervisor {
    policy: Arc<dyn SupervisionPolicy>,
}

impl Supervisor {
    pub fn new(policy: impl SupervisionPolicy + 'static) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &dyn SupervisionPolicy {
        self.policy.as_ref()
    }

    /// Execute a staged session on `kind`, retrying as the policy allows.
    pub async fn execute(
        &self,
        tx: &mpsc::Sender<Envelope>,
        kind: &BackendKind,
        session: SessionId,
    ) -> CastResult<ExecutionSample> {
        let mut attempt = 1;
        loop {
            let request = Request::Execute {
                session,
                timeout: self.policy.timeout(),
            };
            let error = match message::call(tx, kind, request).await {
                Ok(Response::Sample(sample)) => {
                    if attempt > 1 {
                        info!(%kind, session, attempt, "execution succeeded after retry");
                    }
                    return Ok(sample);
                }
                Ok(other) => message::unexpected(kind, "execute", &other),
                Err(e) => e,
            };
            if error.is_fatal() {
                return Err(error);
            }
            match self.policy.on_failure(attempt, &error) {
                Supervision::Retry { backoff } => {
                    warn!(%kind, session, attempt, ?backoff, error = %error, "retrying execution");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Supervision::Escalate => {
                    warn!(%kind, session, attempt, error = %error, "execution failed");
                    return Err(error);
                }
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(Escalate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> CastError {
        CastError::BackendExecution {
            kind: BackendKind::quantum(),
            message: "device busy".into(),
            transient: true,
        }
    }

    #[test]
    fn test_escalate_never_retries() {
        assert_eq!(Escalate.on_failure(1, &transient()), Supervision::Escalate);
        assert_eq!(Escalate.timeout(), None);
    }

    #[test]
    fn test_retry_transient_bounds_attempts() {
        let policy = RetryTransient {
            max_attempts: 3,
            backoff: Duration::from_millis(10),
            timeout: None,
        };
        assert!(matches!(policy.on_failure(1, &transient()), Supervision::Retry { .. }));
        assert!(matches!(policy.on_failure(2, &transient()), Supervision::Retry { .. }));
        assert_eq!(policy.on_failure(3, &transient()), Supervision::Escalate);
    }

    #[test]
    fn test_retry_transient_skips_permanent_errors() {
        let policy = RetryTransient::default();
        let permanent = CastError::execution(&BackendKind::quantum(), "bad circuit");
        assert_eq!(policy.on_failure(1, &permanent), Supervision::Escalate);
    }
}
