use crate::transport::Status;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Caller-side limits for one call: an optional deadline and a
/// cancellation token.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    /// No deadline, never cancelled unless the token is cancelled by hand.
    pub fn background() -> Self {
        Self::default()
    }

    /// Tighten the deadline to `timeout` from now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Tighten the deadline; a later deadline than the current one is ignored
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Limits applied to every attempt of one logical call, fallback included.
pub(crate) struct CallScope<'a> {
    deadline: Instant,
    caller: &'a CancellationToken,
    lifecycle: &'a CancellationToken,
}

impl<'a> CallScope<'a> {
    pub(crate) fn new(
        ctx: &'a CallContext,
        call_timeout: Duration,
        lifecycle: &'a CancellationToken,
    ) -> Self {
        let own = Instant::now() + call_timeout;
        Self {
            deadline: ctx.deadline().map_or(own, |d| d.min(own)),
            caller: ctx.cancellation_token(),
            lifecycle,
        }
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Run `call` until it completes, the deadline passes, or either the
    /// caller or the plugin lifecycle is cancelled.
    pub(crate) async fn bound<T, F>(&self, call: F) -> Result<T, Status>
    where
        F: Future<Output = Result<T, Status>>,
    {
        tokio::select! {
            biased;
            _ = self.lifecycle.cancelled() => Err(Status::cancelled("plugin is being removed")),
            _ = self.caller.cancelled() => Err(Status::cancelled("call cancelled by caller")),
            result = tokio::time::timeout_at(self.deadline, call) => {
                result.unwrap_or_else(|_| Err(Status::deadline_exceeded("call deadline exceeded")))
            }
        }
    }
}
