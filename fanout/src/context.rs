//! Cancellable context handed to every job and handler.
//!
//! A thin layer over [`CancellationToken`] that adds an optional deadline and
//! remembers why the context finished. Children inherit cancellation, the
//! cause, and the earlier of the two deadlines.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
pub use tokio_util::sync::CancellationToken;

use crate::error::ContextError;

#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    token: CancellationToken,
    deadline: Option<Instant>,
    cause: OnceLock<ContextError>,
    parent: Option<Context>,
}

impl Context {
    /// Root context: never done unless canceled explicitly.
    pub fn background() -> Self {
        Self::from_parts(CancellationToken::new(), None, None)
    }

    /// Root context driven by an existing token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self::from_parts(token, None, None)
    }

    fn from_parts(
        token: CancellationToken,
        deadline: Option<Instant>,
        parent: Option<Context>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                token,
                deadline,
                cause: OnceLock::new(),
                parent,
            }),
        }
    }

    /// Derive a context that can be canceled without affecting `self`.
    pub fn child(&self) -> Self {
        Self::from_parts(
            self.inner.token.child_token(),
            self.inner.deadline,
            Some(self.clone()),
        )
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.inner.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self::from_parts(
            self.inner.token.child_token(),
            Some(deadline),
            Some(self.clone()),
        )
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    pub fn cancel(&self) {
        self.finish(ContextError::Canceled);
    }

    /// Record the cause (first one wins) and fire the token.
    fn finish(&self, cause: ContextError) -> ContextError {
        let cause = *self.inner.cause.get_or_init(|| cause);
        self.inner.token.cancel();
        cause
    }

    /// `None` while the context is live, otherwise why it finished.
    pub fn err(&self) -> Option<ContextError> {
        if let Some(cause) = self.inner.cause.get() {
            return Some(*cause);
        }
        if let Some(parent) = &self.inner.parent
            && let Some(cause) = parent.err()
        {
            return Some(self.finish(cause));
        }
        if let Some(deadline) = self.inner.deadline
            && Instant::now() >= deadline
        {
            return Some(self.finish(ContextError::DeadlineExceeded));
        }
        if self.inner.token.is_cancelled() {
            // Fired through a token clone handed out elsewhere.
            return Some(self.finish(ContextError::Canceled));
        }
        None
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is canceled or its deadline passes.
    pub async fn done(&self) {
        match self.inner.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.inner.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {
                        self.finish(ContextError::DeadlineExceeded);
                    }
                }
            }
            None => self.inner.token.cancelled().await,
        }
    }

    /// Token that fires together with this context.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Guard that cancels this context when dropped, unless disarmed.
    pub fn drop_guard(&self) -> CancelGuard {
        CancelGuard {
            ctx: Some(self.clone()),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

/// Cancels its context on drop.
#[must_use = "dropping the guard cancels the context immediately"]
#[derive(Debug)]
pub struct CancelGuard {
    ctx: Option<Context>,
}

impl CancelGuard {
    pub fn disarm(mut self) {
        self.ctx = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            ctx.cancel();
        }
    }
}
