//! Explicit per-call context.
//!
//! Identity, discovered capabilities, the session ID, cancellation and the
//! deadline travel together in a [`CallContext`] that is passed by reference
//! through every async operation. Deriving a child with [`CallContext::with_timeout`]
//! never extends the parent's deadline and cancelling a parent cancels all
//! children.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::vmcp::AggregatedCapabilities;

/// Authenticated caller identity placed on the context by the auth layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable subject identifier (used to partition caches)
    pub subject: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Email address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Additional token claims
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub claims: HashMap<String, Value>,
}

impl Identity {
    /// Identity with only a subject
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Self::default()
        }
    }
}

/// Why a context stopped accepting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// Explicitly cancelled
    Cancelled,
    /// Deadline passed
    DeadlineExceeded,
}

impl From<Interrupt> for crate::Error {
    fn from(value: Interrupt) -> Self {
        match value {
            Interrupt::Cancelled => Self::Cancelled,
            Interrupt::DeadlineExceeded => Self::DeadlineExceeded,
        }
    }
}

/// Request-scoped state threaded explicitly through calls.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    identity: Option<Arc<Identity>>,
    capabilities: Option<Arc<AggregatedCapabilities>>,
    session_id: Option<String>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// Root context: no identity, no deadline, not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an authenticated identity
    #[must_use]
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(Arc::new(identity));
        self
    }

    /// Attach discovered capabilities
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Arc<AggregatedCapabilities>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Attach the protocol session ID
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Child context that is cancelled with this one and expires after
    /// `timeout` or at the parent's deadline, whichever comes first.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            identity: self.identity.clone(),
            capabilities: self.capabilities.clone(),
            session_id: self.session_id.clone(),
            cancel: self.cancel.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Child context sharing values and deadline with an independent cancel
    /// token (still cancelled when this context is).
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    /// Authenticated identity, if any
    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_deref()
    }

    /// Discovered capabilities, if the discovery middleware ran
    #[must_use]
    pub fn capabilities(&self) -> Option<&Arc<AggregatedCapabilities>> {
        self.capabilities.as_ref()
    }

    /// Protocol session ID, if any
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Absolute deadline, if any
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this context and every child derived from it
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that fires when this context is cancelled
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Non-blocking check. Cancellation wins over an elapsed deadline.
    #[must_use]
    pub fn err(&self) -> Option<Interrupt> {
        if self.cancel.is_cancelled() {
            return Some(Interrupt::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interrupt::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        let _ = self.interrupted().await;
    }

    /// Like [`done`](Self::done) but reports the reason.
    pub async fn interrupted(&self) -> Interrupt {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.cancel.cancelled() => Interrupt::Cancelled,
                    () = tokio::time::sleep_until(deadline) => Interrupt::DeadlineExceeded,
                }
            }
            None => {
                self.cancel.cancelled().await;
                Interrupt::Cancelled
            }
        }
    }

    /// Run `fut` unless the context is interrupted first.
    pub async fn run<F, T>(&self, fut: F) -> std::result::Result<T, Interrupt>
    where
        F: std::future::Future<Output = T>,
    {
        if let Some(reason) = self.err() {
            return Err(reason);
        }
        tokio::select! {
            biased;
            reason = self.interrupted() => Err(reason),
            value = fut => Ok(value),
        }
    }
}

/// Identity accessor used by components that require an authenticated caller.
#[must_use]
pub fn identity_from_context(ctx: &CallContext) -> Option<&Identity> {
    ctx.identity()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_deadline_never_exceeds_parent() {
        let parent = CallContext::new().with_timeout(Duration::from_millis(50));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_child() {
        let parent = CallContext::new();
        let child = parent.with_timeout(Duration::from_secs(60));
        assert!(child.err().is_none());
        parent.cancel();
        assert_eq!(child.err(), Some(Interrupt::Cancelled));
    }

    #[tokio::test]
    async fn run_reports_deadline() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(10));
        let result = ctx
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert_eq!(result, Err(Interrupt::DeadlineExceeded));
    }

    #[tokio::test]
    async fn run_returns_value_when_not_interrupted() {
        let ctx = CallContext::new();
        assert_eq!(ctx.run(async { 7 }).await, Ok(7));
    }

    #[test]
    fn identity_accessor() {
        let ctx = CallContext::new().with_identity(Identity::new("alice"));
        assert_eq!(identity_from_context(&ctx).map(|i| i.subject.as_str()), Some("alice"));
        assert!(identity_from_context(&CallContext::new()).is_none());
    }
}
