//! Execution context
//!
//! An [`ExecContext`] carries process-wide cancellation plus an optional deadline into a
//! runtime executor. Narrowing a context with [`ExecContext::with_timeout`] never extends an
//! existing deadline.

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why an execution context fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// The process is shutting down
    Cancelled,
    /// The action deadline passed
    DeadlineExceeded,
}

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupted::Cancelled => f.write_str("context canceled"),
            Interrupted::DeadlineExceeded => f.write_str("context deadline exceeded"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl ExecContext {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Derive a context that additionally fires after `timeout`. `None` keeps the parent's deadline.
    pub fn with_timeout(&self, timeout: Option<Duration>) -> Self {
        let deadline = match (self.deadline, timeout.map(|t| Instant::now() + t)) {
            (Some(parent), Some(child)) => Some(parent.min(child)),
            (parent, child) => parent.or(child),
        };
        Self {
            token: self.token.clone(),
            deadline,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Current interruption, if the context already fired.
    pub fn err(&self) -> Option<Interrupted> {
        if self.token.is_cancelled() {
            return Some(Interrupted::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interrupted::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolve once the context fires. Cancellation wins over an expired deadline.
    pub async fn done(&self) -> Interrupted {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Interrupted::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => Interrupted::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                Interrupted::Cancelled
            }
        }
    }
}
