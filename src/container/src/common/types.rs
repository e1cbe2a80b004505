use crate::common::context::{ExecContext, Interrupted};
use async_trait::async_trait;
use thiserror::Error;
use workflow::{Action, Env};

/// Runs one action to completion
#[async_trait]
pub trait RuntimeExecutor: Send + Sync {
    /// Block until the action's container exits or `ctx` fires.
    ///
    /// Every runtime resource created for the action is torn down before this returns,
    /// whatever the outcome.
    async fn execute(&self, ctx: &ExecContext, action: &Action) -> Result<(), RuntimeError>;
}

/// Executor failure, tagged with the action and the operation that failed
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("[{action}] Failed to pull image {image}: {message}")]
    Pull {
        action: String,
        image: String,
        message: String,
    },

    #[error("[{action}] Failed to create container: {message}")]
    Create { action: String, message: String },

    #[error("[{action}] Failed to start container: {message}")]
    Start { action: String, message: String },

    #[error("[{action}] Error while waiting for container: {message}")]
    Wait { action: String, message: String },

    #[error("[{action}] Container exited with non-zero status {code}")]
    NonZeroExit { action: String, code: i64 },

    #[error("[{action}] Execution interrupted: {reason}")]
    Interrupted { action: String, reason: Interrupted },
}

impl RuntimeError {
    /// True when the action's deadline fired during execution.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(
            self,
            RuntimeError::Interrupted {
                reason: Interrupted::DeadlineExceeded,
                ..
            }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            RuntimeError::Interrupted {
                reason: Interrupted::Cancelled,
                ..
            }
        )
    }
}

/// Proxy settings injected into every action container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub http_proxy: String,
    pub https_proxy: String,
    pub no_proxy: String,
}

impl ProxyConfig {
    /// Action env followed by the configured proxy variables, as `KEY=VALUE` strings.
    pub fn apply(&self, env: &[Env]) -> Vec<String> {
        let mut out = workflow::flatten_env(env);
        for (key, value) in [
            ("HTTP_PROXY", &self.http_proxy),
            ("HTTPS_PROXY", &self.https_proxy),
            ("NO_PROXY", &self.no_proxy),
        ] {
            if !value.is_empty() {
                out.push(format!("{}={}", key, value));
            }
        }
        out
    }
}
