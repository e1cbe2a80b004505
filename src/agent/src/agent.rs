//! Agent control loop
//!
//! Reads one action at a time from a [`Transport`], reports it running, executes it with
//! the configured [`RuntimeExecutor`] under its retry budget and deadline, and reports the
//! terminal state. Transport and runtime failures never stop the loop; only cancellation of
//! the shutdown token does.

use crate::transport::{Transport, TransportError};
use container::{ExecContext, RuntimeError, RuntimeExecutor};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use workflow::{Action, Event, State};

pub struct Agent {
    transport: Arc<dyn Transport>,
    runtime: Arc<dyn RuntimeExecutor>,
}

impl Agent {
    pub fn new(transport: Arc<dyn Transport>, runtime: Arc<dyn RuntimeExecutor>) -> Self {
        Self { transport, runtime }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!("[Agent] Starting action loop");
        loop {
            if shutdown.is_cancelled() {
                tracing::info!("[Agent] Shutdown requested, stopping action loop");
                return;
            }

            let action = match self.transport.read(&shutdown).await {
                Ok(action) => action,
                Err(TransportError::Cancelled) => continue,
                Err(e) => {
                    tracing::warn!("[Agent] Failed to read action: {}", e);
                    continue;
                }
            };

            self.handle(&shutdown, action).await;
        }
    }

    /// Drive one action through Running to its terminal state.
    async fn handle(&self, shutdown: &CancellationToken, action: Action) {
        tracing::info!("[Agent] Received action: {}", action);

        let running = Event::new(action.clone(), State::Running, "running action");
        if let Err(e) = self.transport.write(shutdown, &running).await {
            tracing::warn!(
                "[Agent] Failed to report running state for {}, skipping execution: {}",
                action.name,
                e
            );
            return;
        }

        let (state, message) = self.execute(shutdown, &action).await;
        tracing::info!("[Agent] Action {} finished: {} ({})", action.name, state, message);

        let done = Event::new(action, state, message);
        if let Err(e) = self.transport.write(shutdown, &done).await {
            tracing::warn!("[Agent] Failed to report {} state: {}", state, e);
        }
    }

    /// Sequential attempts under one deadline covering all of them.
    async fn execute(&self, shutdown: &CancellationToken, action: &Action) -> (State, String) {
        let attempts = action.attempts();
        let ctx = ExecContext::new(shutdown.clone()).with_timeout(action.timeout());
        let mut last_error: Option<RuntimeError> = None;

        for attempt in 1..=attempts {
            tracing::info!(
                "[Agent] Executing action {} (attempt {}/{})",
                action.name,
                attempt,
                attempts
            );
            match self.runtime.execute(&ctx, action).await {
                Ok(()) => return (State::Success, "action completed successfully".to_string()),
                Err(e) if e.is_deadline_exceeded() => {
                    tracing::warn!("[Agent] Action {} timed out: {}", action.name, e);
                    return (State::Timeout, e.to_string());
                }
                Err(e) => {
                    tracing::warn!(
                        "[Agent] Action {} attempt {}/{} failed: {}",
                        action.name,
                        attempt,
                        attempts,
                        e
                    );
                    let cancelled = e.is_cancelled() || shutdown.is_cancelled();
                    last_error = Some(e);
                    if cancelled {
                        break;
                    }
                }
            }
        }

        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "action failed".to_string());
        (State::Failure, message)
    }
}
