//! Static-file transport: one YAML batch read at start-up

use crate::handoff::{Handoff, HandoffError};
use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use workflow::{Action, Event};

pub struct FileTransport {
    path: PathBuf,
    abandon_on_failure: bool,
    actions: Handoff<Action>,
}

impl FileTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            abandon_on_failure: false,
            actions: Handoff::new(),
        }
    }

    /// Stop feeding the rest of the batch after a failed or timed-out action.
    pub fn with_abandon_on_failure(mut self, enabled: bool) -> Self {
        self.abandon_on_failure = enabled;
        self
    }

    /// Read the batch and feed it to the loop one action at a time.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), TransportError> {
        tracing::info!("[FileTransport] Reading workflow from {}", self.path.display());
        let path = self.path.clone();
        let actions = tokio::task::spawn_blocking(move || workflow::read_batch_file(&path))
            .await
            .map_err(|e| TransportError::Config(format!("workflow reader panicked: {}", e)))??;
        tracing::info!("[FileTransport] Loaded {} actions", actions.len());

        let batch = self.actions.batch();
        for action in actions {
            match self.actions.send(&batch, action, &shutdown).await {
                Ok(()) => {}
                Err(HandoffError::Abandoned) => {
                    tracing::info!("[FileTransport] Batch abandoned, remaining actions skipped");
                    break;
                }
                Err(HandoffError::Cancelled) => return Ok(()),
                Err(HandoffError::Closed) => return Err(TransportError::Closed),
            }
        }
        tracing::info!("[FileTransport] All workflow actions delivered");
        Ok(())
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn read(&self, shutdown: &CancellationToken) -> Result<Action, TransportError> {
        Ok(self.actions.recv(shutdown).await?)
    }

    async fn write(
        &self,
        _shutdown: &CancellationToken,
        event: &Event,
    ) -> Result<(), TransportError> {
        tracing::info!("[FileTransport] Event: {}", event);
        if self.abandon_on_failure && event.state.aborts_batch() {
            self.actions.abandon();
        }
        Ok(())
    }
}
