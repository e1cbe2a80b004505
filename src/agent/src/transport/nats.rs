//! Pub/sub transport over NATS
//!
//! Action batches arrive as YAML on `<stream>.<agent>.<actions>`; events are published as
//! text on `<stream>.<agent>.<events>`.

use crate::handoff::{Handoff, HandoffError};
use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use workflow::{Action, Event};

#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// Server `host:port` or full `nats://` URL
    pub server: String,
    pub stream: String,
    pub events_subject: String,
    pub actions_subject: String,
    pub agent_id: String,
}

impl NatsConfig {
    pub fn url(&self) -> String {
        if self.server.contains("://") {
            self.server.clone()
        } else {
            format!("nats://{}", self.server)
        }
    }

    pub fn actions_subject(&self) -> String {
        format!("{}.{}.{}", self.stream, self.agent_id, self.actions_subject)
    }

    pub fn events_subject(&self) -> String {
        format!("{}.{}.{}", self.stream, self.agent_id, self.events_subject)
    }
}

pub struct NatsTransport {
    config: NatsConfig,
    client: OnceCell<async_nats::Client>,
    actions: Handoff<Action>,
}

impl NatsTransport {
    pub fn new(config: NatsConfig) -> Self {
        Self {
            config,
            client: OnceCell::new(),
            actions: Handoff::new(),
        }
    }

    async fn client(&self) -> Result<&async_nats::Client, TransportError> {
        self.client
            .get_or_try_init(|| async {
                let url = self.config.url();
                let client = async_nats::ConnectOptions::new()
                    .name(&self.config.agent_id)
                    .retry_on_initial_connect()
                    .max_reconnects(Option::<usize>::None)
                    .connect(&url)
                    .await?;
                tracing::info!("[NatsTransport] Connected to {}", url);
                Ok::<_, TransportError>(client)
            })
            .await
    }

    /// Subscribe and feed each received batch to the loop until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), TransportError> {
        let client = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            client = self.client() => client?,
        };
        let subject = self.config.actions_subject();
        let mut subscriber = client.subscribe(subject.clone()).await?;
        tracing::info!("[NatsTransport] Subscribed to {}", subject);

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = subscriber.next() => match message {
                    Some(message) => message,
                    None => {
                        tracing::warn!("[NatsTransport] Subscription to {} closed", subject);
                        break;
                    }
                },
            };

            let actions = match workflow::decode_batch(&message.payload) {
                Ok(actions) => actions,
                Err(e) => {
                    tracing::warn!("[NatsTransport] Ignoring undecodable batch: {}", e);
                    continue;
                }
            };
            tracing::info!("[NatsTransport] Received batch of {} actions", actions.len());

            let batch = self.actions.batch();
            for action in actions {
                match self.actions.send(&batch, action, &shutdown).await {
                    Ok(()) => {}
                    Err(HandoffError::Abandoned) => {
                        tracing::info!("[NatsTransport] Batch abandoned, remaining actions skipped");
                        break;
                    }
                    Err(HandoffError::Cancelled) => break,
                    Err(HandoffError::Closed) => return Err(TransportError::Closed),
                }
            }
        }

        if let Err(e) = subscriber.unsubscribe().await {
            tracing::warn!("[NatsTransport] Failed to unsubscribe from {}: {}", subject, e);
        }
        Ok(())
    }

    async fn publish(&self, event: &Event) -> Result<(), TransportError> {
        let client = self.client().await?;
        client
            .publish(self.config.events_subject(), event.to_string().into())
            .await
            .map_err(|e| TransportError::Nats(e.into()))?;
        client
            .flush()
            .await
            .map_err(|e| TransportError::Nats(e.into()))?;
        Ok(())
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn read(&self, shutdown: &CancellationToken) -> Result<Action, TransportError> {
        Ok(self.actions.recv(shutdown).await?)
    }

    async fn write(
        &self,
        shutdown: &CancellationToken,
        event: &Event,
    ) -> Result<(), TransportError> {
        if event.state.aborts_batch() {
            self.actions.abandon();
        }

        tokio::select! {
            _ = shutdown.cancelled() => Err(TransportError::Cancelled),
            published = self.publish(event) => published,
        }
    }
}
