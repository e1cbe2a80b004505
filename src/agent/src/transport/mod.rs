//! Action transports
//!
//! A transport supplies actions to the agent loop and accepts the events it reports. Each
//! backend also has an ingestion task (`run`) that feeds actions into a [`Handoff`] at the
//! loop's pace.
//!
//! [`Handoff`]: crate::handoff::Handoff

pub mod file;
pub mod grpc;
pub mod nats;
pub mod tls;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use workflow::{Action, Event};

use crate::handoff::HandoffError;

pub use file::FileTransport;
pub use grpc::{GrpcConfig, GrpcTransport};
pub use nats::{NatsConfig, NatsTransport};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport cancelled")]
    Cancelled,

    #[error("Action channel closed")]
    Closed,

    #[error("gRPC request failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("Failed to connect to {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    #[error("nats connect error: {0}")]
    NatsConnect(#[from] async_nats::ConnectError),

    #[error("nats subscribe error: {0}")]
    NatsSubscribe(#[from] async_nats::SubscribeError),

    #[error("nats error: {0}")]
    Nats(#[from] async_nats::Error),

    #[error("Action batch error: {0}")]
    Codec(#[from] workflow::CodecError),

    #[error("Invalid transport configuration: {0}")]
    Config(String),
}

impl From<HandoffError> for TransportError {
    fn from(e: HandoffError) -> Self {
        match e {
            HandoffError::Cancelled | HandoffError::Abandoned => TransportError::Cancelled,
            HandoffError::Closed => TransportError::Closed,
        }
    }
}

/// Source of actions and sink for their events
#[async_trait]
pub trait Transport: Send + Sync {
    /// Block until the next action is available.
    async fn read(&self, shutdown: &CancellationToken) -> Result<Action, TransportError>;

    /// Report an action event.
    async fn write(&self, shutdown: &CancellationToken, event: &Event)
        -> Result<(), TransportError>;
}
