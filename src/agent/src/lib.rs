//! Provisioning agent
//!
//! Fetches workflow actions from a control plane over one of several transports, runs each
//! as a container through a [`container::RuntimeExecutor`], and reports its state back.

pub mod agent;
pub mod config;
pub mod handoff;
pub mod transport;

/// Generated workflow service types and stubs
pub mod proto {
    tonic::include_proto!("proto");
}

pub use agent::Agent;
pub use config::{BootstrapError, Cli, Config, RuntimeConfig, RuntimeKind, TransportConfig, TransportKind};
pub use handoff::{Handoff, HandoffError};
pub use transport::{Transport, TransportError};
