//! Container runtime crate
//!
//! Runs a single provisioning [`workflow::Action`] to completion as a container. Two
//! backends implement [`RuntimeExecutor`]: the Docker Engine API ([`docker`]) and the
//! containerd API ([`containerd`]).

// Common types and traits
pub mod common;
pub use common::*;

// Docker Engine backend
pub mod docker;
pub use docker::{BollardEngine, DockerExecutor, EngineApi};

// containerd backend (FIFO stdio and signals are Linux-only)
#[cfg(target_os = "linux")]
pub mod containerd;
#[cfg(target_os = "linux")]
pub use containerd::{ContainerdDaemon, ContainerdExecutor, DaemonApi};
