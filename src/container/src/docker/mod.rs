//! Docker Engine runtime
//!
//! [`DockerExecutor`] drives the pull/create/start/wait/remove lifecycle of one action
//! container over the narrow [`EngineApi`] seam; [`BollardEngine`] implements that seam
//! against the Docker Engine API.

pub mod engine;
pub mod executor;

pub use engine::{BollardEngine, ContainerSpec, EngineApi, EngineError, ExitWait};
pub use executor::DockerExecutor;
