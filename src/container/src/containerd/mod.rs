//! containerd runtime
//!
//! [`ContainerdExecutor`] resolves and pulls the image, prepares a snapshot, creates the
//! container and task, and tears all three down again. [`ContainerdDaemon`] implements the
//! [`DaemonApi`] seam over the containerd gRPC services, scoped to one namespace.

pub mod client;
pub mod daemon;
pub mod executor;
pub mod spec;
pub mod stdio;

pub use client::ContainerdDaemon;
pub use daemon::{DaemonApi, DaemonError, RootfsMount, TaskStdio};
pub use executor::ContainerdExecutor;
pub use spec::ImageConfig;
