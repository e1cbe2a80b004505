use crate::containerd::spec::ImageConfig;
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Failed to connect to containerd at {socket}: {message}")]
    Connect { socket: String, message: String },

    #[error("containerd RPC failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Invalid image content: {0}")]
    Content(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Message(String),
}

/// Snapshot mount handed to the task as its root filesystem
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootfsMount {
    pub kind: String,
    pub source: String,
    pub options: Vec<String>,
}

/// Paths of the FIFOs a task writes to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskStdio {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// containerd operations used by the executor. All calls are scoped to one namespace.
#[async_trait]
pub trait DaemonApi: Send + Sync {
    async fn image_exists(&self, reference: &str) -> Result<bool, DaemonError>;

    /// Pull and unpack an image for the host platform.
    async fn pull_image(&self, reference: &str) -> Result<(), DaemonError>;

    /// Read the image config and layer chain id from the content store.
    async fn image_config(&self, reference: &str) -> Result<ImageConfig, DaemonError>;

    async fn prepare_snapshot(&self, key: &str, parent: &str)
        -> Result<Vec<RootfsMount>, DaemonError>;

    async fn create_container(
        &self,
        id: &str,
        image: &str,
        snapshot_key: &str,
        spec: &serde_json::Value,
    ) -> Result<(), DaemonError>;

    async fn create_task(
        &self,
        id: &str,
        rootfs: &[RootfsMount],
        stdio: &TaskStdio,
    ) -> Result<(), DaemonError>;

    async fn start_task(&self, id: &str) -> Result<(), DaemonError>;

    /// Block until the task exits and return its exit status.
    async fn wait_task(&self, id: &str) -> Result<u32, DaemonError>;

    async fn kill_task(&self, id: &str, signal: i32) -> Result<(), DaemonError>;

    async fn delete_task(&self, id: &str) -> Result<(), DaemonError>;

    async fn delete_container(&self, id: &str) -> Result<(), DaemonError>;

    async fn remove_snapshot(&self, key: &str) -> Result<(), DaemonError>;
}
