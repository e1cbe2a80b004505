pub mod backoff;
pub mod context;
pub mod image;
/// Runtime-agnostic executor types and traits
///
/// Both runtime backends implement [`RuntimeExecutor`] and report failures as
/// [`RuntimeError`] so the agent loop never sees backend-specific errors.
pub mod types;
pub mod volume;

pub use backoff::ExponentialBackoff;
pub use context::{ExecContext, Interrupted};
pub use image::{ImageReference, RegistryAuth, DEFAULT_REGISTRY};
pub use types::{ProxyConfig, RuntimeError, RuntimeExecutor};
pub use volume::VolumeMount;
