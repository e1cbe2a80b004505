use crate::common::{
    ExecContext, ExponentialBackoff, Interrupted, ProxyConfig, RegistryAuth, RuntimeError,
    RuntimeExecutor,
};
use crate::docker::engine::{ContainerSpec, EngineApi, EngineError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use workflow::Action;

const PULL_ATTEMPTS: u32 = 5;
const STOP_GRACE: Duration = Duration::from_secs(5);
const REMOVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs actions as Docker containers
pub struct DockerExecutor {
    engine: Arc<dyn EngineApi>,
    registry_auth: Option<RegistryAuth>,
    proxy: ProxyConfig,
    pull_attempts: u32,
    pull_backoff: ExponentialBackoff,
    stop_grace: Duration,
    remove_timeout: Duration,
}

impl DockerExecutor {
    pub fn new(engine: Arc<dyn EngineApi>) -> Self {
        Self {
            engine,
            registry_auth: None,
            proxy: ProxyConfig::default(),
            pull_attempts: PULL_ATTEMPTS,
            pull_backoff: ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(16)),
            stop_grace: STOP_GRACE,
            remove_timeout: REMOVE_TIMEOUT,
        }
    }

    pub fn with_registry_auth(mut self, auth: Option<RegistryAuth>) -> Self {
        self.registry_auth = auth;
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = proxy;
        self
    }

    /// Override the pull retry policy.
    pub fn with_pull_policy(mut self, attempts: u32, backoff: ExponentialBackoff) -> Self {
        self.pull_attempts = attempts.max(1);
        self.pull_backoff = backoff;
        self
    }

    async fn pull(&self, ctx: &ExecContext, action: &Action) -> Result<(), RuntimeError> {
        let mut backoff = self.pull_backoff.clone();
        let mut last_error = String::new();

        for attempt in 1..=self.pull_attempts {
            let outcome = tokio::select! {
                r = self.pull_once(&action.image) => r,
                reason = ctx.done() => return Err(interrupted(action, reason)),
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        "[DockerExecutor] Pull of {} failed (attempt {}/{}): {}",
                        action.image,
                        attempt,
                        self.pull_attempts,
                        e
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < self.pull_attempts {
                tokio::select! {
                    _ = tokio::time::sleep(backoff.next_delay()) => {}
                    reason = ctx.done() => return Err(interrupted(action, reason)),
                }
            }
        }

        Err(RuntimeError::Pull {
            action: action.id.clone(),
            image: action.image.clone(),
            message: last_error,
        })
    }

    async fn pull_once(&self, image: &str) -> Result<(), EngineError> {
        match self
            .engine
            .pull_image(image, self.registry_auth.as_ref())
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                // Images embedded in the host OS may be present without registry access.
                if let Ok(true) = self.engine.image_exists(image).await {
                    tracing::info!(
                        "[DockerExecutor] Pull of {} failed but image is present locally: {}",
                        image,
                        e
                    );
                    return Ok(());
                }
                Err(e)
            }
        }
    }

    async fn run_container(
        &self,
        ctx: &ExecContext,
        action: &Action,
        id: &str,
    ) -> Result<(), RuntimeError> {
        let armed = tokio::select! {
            r = self.engine.arm_wait(id) => r,
            reason = ctx.done() => return Err(interrupted(action, reason)),
        };
        let wait = armed.map_err(|e| RuntimeError::Wait {
            action: action.id.clone(),
            message: e.to_string(),
        })?;

        if let Err(e) = self.engine.start_container(id).await {
            return Err(RuntimeError::Start {
                action: action.id.clone(),
                message: e.to_string(),
            });
        }
        tracing::info!("[DockerExecutor] Started container {} for action {}", id, action.name);

        tokio::select! {
            status = wait => match status {
                Ok(0) => Ok(()),
                Ok(code) => Err(RuntimeError::NonZeroExit {
                    action: action.id.clone(),
                    code,
                }),
                Err(e) => Err(RuntimeError::Wait {
                    action: action.id.clone(),
                    message: e.to_string(),
                }),
            },
            reason = ctx.done() => {
                self.stop(id).await;
                Err(interrupted(action, reason))
            }
        }
    }

    /// Graceful stop on its own timer; the action context has already fired.
    async fn stop(&self, id: &str) {
        let bound = self.stop_grace + Duration::from_secs(5);
        match tokio::time::timeout(bound, self.engine.stop_container(id, self.stop_grace)).await {
            Ok(Ok(())) => tracing::debug!("[DockerExecutor] Stopped container {}", id),
            Ok(Err(e)) => {
                tracing::warn!("[DockerExecutor] Failed to gracefully stop container {}: {}", id, e)
            }
            Err(_) => tracing::warn!("[DockerExecutor] Timed out stopping container {}", id),
        }
    }
}

#[async_trait]
impl RuntimeExecutor for DockerExecutor {
    async fn execute(&self, ctx: &ExecContext, action: &Action) -> Result<(), RuntimeError> {
        if let Some(reason) = ctx.err() {
            return Err(interrupted(action, reason));
        }

        self.pull(ctx, action).await?;

        let spec = ContainerSpec::for_action(action, &self.proxy);
        let name = workflow::container_name(&action.id, &action.name);
        let id = self
            .engine
            .create_container(&name, &spec)
            .await
            .map_err(|e| RuntimeError::Create {
                action: action.id.clone(),
                message: e.to_string(),
            })?;
        tracing::debug!("[DockerExecutor] Created container {} ({})", name, id);

        let guard = ContainerGuard::new(self.engine.clone(), id.clone(), name, self.remove_timeout);
        let result = self.run_container(ctx, action, &id).await;
        guard.release().await;
        result
    }
}

fn interrupted(action: &Action, reason: Interrupted) -> RuntimeError {
    RuntimeError::Interrupted {
        action: action.id.clone(),
        reason,
    }
}

/// Force-removes a created container exactly once.
///
/// [`ContainerGuard::release`] awaits the removal; if the guard is dropped instead (the
/// execute future was cancelled) the removal is spawned.
struct ContainerGuard {
    engine: Arc<dyn EngineApi>,
    id: Option<String>,
    name: String,
    timeout: Duration,
}

impl ContainerGuard {
    fn new(engine: Arc<dyn EngineApi>, id: String, name: String, timeout: Duration) -> Self {
        Self {
            engine,
            id: Some(id),
            name,
            timeout,
        }
    }

    async fn release(mut self) {
        if let Some(id) = self.id.take() {
            let cleanup = remove_container(self.engine.clone(), id, self.name.clone(), self.timeout);
            // Spawned so the removal survives the caller being dropped mid-await.
            if let Err(e) = tokio::spawn(cleanup).await {
                tracing::warn!("[DockerExecutor] Container cleanup task failed: {}", e);
            }
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            let cleanup = remove_container(self.engine.clone(), id, self.name.clone(), self.timeout);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(cleanup);
                }
                Err(_) => tracing::warn!(
                    "[DockerExecutor] No runtime to remove container {}",
                    self.name
                ),
            }
        }
    }
}

async fn remove_container(engine: Arc<dyn EngineApi>, id: String, name: String, timeout: Duration) {
    match tokio::time::timeout(timeout, engine.remove_container(&id)).await {
        Ok(Ok(())) => tracing::debug!("[DockerExecutor] Removed container {}", name),
        Ok(Err(e)) => tracing::warn!("[DockerExecutor] Couldn't remove container {}: {}", name, e),
        Err(_) => tracing::warn!(
            "[DockerExecutor] Timed out removing container {} after {:?}",
            name,
            timeout
        ),
    }
}
