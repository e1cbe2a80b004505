use crate::common::{
    ExecContext, ImageReference, Interrupted, ProxyConfig, RuntimeError, RuntimeExecutor,
    DEFAULT_REGISTRY,
};
use crate::containerd::daemon::{DaemonApi, DaemonError, TaskStdio};
use crate::containerd::spec;
use crate::containerd::stdio::TaskIo;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::AbortOnDropHandle;
use workflow::Action;

const KILL_GRACE: Duration = Duration::from_secs(5);
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Runs actions as containerd tasks
pub struct ContainerdExecutor {
    daemon: Arc<dyn DaemonApi>,
    registry: String,
    proxy: ProxyConfig,
    kill_grace: Duration,
    forward_stdio: bool,
}

impl ContainerdExecutor {
    pub fn new(daemon: Arc<dyn DaemonApi>) -> Self {
        Self {
            daemon,
            registry: DEFAULT_REGISTRY.to_string(),
            proxy: ProxyConfig::default(),
            kill_grace: KILL_GRACE,
            forward_stdio: true,
        }
    }

    /// Registry used to qualify short image names. Empty keeps `docker.io`.
    pub fn with_registry(mut self, registry: &str) -> Self {
        if !registry.is_empty() {
            self.registry = registry.to_string();
        }
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Disable forwarding task output through FIFOs.
    pub fn without_stdio(mut self) -> Self {
        self.forward_stdio = false;
        self
    }

    async fn ensure_image(&self, reference: &str) -> Result<spec::ImageConfig, DaemonError> {
        if !self.daemon.image_exists(reference).await? {
            tracing::info!("[ContainerdExecutor] Pulling image {}", reference);
            self.daemon.pull_image(reference).await?;
        }
        self.daemon.image_config(reference).await
    }

    async fn run_task(
        &self,
        ctx: &ExecContext,
        action: &Action,
        id: &str,
    ) -> Result<(), RuntimeError> {
        let daemon = self.daemon.clone();
        let wait_id = id.to_string();
        let mut wait =
            AbortOnDropHandle::new(tokio::spawn(async move { daemon.wait_task(&wait_id).await }));

        if let Err(e) = self.daemon.start_task(id).await {
            return Err(RuntimeError::Start {
                action: action.id.clone(),
                message: e.to_string(),
            });
        }
        tracing::info!("[ContainerdExecutor] Started task {} for action {}", id, action.name);

        tokio::select! {
            joined = &mut wait => match joined {
                Ok(Ok(0)) => Ok(()),
                Ok(Ok(status)) => Err(RuntimeError::NonZeroExit {
                    action: action.id.clone(),
                    code: i64::from(status),
                }),
                Ok(Err(e)) => Err(RuntimeError::Wait {
                    action: action.id.clone(),
                    message: e.to_string(),
                }),
                Err(e) => Err(RuntimeError::Wait {
                    action: action.id.clone(),
                    message: e.to_string(),
                }),
            },
            reason = ctx.done() => {
                self.terminate(id, &mut wait).await;
                Err(interrupted(action, reason))
            }
        }
    }

    /// SIGTERM, wait out the grace period, then SIGKILL.
    async fn terminate(
        &self,
        id: &str,
        wait: &mut AbortOnDropHandle<Result<u32, DaemonError>>,
    ) {
        if let Err(e) = self.daemon.kill_task(id, Signal::SIGTERM as i32).await {
            tracing::warn!("[ContainerdExecutor] Failed to send SIGTERM to task {}: {}", id, e);
        }
        if tokio::time::timeout(self.kill_grace, &mut *wait).await.is_ok() {
            return;
        }

        tracing::warn!(
            "[ContainerdExecutor] Task {} still running after {:?}, sending SIGKILL",
            id,
            self.kill_grace
        );
        if let Err(e) = self.daemon.kill_task(id, Signal::SIGKILL as i32).await {
            tracing::warn!("[ContainerdExecutor] Failed to send SIGKILL to task {}: {}", id, e);
        }
        if tokio::time::timeout(KILL_WAIT, &mut *wait).await.is_err() {
            tracing::warn!("[ContainerdExecutor] Task {} did not exit after SIGKILL", id);
        }
    }
}

#[async_trait]
impl RuntimeExecutor for ContainerdExecutor {
    async fn execute(&self, ctx: &ExecContext, action: &Action) -> Result<(), RuntimeError> {
        if let Some(reason) = ctx.err() {
            return Err(interrupted(action, reason));
        }

        let pull_error = |message: String| RuntimeError::Pull {
            action: action.id.clone(),
            image: action.image.clone(),
            message,
        };
        let reference = ImageReference::resolve(&action.image, &self.registry)
            .map_err(pull_error)?
            .to_string();

        let image = tokio::select! {
            r = self.ensure_image(&reference) => r.map_err(|e| pull_error(e.to_string()))?,
            reason = ctx.done() => return Err(interrupted(action, reason)),
        };
        tracing::info!("[ContainerdExecutor] Image {} ready", reference);

        let create_error = |e: &dyn std::fmt::Display| RuntimeError::Create {
            action: action.id.clone(),
            message: e.to_string(),
        };
        let name = workflow::container_name(&action.id, &action.name);
        let env = spec::merge_env(&image.env, &self.proxy.apply(&action.env));
        let runtime_spec = spec::runtime_spec(action, &image, &env);

        let mut resources = DaemonResources::new(self.daemon.clone());

        let result = async {
            let rootfs = self
                .daemon
                .prepare_snapshot(&name, &image.chain_id)
                .await
                .map_err(|e| create_error(&e))?;
            resources.snapshot = Some(name.clone());

            self.daemon
                .create_container(&name, &reference, &name, &runtime_spec)
                .await
                .map_err(|e| create_error(&e))?;
            resources.container = Some(name.clone());

            let io = if self.forward_stdio {
                Some(TaskIo::create(&name).map_err(|e| create_error(&e))?)
            } else {
                None
            };
            let stdio = io
                .as_ref()
                .map(|io| TaskStdio {
                    stdout: io.stdout().to_path_buf(),
                    stderr: io.stderr().to_path_buf(),
                })
                .unwrap_or_default();

            self.daemon
                .create_task(&name, &rootfs, &stdio)
                .await
                .map_err(|e| create_error(&e))?;
            resources.task = Some(name.clone());

            let outcome = self.run_task(ctx, action, &name).await;
            drop(io);
            outcome
        }
        .await;

        resources.release().await;
        result
    }
}

fn interrupted(action: &Action, reason: Interrupted) -> RuntimeError {
    RuntimeError::Interrupted {
        action: action.id.clone(),
        reason,
    }
}

/// Daemon resources created for one action, torn down task, container, snapshot.
///
/// Every step is attempted even when an earlier one fails. Dropping an unreleased guard
/// spawns the teardown.
struct DaemonResources {
    daemon: Arc<dyn DaemonApi>,
    task: Option<String>,
    container: Option<String>,
    snapshot: Option<String>,
}

impl DaemonResources {
    fn new(daemon: Arc<dyn DaemonApi>) -> Self {
        Self {
            daemon,
            task: None,
            container: None,
            snapshot: None,
        }
    }

    fn take_teardown(&mut self) -> impl std::future::Future<Output = ()> + Send + 'static {
        teardown(
            self.daemon.clone(),
            self.task.take(),
            self.container.take(),
            self.snapshot.take(),
        )
    }

    async fn release(mut self) {
        if let Err(e) = tokio::spawn(self.take_teardown()).await {
            tracing::warn!("[ContainerdExecutor] Teardown task failed: {}", e);
        }
    }
}

impl Drop for DaemonResources {
    fn drop(&mut self) {
        if self.task.is_none() && self.container.is_none() && self.snapshot.is_none() {
            return;
        }
        let cleanup = self.take_teardown();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cleanup);
            }
            Err(_) => tracing::warn!("[ContainerdExecutor] No runtime to tear down resources"),
        }
    }
}

async fn teardown(
    daemon: Arc<dyn DaemonApi>,
    task: Option<String>,
    container: Option<String>,
    snapshot: Option<String>,
) {
    if let Some(id) = task {
        match daemon.delete_task(&id).await {
            Ok(()) => tracing::debug!("[ContainerdExecutor] Deleted task {}", id),
            Err(e) => tracing::warn!("[ContainerdExecutor] Failed to delete task {}: {}", id, e),
        }
    }
    if let Some(id) = container {
        match daemon.delete_container(&id).await {
            Ok(()) => tracing::debug!("[ContainerdExecutor] Deleted container {}", id),
            Err(e) => {
                tracing::warn!("[ContainerdExecutor] Failed to delete container {}: {}", id, e)
            }
        }
    }
    if let Some(key) = snapshot {
        match daemon.remove_snapshot(&key).await {
            Ok(()) => tracing::debug!("[ContainerdExecutor] Removed snapshot {}", key),
            Err(e) => {
                tracing::warn!("[ContainerdExecutor] Failed to remove snapshot {}: {}", key, e)
            }
        }
    }
}
