use crate::common::{ProxyConfig, RegistryAuth};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerWaitResponse, HostConfig};
use bollard::Docker;
use futures::future::BoxFuture;
use futures::StreamExt;
use std::task::Poll;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::task::AbortOnDropHandle;
use workflow::Action;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Docker API error: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("{0}")]
    Message(String),
}

/// Container definition handed to the engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub binds: Vec<String>,
    pub pid_mode: Option<String>,
    pub network_mode: Option<String>,
    pub privileged: bool,
}

impl ContainerSpec {
    /// Map an action onto an engine container definition.
    ///
    /// The action `cmd` is the program launched in the container, so it becomes the
    /// entrypoint and the action `args` become the engine command.
    pub fn for_action(action: &Action, proxy: &ProxyConfig) -> Self {
        let entrypoint = if action.cmd.is_empty() {
            Vec::new()
        } else {
            vec![action.cmd.clone()]
        };
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

        Self {
            image: action.image.clone(),
            entrypoint,
            cmd: action.args.clone(),
            env: proxy.apply(&action.env),
            binds: action.volumes.iter().map(|v| v.to_string()).collect(),
            pid_mode: non_empty(&action.namespaces.pid),
            network_mode: non_empty(&action.namespaces.network),
            privileged: true,
        }
    }
}

/// Exit status of a container whose wait has been registered with the engine
pub type ExitWait = BoxFuture<'static, Result<i64, EngineError>>;

/// Docker Engine operations used by the executor
#[async_trait]
pub trait EngineApi: Send + Sync {
    /// Pull an image, draining the progress stream until the pull completes.
    async fn pull_image(&self, image: &str, auth: Option<&RegistryAuth>)
        -> Result<(), EngineError>;

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError>;

    /// Create a container and return its id.
    async fn create_container(&self, name: &str, spec: &ContainerSpec)
        -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Register a wait for the next exit of the container.
    ///
    /// Returns once the wait request is in flight, so a container started afterwards cannot
    /// exit unobserved. The returned future resolves with the exit status code.
    async fn arm_wait(&self, id: &str) -> Result<ExitWait, EngineError>;

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), EngineError>;

    /// Force-remove the container.
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;
}

/// [`EngineApi`] over the Docker Engine API socket
#[derive(Clone)]
pub struct BollardEngine {
    docker: Docker,
}

impl BollardEngine {
    pub fn connect(socket_path: &str) -> Result<Self, EngineError> {
        let docker = Docker::connect_with_unix(socket_path, 120, bollard::API_DEFAULT_VERSION)?;
        tracing::debug!("[BollardEngine] Connected to Docker socket {}", socket_path);
        Ok(Self { docker })
    }
}

#[async_trait]
impl EngineApi for BollardEngine {
    async fn pull_image(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), EngineError> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let credentials = auth.map(|a| DockerCredentials {
            username: Some(a.username.clone()),
            password: Some(a.password.clone()),
            serveraddress: (!a.server.is_empty()).then(|| a.server.clone()),
            ..Default::default()
        });

        let mut progress = self.docker.create_image(Some(options), None, credentials);
        while let Some(info) = progress.next().await {
            let info = info?;
            if let Some(error) = info.error {
                return Err(EngineError::Message(error));
            }
        }
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, EngineError> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let host_config = HostConfig {
            binds: Some(spec.binds.clone()),
            privileged: Some(spec.privileged),
            pid_mode: spec.pid_mode.clone(),
            network_mode: spec.network_mode.clone(),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            entrypoint: (!spec.entrypoint.is_empty()).then(|| spec.entrypoint.clone()),
            cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
            env: Some(spec.env.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self.docker.create_container(Some(options), config).await?;
        for warning in &response.warnings {
            tracing::warn!("[BollardEngine] Container {} create warning: {}", name, warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn arm_wait(&self, id: &str) -> Result<ExitWait, EngineError> {
        let docker = self.docker.clone();
        let wait_id = id.to_string();
        let (armed_tx, armed_rx) = oneshot::channel();

        let next_exit = AbortOnDropHandle::new(tokio::spawn(async move {
            let mut stream = Box::pin(docker.wait_container(
                &wait_id,
                Some(WaitContainerOptions {
                    condition: "next-exit",
                }),
            ));
            // The first poll dispatches the request.
            let first = futures::poll!(stream.next());
            let _ = armed_tx.send(());
            let item = match first {
                Poll::Ready(item) => item,
                Poll::Pending => stream.next().await,
            };
            exit_status(item, &wait_id)
        }));

        armed_rx.await.map_err(|_| {
            EngineError::Message(format!("wait for container {} was not registered", id))
        })?;
        tracing::debug!("[BollardEngine] Armed exit wait for container {}", id);

        // Polled only after start: a level-triggered wait also covers an exit that raced
        // the next-exit registration on the daemon side.
        let docker = self.docker.clone();
        let id = id.to_string();
        Ok(Box::pin(async move {
            let mut stream = Box::pin(docker.wait_container(
                &id,
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            ));
            tokio::select! {
                joined = next_exit => match joined {
                    Ok(status) => status,
                    Err(e) => Err(EngineError::Message(e.to_string())),
                },
                item = stream.next() => exit_status(item, &id),
            }
        }))
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), EngineError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        self.docker.stop_container(id, Some(options)).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }
}

fn exit_status(
    item: Option<Result<ContainerWaitResponse, bollard::errors::Error>>,
    id: &str,
) -> Result<i64, EngineError> {
    match item {
        Some(Ok(response)) => match response.error.and_then(|e| e.message) {
            Some(message) if !message.is_empty() => Err(EngineError::Message(message)),
            _ => Ok(response.status_code),
        },
        // The engine reports a non-zero exit as an error carrying the code.
        Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
        Some(Err(e)) => Err(e.into()),
        None => Err(EngineError::Message(format!(
            "wait stream for container {} ended without a status",
            id
        ))),
    }
}
