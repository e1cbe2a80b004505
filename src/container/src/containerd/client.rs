use crate::containerd::daemon::{DaemonApi, DaemonError, RootfsMount, TaskStdio};
use crate::containerd::spec::{self, ImageConfig};
use async_trait::async_trait;
use containerd_client::services::v1::container::Runtime;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::snapshots::snapshots_client::SnapshotsClient;
use containerd_client::services::v1::snapshots::{PrepareSnapshotRequest, RemoveSnapshotRequest};
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::transfer_client::TransferClient;
use containerd_client::services::v1::{
    Container, CreateContainerRequest, CreateTaskRequest, DeleteContainerRequest,
    DeleteTaskRequest, GetImageRequest, KillRequest, ReadContentRequest, StartRequest,
    TransferOptions, TransferRequest, WaitRequest,
};
use containerd_client::types::transfer::{ImageStore, OciRegistry, UnpackConfiguration};
use containerd_client::types::{Mount, Platform};
use tonic::transport::Channel;
use tonic::{Code, Request};

const SNAPSHOTTER: &str = "overlayfs";
const RUNC_RUNTIME: &str = "io.containerd.runc.v2";
const SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Spec";
const NAMESPACE_HEADER: &str = "containerd-namespace";

/// [`DaemonApi`] over the containerd gRPC socket
#[derive(Clone)]
pub struct ContainerdDaemon {
    channel: Channel,
    namespace: String,
}

impl ContainerdDaemon {
    pub async fn connect(socket_path: &str, namespace: &str) -> Result<Self, DaemonError> {
        let channel = containerd_client::connect(socket_path)
            .await
            .map_err(|e| DaemonError::Connect {
                socket: socket_path.to_string(),
                message: e.to_string(),
            })?;
        tracing::debug!(
            "[ContainerdDaemon] Connected to {} (namespace {})",
            socket_path,
            namespace
        );
        Ok(Self {
            channel,
            namespace: namespace.to_string(),
        })
    }

    fn request<T>(&self, message: T) -> Result<Request<T>, DaemonError> {
        let mut request = Request::new(message);
        let value = self
            .namespace
            .parse()
            .map_err(|_| DaemonError::Message(format!("invalid namespace {}", self.namespace)))?;
        request.metadata_mut().insert(NAMESPACE_HEADER, value);
        Ok(request)
    }

    async fn read_blob(&self, digest: &str) -> Result<Vec<u8>, DaemonError> {
        let mut client = ContentClient::new(self.channel.clone());
        let request = self.request(ReadContentRequest {
            digest: digest.to_string(),
            offset: 0,
            size: 0,
        })?;
        let mut stream = client.read(request).await?.into_inner();
        let mut data = Vec::new();
        while let Some(chunk) = stream.message().await? {
            data.extend_from_slice(&chunk.data);
        }
        Ok(data)
    }

    async fn read_json(&self, digest: &str) -> Result<serde_json::Value, DaemonError> {
        let data = self.read_blob(digest).await?;
        serde_json::from_slice(&data)
            .map_err(|e| DaemonError::Content(format!("{}: {}", digest, e)))
    }
}

fn host_platform() -> Platform {
    let (os, arch) = spec::host_platform();
    Platform {
        os: os.to_string(),
        architecture: arch.to_string(),
        ..Default::default()
    }
}

#[async_trait]
impl DaemonApi for ContainerdDaemon {
    async fn image_exists(&self, reference: &str) -> Result<bool, DaemonError> {
        let mut client = ImagesClient::new(self.channel.clone());
        let request = self.request(GetImageRequest {
            name: reference.to_string(),
        })?;
        match client.get(request).await {
            Ok(response) => Ok(response.into_inner().image.is_some()),
            Err(status) if status.code() == Code::NotFound => Ok(false),
            Err(status) => Err(status.into()),
        }
    }

    async fn pull_image(&self, reference: &str) -> Result<(), DaemonError> {
        let platform = host_platform();
        let source = OciRegistry {
            reference: reference.to_string(),
            ..Default::default()
        };
        let destination = ImageStore {
            name: reference.to_string(),
            platforms: vec![platform.clone()],
            unpacks: vec![UnpackConfiguration {
                platform: Some(platform),
                snapshotter: SNAPSHOTTER.to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let mut client = TransferClient::new(self.channel.clone());
        let request = self.request(TransferRequest {
            source: Some(containerd_client::to_any(&source)),
            destination: Some(containerd_client::to_any(&destination)),
            options: Some(TransferOptions::default()),
        })?;
        client.transfer(request).await?;
        tracing::info!("[ContainerdDaemon] Pulled image {}", reference);
        Ok(())
    }

    async fn image_config(&self, reference: &str) -> Result<ImageConfig, DaemonError> {
        let mut client = ImagesClient::new(self.channel.clone());
        let request = self.request(GetImageRequest {
            name: reference.to_string(),
        })?;
        let target = client
            .get(request)
            .await?
            .into_inner()
            .image
            .and_then(|image| image.target)
            .ok_or_else(|| DaemonError::ImageNotFound(reference.to_string()))?;

        let mut manifest_digest = target.digest.clone();
        if spec::is_index(&target.media_type) {
            let index = self.read_json(&target.digest).await?;
            let (os, arch) = spec::host_platform();
            manifest_digest = spec::select_platform_manifest(&index, os, arch).ok_or_else(|| {
                DaemonError::Content(format!("{} has no usable platform manifest", reference))
            })?;
        }

        let manifest = self.read_json(&manifest_digest).await?;
        let config_digest = spec::manifest_config_digest(&manifest).ok_or_else(|| {
            DaemonError::Content(format!("manifest {} has no config", manifest_digest))
        })?;
        let config = self.read_blob(&config_digest).await?;
        spec::parse_image_config(&config)
            .map_err(|e| DaemonError::Content(format!("{}: {}", config_digest, e)))
    }

    async fn prepare_snapshot(
        &self,
        key: &str,
        parent: &str,
    ) -> Result<Vec<RootfsMount>, DaemonError> {
        let mut client = SnapshotsClient::new(self.channel.clone());
        let request = self.request(PrepareSnapshotRequest {
            snapshotter: SNAPSHOTTER.to_string(),
            key: key.to_string(),
            parent: parent.to_string(),
            ..Default::default()
        })?;
        let mounts = client.prepare(request).await?.into_inner().mounts;
        Ok(mounts
            .into_iter()
            .map(|m| RootfsMount {
                kind: m.r#type,
                source: m.source,
                options: m.options,
            })
            .collect())
    }

    async fn create_container(
        &self,
        id: &str,
        image: &str,
        snapshot_key: &str,
        spec: &serde_json::Value,
    ) -> Result<(), DaemonError> {
        let spec = prost_types::Any {
            type_url: SPEC_TYPE_URL.to_string(),
            value: serde_json::to_vec(spec)
                .map_err(|e| DaemonError::Message(format!("encode runtime spec: {}", e)))?,
        };
        let container = Container {
            id: id.to_string(),
            image: image.to_string(),
            runtime: Some(Runtime {
                name: RUNC_RUNTIME.to_string(),
                options: None,
            }),
            spec: Some(spec),
            snapshotter: SNAPSHOTTER.to_string(),
            snapshot_key: snapshot_key.to_string(),
            ..Default::default()
        };

        let mut client = ContainersClient::new(self.channel.clone());
        let request = self.request(CreateContainerRequest {
            container: Some(container),
        })?;
        client.create(request).await?;
        Ok(())
    }

    async fn create_task(
        &self,
        id: &str,
        rootfs: &[RootfsMount],
        stdio: &TaskStdio,
    ) -> Result<(), DaemonError> {
        let rootfs = rootfs
            .iter()
            .map(|m| Mount {
                r#type: m.kind.clone(),
                source: m.source.clone(),
                options: m.options.clone(),
                ..Default::default()
            })
            .collect();

        let mut client = TasksClient::new(self.channel.clone());
        let request = self.request(CreateTaskRequest {
            container_id: id.to_string(),
            rootfs,
            stdout: stdio.stdout.display().to_string(),
            stderr: stdio.stderr.display().to_string(),
            ..Default::default()
        })?;
        client.create(request).await?;
        Ok(())
    }

    async fn start_task(&self, id: &str) -> Result<(), DaemonError> {
        let mut client = TasksClient::new(self.channel.clone());
        let request = self.request(StartRequest {
            container_id: id.to_string(),
            ..Default::default()
        })?;
        client.start(request).await?;
        Ok(())
    }

    async fn wait_task(&self, id: &str) -> Result<u32, DaemonError> {
        let mut client = TasksClient::new(self.channel.clone());
        let request = self.request(WaitRequest {
            container_id: id.to_string(),
            ..Default::default()
        })?;
        Ok(client.wait(request).await?.into_inner().exit_status)
    }

    async fn kill_task(&self, id: &str, signal: i32) -> Result<(), DaemonError> {
        let mut client = TasksClient::new(self.channel.clone());
        let request = self.request(KillRequest {
            container_id: id.to_string(),
            signal: signal as u32,
            all: true,
            ..Default::default()
        })?;
        client.kill(request).await?;
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<(), DaemonError> {
        let mut client = TasksClient::new(self.channel.clone());
        let request = self.request(DeleteTaskRequest {
            container_id: id.to_string(),
        })?;
        client.delete(request).await?;
        Ok(())
    }

    async fn delete_container(&self, id: &str) -> Result<(), DaemonError> {
        let mut client = ContainersClient::new(self.channel.clone());
        let request = self.request(DeleteContainerRequest { id: id.to_string() })?;
        client.delete(request).await?;
        Ok(())
    }

    async fn remove_snapshot(&self, key: &str) -> Result<(), DaemonError> {
        let mut client = SnapshotsClient::new(self.channel.clone());
        let request = self.request(RemoveSnapshotRequest {
            snapshotter: SNAPSHOTTER.to_string(),
            key: key.to_string(),
        })?;
        client.remove(request).await?;
        Ok(())
    }
}
