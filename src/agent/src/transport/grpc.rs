//! Polling transport against the workflow gRPC service
//!
//! The ingestion task repeatedly opens the worker's context stream, reads one context and,
//! when it names a pending action for this worker, fetches the workflow's action list and
//! hands the current action to the loop. An action is delivered once until the server moves
//! on to a different action or reports a non-pending state for this worker.

use crate::handoff::{Handoff, HandoffError};
use crate::proto::workflow_service_client::WorkflowServiceClient;
use crate::proto::{self, WorkflowActionStatus, WorkflowActionsRequest, WorkflowContextRequest};
use crate::transport::{tls, Transport, TransportError};
use async_trait::async_trait;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use workflow::{Action, Env, Event, Namespaces, State, Volume};

#[derive(Debug, Clone)]
pub struct GrpcConfig {
    /// Server `host:port`
    pub server: String,
    pub worker_id: String,
    pub tls: bool,
    /// Skip server certificate verification (only meaningful with `tls`)
    pub insecure_tls: bool,
    pub retry_interval: Duration,
    /// Pause after each status report before returning to the loop
    pub report_delay: Duration,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            worker_id: String::new(),
            tls: false,
            insecure_tls: false,
            retry_interval: Duration::from_secs(5),
            report_delay: Duration::ZERO,
        }
    }
}

/// Identity of the last action handed to the loop
type Delivered = (String, i64, proto::WorkflowAction);

enum Poll {
    Delivered,
    Retry,
    Stop,
}

pub struct GrpcTransport {
    config: GrpcConfig,
    client: WorkflowServiceClient<Channel>,
    actions: Handoff<Action>,
}

impl GrpcTransport {
    /// Build the transport. The channel connects lazily on first use.
    pub fn new(config: GrpcConfig) -> Result<Self, TransportError> {
        let channel = Self::channel(&config)?;
        tracing::info!(
            "[GrpcTransport] Using workflow server {} (tls: {}, insecure: {})",
            config.server,
            config.tls,
            config.insecure_tls
        );
        Ok(Self {
            config,
            client: WorkflowServiceClient::new(channel),
            actions: Handoff::new(),
        })
    }

    fn channel(config: &GrpcConfig) -> Result<Channel, TransportError> {
        let authority = config
            .server
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&config.server)
            .trim_end_matches('/');
        if authority.is_empty() {
            return Err(TransportError::Config("gRPC server address is empty".to_string()));
        }
        let connect_error = |e: tonic::transport::Error| TransportError::Connect {
            endpoint: authority.to_string(),
            message: e.to_string(),
        };

        if !config.tls {
            let endpoint =
                Endpoint::from_shared(format!("http://{}", authority)).map_err(connect_error)?;
            return Ok(endpoint.connect_lazy());
        }

        if config.insecure_tls {
            let endpoint =
                Endpoint::from_shared(format!("http://{}", authority)).map_err(connect_error)?;
            let tls_config = tls::insecure_client_config()
                .map_err(|e| TransportError::Config(format!("insecure TLS setup: {}", e)))?;
            return Ok(tls::insecure_channel(endpoint, tls_config));
        }

        let endpoint = Endpoint::from_shared(format!("https://{}", authority))
            .map_err(connect_error)?
            .tls_config(ClientTlsConfig::new().with_native_roots())
            .map_err(connect_error)?;
        Ok(endpoint.connect_lazy())
    }

    /// Poll the server and feed pending actions to the loop until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), TransportError> {
        tracing::info!(
            "[GrpcTransport] Polling for workflow actions as worker {}",
            self.config.worker_id
        );
        let mut delivered: Option<Delivered> = None;

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            match self.poll(&shutdown, &mut delivered).await? {
                Poll::Delivered => continue,
                Poll::Stop => return Ok(()),
                Poll::Retry => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.config.retry_interval) => {}
                    }
                }
            }
        }
    }

    async fn poll(
        &self,
        shutdown: &CancellationToken,
        delivered: &mut Option<Delivered>,
    ) -> Result<Poll, TransportError> {
        let context = tokio::select! {
            _ = shutdown.cancelled() => return Ok(Poll::Stop),
            context = self.next_context() => context,
        };
        let context = match context {
            Ok(Some(context)) => context,
            Ok(None) => {
                tracing::debug!("[GrpcTransport] No workflow context available");
                return Ok(Poll::Retry);
            }
            Err(e) => {
                tracing::warn!("[GrpcTransport] Failed to read workflow context: {}", e);
                return Ok(Poll::Retry);
            }
        };

        if context.current_worker != self.config.worker_id {
            return Ok(Poll::Retry);
        }
        if context.current_action_state() != proto::State::Pending {
            if delivered.take().is_some() {
                tracing::debug!(
                    "[GrpcTransport] Workflow {} left pending state, delivery memory cleared",
                    context.workflow_id
                );
            }
            return Ok(Poll::Retry);
        }

        let mut client = self.client.clone();
        let request = WorkflowActionsRequest {
            workflow_id: context.workflow_id.clone(),
        };
        let list = tokio::select! {
            _ = shutdown.cancelled() => return Ok(Poll::Stop),
            list = client.get_workflow_actions(request) => list,
        };
        let list = match list {
            Ok(list) => list.into_inner(),
            Err(e) => {
                tracing::warn!(
                    "[GrpcTransport] Failed to fetch actions of workflow {}: {}",
                    context.workflow_id,
                    e
                );
                return Ok(Poll::Retry);
            }
        };

        let index = context.current_action_index;
        let Some(wire) = usize::try_from(index)
            .ok()
            .and_then(|i| list.action_list.get(i))
        else {
            tracing::warn!(
                "[GrpcTransport] Workflow {} action index {} out of range ({} actions)",
                context.workflow_id,
                index,
                list.action_list.len()
            );
            return Ok(Poll::Retry);
        };

        let key: Delivered = (context.workflow_id.clone(), index, wire.clone());
        if delivered.as_ref() == Some(&key) {
            return Ok(Poll::Retry);
        }

        let action = translate(&context, wire);
        tracing::info!("[GrpcTransport] Delivering action {}", action);
        let batch = self.actions.batch();
        match self.actions.send(&batch, action, shutdown).await {
            Ok(()) => {
                *delivered = Some(key);
                Ok(Poll::Delivered)
            }
            Err(HandoffError::Cancelled) => Ok(Poll::Stop),
            Err(HandoffError::Abandoned) => Ok(Poll::Retry),
            Err(HandoffError::Closed) => Err(TransportError::Closed),
        }
    }

    /// Open the context stream and take its first message.
    async fn next_context(&self) -> Result<Option<proto::WorkflowContext>, tonic::Status> {
        let mut client = self.client.clone();
        let request = WorkflowContextRequest {
            worker_id: self.config.worker_id.clone(),
        };
        let mut stream = client.get_workflow_contexts(request).await?.into_inner();
        stream.message().await
    }
}

/// Convert the wire action the context points at into an [`Action`].
pub fn translate(context: &proto::WorkflowContext, wire: &proto::WorkflowAction) -> Action {
    let (cmd, args) = match wire.command.split_first() {
        Some((cmd, args)) => (cmd.clone(), args.to_vec()),
        None => (String::new(), Vec::new()),
    };

    Action {
        task_name: context.current_task.clone(),
        id: context.workflow_id.clone(),
        name: wire.name.clone(),
        image: wire.image.clone(),
        cmd,
        args,
        env: wire.environment.iter().map(|e| Env::parse(e)).collect(),
        volumes: wire.volumes.iter().cloned().map(Volume::from).collect(),
        namespaces: Namespaces {
            network: String::new(),
            pid: wire.pid.clone(),
        },
        retries: 0,
        timeout_seconds: wire.timeout,
    }
}

pub fn wire_state(state: State) -> proto::State {
    match state {
        State::Running => proto::State::Running,
        State::Success => proto::State::Success,
        State::Failure => proto::State::Failed,
        State::Timeout => proto::State::Timeout,
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn read(&self, shutdown: &CancellationToken) -> Result<Action, TransportError> {
        Ok(self.actions.recv(shutdown).await?)
    }

    async fn write(
        &self,
        shutdown: &CancellationToken,
        event: &Event,
    ) -> Result<(), TransportError> {
        let status = WorkflowActionStatus {
            workflow_id: event.action.id.clone(),
            task_name: event.action.task_name.clone(),
            action_name: event.action.name.clone(),
            action_status: wire_state(event.state) as i32,
            seconds: 0,
            message: event.message.clone(),
            created_at: Some(prost_types::Timestamp::from(SystemTime::now())),
            worker_id: self.config.worker_id.clone(),
        };

        let mut client = self.client.clone();
        tokio::select! {
            _ = shutdown.cancelled() => return Err(TransportError::Cancelled),
            reported = client.report_action_status(status) => {
                reported?;
            }
        }

        if !self.config.report_delay.is_zero() {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.config.report_delay) => {}
            }
        }
        Ok(())
    }
}
