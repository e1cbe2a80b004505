//! Command line and environment configuration
//!
//! Flags are parsed with clap and validated into a typed [`Config`]. Running without a
//! subcommand is the legacy mode: gRPC transport with the Docker runtime, configured by the
//! `--tinkerbell-*` flags.

use crate::transport::grpc::GrpcConfig;
use crate::transport::nats::NatsConfig;
use crate::transport::TransportError;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use container::{ProxyConfig, RegistryAuth};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("--id is required for the {0} transport")]
    MissingId(TransportKind),

    #[error("a server address is required for the {0} transport")]
    MissingServer(TransportKind),

    #[error("--workflow-path is required for the file transport")]
    MissingWorkflowPath,

    #[error("invalid runtime '{0}', must be one of [docker, containerd]")]
    InvalidRuntime(String),

    #[error("invalid transport '{0}', must be one of [grpc, file, nats]")]
    InvalidTransport(String),

    #[error("unable to create Docker client: {0}")]
    DockerClient(String),

    #[error("unable to create containerd client: {0}")]
    ContainerdClient(String),

    #[error("unsupported on this platform: {0}")]
    Unsupported(String),

    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),
}

impl BootstrapError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            BootstrapError::DockerClient(_) => 12,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Grpc,
    File,
    Nats,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Grpc => "grpc",
            TransportKind::File => "file",
            TransportKind::Nats => "nats",
        };
        f.write_str(name)
    }
}

impl FromStr for TransportKind {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "grpc" => Ok(TransportKind::Grpc),
            "file" => Ok(TransportKind::File),
            "nats" => Ok(TransportKind::Nats),
            _ => Err(BootstrapError::InvalidTransport(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Docker,
    Containerd,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Containerd => "containerd",
        };
        f.write_str(name)
    }
}

impl FromStr for RuntimeKind {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(RuntimeKind::Docker),
            "containerd" => Ok(RuntimeKind::Containerd),
            _ => Err(BootstrapError::InvalidRuntime(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Parser, Debug)]
#[command(
    name = "tink-agent",
    version,
    about = "Runs provisioning workflow actions as containers and reports their status"
)]
pub struct Cli {
    /// Agent (worker) identifier
    #[arg(long, env = "TINK_AGENT_ID", default_value = "", global = true)]
    pub id: String,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "TINK_AGENT_LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    #[arg(long, env = "TINK_AGENT_LOG_FORMAT", value_enum, default_value = "json", global = true)]
    pub log_format: LogFormat,

    /// Registry that image pulls authenticate against and short names resolve to
    #[arg(long, env = "TINK_AGENT_REGISTRY_NAME", default_value = "", global = true)]
    pub registry_name: String,

    #[arg(long, env = "TINK_AGENT_REGISTRY_USER", default_value = "", global = true)]
    pub registry_user: String,

    #[arg(long, env = "TINK_AGENT_REGISTRY_PASS", default_value = "", global = true, hide_env_values = true)]
    pub registry_pass: String,

    #[arg(long, env = "TINK_AGENT_HTTP_PROXY", default_value = "", global = true)]
    pub http_proxy: String,

    #[arg(long, env = "TINK_AGENT_HTTPS_PROXY", default_value = "", global = true)]
    pub https_proxy: String,

    #[arg(long, env = "TINK_AGENT_NO_PROXY", default_value = "", global = true)]
    pub no_proxy: String,

    /// Container runtime: docker or containerd
    #[arg(long, env = "TINK_AGENT_RUNTIME", default_value = "docker", global = true)]
    pub runtime: String,

    #[arg(long, env = "TINK_AGENT_DOCKER_SOCKET", default_value = "/var/run/docker.sock", global = true)]
    pub docker_socket: PathBuf,

    #[arg(long, env = "TINK_AGENT_CONTAINERD_NAMESPACE", default_value = "tinkerbell", global = true)]
    pub containerd_namespace: String,

    #[arg(long, env = "TINK_AGENT_CONTAINERD_SOCKET", default_value = "/run/containerd/containerd.sock", global = true)]
    pub containerd_socket: PathBuf,

    /// Legacy: workflow server `host:port`
    #[arg(long, env = "TINKERBELL_GRPC_AUTHORITY", default_value = "")]
    pub tinkerbell_grpc_authority: String,

    /// Legacy: use TLS for the workflow server
    #[arg(long, env = "TINKERBELL_TLS", default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub tinkerbell_tls: bool,

    /// Legacy: skip workflow server certificate verification
    #[arg(long, env = "TINKERBELL_INSECURE_TLS", default_value_t = false, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub tinkerbell_insecure_tls: bool,

    /// Legacy alias of --registry-name
    #[arg(long, env = "DOCKER_REGISTRY", default_value = "")]
    pub docker_registry: String,

    /// Legacy alias of --registry-user
    #[arg(long, env = "REGISTRY_USERNAME", default_value = "")]
    pub registry_username: String,

    /// Legacy alias of --registry-pass
    #[arg(long, env = "REGISTRY_PASSWORD", default_value = "", hide_env_values = true)]
    pub registry_password: String,

    #[command(subcommand)]
    pub transport: Option<TransportCommand>,
}

#[derive(Subcommand, Debug)]
pub enum TransportCommand {
    /// Poll the workflow gRPC service
    Grpc(GrpcArgs),
    /// Run the actions of a local workflow file
    File(FileArgs),
    /// Receive action batches over NATS
    Nats(NatsArgs),
}

#[derive(Args, Debug)]
pub struct GrpcArgs {
    /// Workflow server `host:port`
    #[arg(long, env = "TINK_AGENT_GRPC_SERVER", default_value = "")]
    pub grpc_server: String,

    #[arg(long, env = "TINK_AGENT_GRPC_TLS", default_value_t = false, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub grpc_tls: bool,

    #[arg(long, env = "TINK_AGENT_GRPC_INSECURE_TLS", default_value_t = false, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub grpc_insecure_tls: bool,

    /// Seconds to wait before polling again
    #[arg(long, env = "TINK_AGENT_GRPC_RETRY_INTERVAL", default_value_t = 5)]
    pub grpc_retry_interval: u64,

    /// Milliseconds to pause after each status report
    #[arg(long, env = "TINK_AGENT_GRPC_REPORT_DELAY", default_value_t = 0)]
    pub grpc_report_delay: u64,
}

#[derive(Args, Debug)]
pub struct FileArgs {
    #[arg(long, env = "TINK_AGENT_WORKFLOW_PATH")]
    pub workflow_path: Option<PathBuf>,

    /// Skip the rest of the file after a failed or timed-out action
    #[arg(long, env = "TINK_AGENT_ABANDON_ON_FAILURE", default_value_t = false)]
    pub abandon_on_failure: bool,
}

#[derive(Args, Debug)]
pub struct NatsArgs {
    /// NATS server `host:port`
    #[arg(long, env = "TINK_AGENT_NATS_SERVER", default_value = "")]
    pub nats_server: String,

    #[arg(long, env = "TINK_AGENT_NATS_STREAM", default_value = "tinkerbell")]
    pub nats_stream: String,

    #[arg(long, env = "TINK_AGENT_NATS_EVENTS", default_value = "workflow_status")]
    pub nats_events: String,

    #[arg(long, env = "TINK_AGENT_NATS_ACTIONS", default_value = "workflow_actions")]
    pub nats_actions: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeConfig {
    Docker {
        socket: PathBuf,
    },
    Containerd {
        socket: PathBuf,
        namespace: String,
    },
}

impl RuntimeConfig {
    pub fn kind(&self) -> RuntimeKind {
        match self {
            RuntimeConfig::Docker { .. } => RuntimeKind::Docker,
            RuntimeConfig::Containerd { .. } => RuntimeKind::Containerd,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransportConfig {
    Grpc(GrpcConfig),
    File {
        path: PathBuf,
        abandon_on_failure: bool,
    },
    Nats(NatsConfig),
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Grpc(_) => TransportKind::Grpc,
            TransportConfig::File { .. } => TransportKind::File,
            TransportConfig::Nats(_) => TransportKind::Nats,
        }
    }
}

/// Validated agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub id: String,
    pub log_level: String,
    pub log_format: LogFormat,
    /// Preferred registry, empty for the runtime default
    pub registry: String,
    pub registry_auth: Option<RegistryAuth>,
    pub proxy: ProxyConfig,
    pub runtime: RuntimeConfig,
    pub transport: TransportConfig,
}

fn first_set(preferred: String, fallback: String) -> String {
    if preferred.is_empty() {
        fallback
    } else {
        preferred
    }
}

impl Cli {
    pub fn into_config(self) -> Result<Config, BootstrapError> {
        let legacy = self.transport.is_none();

        let runtime = if legacy {
            RuntimeKind::Docker
        } else {
            self.runtime.parse()?
        };
        let runtime = match runtime {
            RuntimeKind::Docker => RuntimeConfig::Docker {
                socket: self.docker_socket,
            },
            RuntimeKind::Containerd => RuntimeConfig::Containerd {
                socket: self.containerd_socket,
                namespace: self.containerd_namespace,
            },
        };

        let transport = match self.transport {
            None => {
                if self.id.is_empty() {
                    return Err(BootstrapError::MissingId(TransportKind::Grpc));
                }
                if self.tinkerbell_grpc_authority.is_empty() {
                    return Err(BootstrapError::MissingServer(TransportKind::Grpc));
                }
                TransportConfig::Grpc(GrpcConfig {
                    server: self.tinkerbell_grpc_authority,
                    worker_id: self.id.clone(),
                    tls: self.tinkerbell_tls,
                    insecure_tls: self.tinkerbell_insecure_tls,
                    ..GrpcConfig::default()
                })
            }
            Some(TransportCommand::Grpc(args)) => {
                if self.id.is_empty() {
                    return Err(BootstrapError::MissingId(TransportKind::Grpc));
                }
                if args.grpc_server.is_empty() {
                    return Err(BootstrapError::MissingServer(TransportKind::Grpc));
                }
                TransportConfig::Grpc(GrpcConfig {
                    server: args.grpc_server,
                    worker_id: self.id.clone(),
                    tls: args.grpc_tls,
                    insecure_tls: args.grpc_insecure_tls,
                    retry_interval: Duration::from_secs(args.grpc_retry_interval),
                    report_delay: Duration::from_millis(args.grpc_report_delay),
                })
            }
            Some(TransportCommand::File(args)) => TransportConfig::File {
                path: args.workflow_path.ok_or(BootstrapError::MissingWorkflowPath)?,
                abandon_on_failure: args.abandon_on_failure,
            },
            Some(TransportCommand::Nats(args)) => {
                if self.id.is_empty() {
                    return Err(BootstrapError::MissingId(TransportKind::Nats));
                }
                if args.nats_server.is_empty() {
                    return Err(BootstrapError::MissingServer(TransportKind::Nats));
                }
                TransportConfig::Nats(NatsConfig {
                    server: args.nats_server,
                    stream: args.nats_stream,
                    events_subject: args.nats_events,
                    actions_subject: args.nats_actions,
                    agent_id: self.id.clone(),
                })
            }
        };

        let registry = first_set(self.registry_name, self.docker_registry);
        let user = first_set(self.registry_user, self.registry_username);
        let pass = first_set(self.registry_pass, self.registry_password);
        let registry_auth = RegistryAuth::from_parts(&registry, &user, &pass);

        Ok(Config {
            id: self.id,
            log_level: self.log_level,
            log_format: self.log_format,
            registry,
            registry_auth,
            proxy: ProxyConfig {
                http_proxy: self.http_proxy,
                https_proxy: self.https_proxy,
                no_proxy: self.no_proxy,
            },
            runtime,
            transport,
        })
    }
}
