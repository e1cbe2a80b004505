//! tink-agent binary: wires configuration, logging, the runtime, and a transport into the
//! agent loop, and cancels everything on SIGINT, SIGTERM or SIGHUP.

use agent::config::LogFormat;
use agent::transport::{FileTransport, GrpcTransport, NatsTransport, Transport, TransportError};
use agent::{Agent, BootstrapError, Cli, Config, RuntimeConfig, TransportConfig};
use anyhow::Context;
use clap::Parser;
use container::{BollardEngine, DockerExecutor, RuntimeExecutor};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

fn init_logging(config: &Config) {
    // RUST_LOG wins over --log-level
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn build_runtime(config: &Config) -> Result<Arc<dyn RuntimeExecutor>, BootstrapError> {
    match &config.runtime {
        RuntimeConfig::Docker { socket } => {
            let engine = BollardEngine::connect(&socket.to_string_lossy())
                .map_err(|e| BootstrapError::DockerClient(e.to_string()))?;
            info!("[Bootstrap] Using Docker runtime at {}", socket.display());
            Ok(Arc::new(
                DockerExecutor::new(Arc::new(engine))
                    .with_registry_auth(config.registry_auth.clone())
                    .with_proxy(config.proxy.clone()),
            ))
        }
        RuntimeConfig::Containerd { socket, namespace } => {
            build_containerd(config, socket, namespace).await
        }
    }
}

#[cfg(target_os = "linux")]
async fn build_containerd(
    config: &Config,
    socket: &std::path::Path,
    namespace: &str,
) -> Result<Arc<dyn RuntimeExecutor>, BootstrapError> {
    use container::{ContainerdDaemon, ContainerdExecutor};

    let daemon = ContainerdDaemon::connect(&socket.to_string_lossy(), namespace)
        .await
        .map_err(|e| BootstrapError::ContainerdClient(e.to_string()))?;
    info!(
        "[Bootstrap] Using containerd runtime at {} (namespace {})",
        socket.display(),
        namespace
    );
    Ok(Arc::new(
        ContainerdExecutor::new(Arc::new(daemon))
            .with_registry(&config.registry)
            .with_proxy(config.proxy.clone()),
    ))
}

#[cfg(not(target_os = "linux"))]
async fn build_containerd(
    _config: &Config,
    _socket: &std::path::Path,
    _namespace: &str,
) -> Result<Arc<dyn RuntimeExecutor>, BootstrapError> {
    Err(BootstrapError::Unsupported(
        "the containerd runtime is Linux-only".to_string(),
    ))
}

type Ingestion = JoinHandle<Result<(), TransportError>>;

/// Spawn a transport's ingestion task. Its failure stops the agent.
fn spawn_ingestion<F>(ingest: F, shutdown: &CancellationToken) -> Ingestion
where
    F: Future<Output = Result<(), TransportError>> + Send + 'static,
{
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        let result = ingest.await;
        if let Err(e) = &result {
            tracing::error!("[Bootstrap] Transport stopped: {}", e);
            shutdown.cancel();
        }
        result
    })
}

fn build_transport(
    config: &Config,
    shutdown: &CancellationToken,
) -> Result<(Arc<dyn Transport>, Ingestion), BootstrapError> {
    let token = shutdown.clone();
    match &config.transport {
        TransportConfig::Grpc(grpc) => {
            let transport = Arc::new(GrpcTransport::new(grpc.clone())?);
            let feeder = transport.clone();
            let ingestion = spawn_ingestion(async move { feeder.run(token).await }, shutdown);
            Ok((transport, ingestion))
        }
        TransportConfig::File {
            path,
            abandon_on_failure,
        } => {
            let transport = Arc::new(
                FileTransport::new(path.clone()).with_abandon_on_failure(*abandon_on_failure),
            );
            let feeder = transport.clone();
            let ingestion = spawn_ingestion(async move { feeder.run(token).await }, shutdown);
            Ok((transport, ingestion))
        }
        TransportConfig::Nats(nats) => {
            let transport = Arc::new(NatsTransport::new(nats.clone()));
            let feeder = transport.clone();
            let ingestion = spawn_ingestion(async move { feeder.run(token).await }, shutdown);
            Ok((transport, ingestion))
        }
    }
}

async fn wait_for_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.map(|_| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
            _ = hangup.recv() => Ok("SIGHUP"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|_| "Ctrl+C")
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    let runtime = build_runtime(&config).await?;
    let (transport, ingestion) = build_transport(&config, &shutdown)?;
    info!(
        "[Bootstrap] Agent {} starting with {} transport and {} runtime",
        config.id,
        config.transport.kind(),
        config.runtime.kind()
    );

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => info!("[Bootstrap] Received {}, shutting down", name),
            Err(e) => tracing::error!("[Bootstrap] Failed to listen for signals: {}", e),
        }
        signal_token.cancel();
    });

    let agent = Agent::new(transport, runtime);
    agent.run(shutdown.clone()).await;

    shutdown.cancel();
    ingestion
        .await
        .context("transport task panicked")?
        .map_err(BootstrapError::from)
        .context("transport stopped")?;

    info!("[Bootstrap] Agent stopped");
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tink-agent: {}", e);
            std::process::exit(e.exit_code());
        }
    };
    init_logging(&config);

    // rustls 0.23 needs a process-wide crypto provider before any TLS client is built
    let _ = rustls::crypto::ring::default_provider().install_default();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("[Bootstrap] Failed to start tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(config)) {
        let code = e
            .downcast_ref::<BootstrapError>()
            .map(BootstrapError::exit_code)
            .unwrap_or(1);
        tracing::error!("[Bootstrap] tink-agent failed: {:#}", e);
        std::process::exit(code);
    }
}
