//! Publish transport behaviour while the NATS server is unreachable

use agent::transport::{NatsConfig, NatsTransport, Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use workflow::{Action, Event, State};

async fn unreachable_transport() -> NatsTransport {
    // Bind then drop to get a port with nothing listening.
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    NatsTransport::new(NatsConfig {
        server: addr.to_string(),
        stream: "tinkerbell".to_string(),
        events_subject: "workflow_status".to_string(),
        actions_subject: "workflow_actions".to_string(),
        agent_id: "agent-1".to_string(),
    })
}

fn failed_event() -> Event {
    let action = Action {
        id: "wf-1".into(),
        name: "disk-wipe".into(),
        image: "alpine".into(),
        ..Default::default()
    };
    Event::new(action, State::Failure, "exit status 1".to_string())
}

#[tokio::test]
async fn test_write_returns_on_shutdown_while_disconnected() {
    let transport = unreachable_transport().await;
    let shutdown = CancellationToken::new();
    let canceller = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown.cancel();
        })
    };

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        transport.write(&shutdown, &failed_event()),
    )
    .await
    .expect("write ignored shutdown");
    canceller.await.unwrap();

    assert!(matches!(result, Err(TransportError::Cancelled)));
}

#[tokio::test]
async fn test_run_returns_on_shutdown_while_disconnected() {
    let transport = Arc::new(unreachable_transport().await);
    let shutdown = CancellationToken::new();
    let run = {
        let transport = transport.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { transport.run(shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!run.is_finished());
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run ignored shutdown")
        .unwrap();
    assert!(result.is_ok());
}
