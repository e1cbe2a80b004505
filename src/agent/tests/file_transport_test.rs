//! Static-file transport driven end to end through the agent loop

use agent::transport::{FileTransport, Transport, TransportError};
use agent::Agent;
use async_trait::async_trait;
use container::{ExecContext, RuntimeError, RuntimeExecutor};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use workflow::{Action, Event, State};

/// Passes through to the file transport and stops the loop after `expected` events.
struct Recording {
    inner: Arc<FileTransport>,
    events: Mutex<Vec<(String, State)>>,
    expected: usize,
    shutdown: CancellationToken,
}

#[async_trait]
impl Transport for Recording {
    async fn read(&self, shutdown: &CancellationToken) -> Result<Action, TransportError> {
        self.inner.read(shutdown).await
    }

    async fn write(
        &self,
        shutdown: &CancellationToken,
        event: &Event,
    ) -> Result<(), TransportError> {
        self.inner.write(shutdown, event).await?;
        let mut events = self.events.lock().unwrap();
        events.push((event.action.name.clone(), event.state));
        if events.len() >= self.expected {
            self.shutdown.cancel();
        }
        Ok(())
    }
}

/// Treats `/bin/true` as success and anything else as exit status 1.
#[derive(Default)]
struct CommandRuntime {
    attempts: Mutex<Vec<String>>,
}

#[async_trait]
impl RuntimeExecutor for CommandRuntime {
    async fn execute(&self, _ctx: &ExecContext, action: &Action) -> Result<(), RuntimeError> {
        self.attempts.lock().unwrap().push(action.name.clone());
        if action.cmd == "/bin/true" {
            Ok(())
        } else {
            Err(RuntimeError::NonZeroExit {
                action: action.id.clone(),
                code: 1,
            })
        }
    }
}

fn workflow_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

async fn run_file(
    contents: &str,
    abandon_on_failure: bool,
    expected: usize,
) -> (Vec<(String, State)>, Vec<String>) {
    let file = workflow_file(contents);
    let shutdown = CancellationToken::new();
    let transport = Arc::new(
        FileTransport::new(file.path()).with_abandon_on_failure(abandon_on_failure),
    );
    let recording = Arc::new(Recording {
        inner: transport.clone(),
        events: Mutex::new(Vec::new()),
        expected,
        shutdown: shutdown.clone(),
    });
    let runtime = Arc::new(CommandRuntime::default());

    let feeder = {
        let transport = transport.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { transport.run(shutdown).await })
    };

    let agent = Agent::new(recording.clone(), runtime.clone());
    tokio::time::timeout(Duration::from_secs(30), agent.run(shutdown.clone()))
        .await
        .expect("agent loop did not stop");
    shutdown.cancel();
    feeder.await.unwrap().unwrap();

    let events = recording.events.lock().unwrap().clone();
    let attempts = runtime.attempts.lock().unwrap().clone();
    (events, attempts)
}

const TWO_ACTIONS: &str = r#"
- id: wf-1
  name: a1
  image: alpine
  cmd: /bin/true
  retries: 1
- id: wf-1
  name: a2
  image: alpine
  cmd: /bin/false
  retries: 2
"#;

#[tokio::test]
async fn test_file_workflow_reports_each_phase() {
    let (events, attempts) = run_file(TWO_ACTIONS, false, 4).await;

    assert_eq!(
        events,
        vec![
            ("a1".to_string(), State::Running),
            ("a1".to_string(), State::Success),
            ("a2".to_string(), State::Running),
            ("a2".to_string(), State::Failure),
        ]
    );
    assert_eq!(attempts, vec!["a1", "a2", "a2"]);
}

#[tokio::test]
async fn test_abandon_on_failure_skips_rest_of_file() {
    let contents = r#"
- id: wf-2
  name: bad
  image: alpine
  cmd: /bin/false
- id: wf-2
  name: skipped
  image: alpine
  cmd: /bin/true
"#;
    // Only two events are expected; give the loop a moment to prove "skipped" never arrives.
    let file = workflow_file(contents);
    let shutdown = CancellationToken::new();
    let transport = Arc::new(FileTransport::new(file.path()).with_abandon_on_failure(true));
    let recording = Arc::new(Recording {
        inner: transport.clone(),
        events: Mutex::new(Vec::new()),
        expected: usize::MAX,
        shutdown: shutdown.clone(),
    });
    let runtime = Arc::new(CommandRuntime::default());

    let feeder = {
        let transport = transport.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { transport.run(shutdown).await })
    };
    let agent_task = {
        let shutdown = shutdown.clone();
        let recording = recording.clone();
        let runtime = runtime.clone();
        tokio::spawn(async move { Agent::new(recording, runtime).run(shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();
    agent_task.await.unwrap();
    feeder.await.unwrap().unwrap();

    assert_eq!(
        recording.events.lock().unwrap().clone(),
        vec![
            ("bad".to_string(), State::Running),
            ("bad".to_string(), State::Failure),
        ]
    );
    assert_eq!(runtime.attempts.lock().unwrap().clone(), vec!["bad"]);
}

#[tokio::test]
async fn test_missing_workflow_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FileTransport::new(dir.path().join("absent.yaml"));
    let result = transport.run(CancellationToken::new()).await;
    assert!(matches!(result, Err(TransportError::Codec(_))));
}
