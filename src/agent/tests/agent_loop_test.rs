//! Agent loop retry, timeout and reporting behaviour against scripted fakes

use agent::transport::{Transport, TransportError};
use agent::Agent;
use async_trait::async_trait;
use container::{ExecContext, Interrupted, RuntimeError, RuntimeExecutor};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use workflow::{Action, Event, State};

/// Serves queued actions, then cancels the shutdown token so the loop ends.
struct QueueTransport {
    actions: Mutex<VecDeque<Result<Action, TransportError>>>,
    events: Mutex<Vec<Event>>,
    fail_writes: Mutex<VecDeque<bool>>,
    shutdown: CancellationToken,
}

impl QueueTransport {
    fn new(actions: Vec<Action>, shutdown: &CancellationToken) -> Self {
        Self {
            actions: Mutex::new(actions.into_iter().map(Ok).collect()),
            events: Mutex::new(Vec::new()),
            fail_writes: Mutex::new(VecDeque::new()),
            shutdown: shutdown.clone(),
        }
    }

    fn with_read_error_first(self) -> Self {
        self.actions
            .lock()
            .unwrap()
            .push_front(Err(TransportError::Config("server unreachable".into())));
        self
    }

    /// Script write outcomes in call order; `true` fails that write.
    fn with_write_failures(self, script: &[bool]) -> Self {
        *self.fail_writes.lock().unwrap() = script.iter().copied().collect();
        self
    }

    fn states(&self) -> Vec<(String, State)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.action.name.clone(), e.state))
            .collect()
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for QueueTransport {
    async fn read(&self, _shutdown: &CancellationToken) -> Result<Action, TransportError> {
        let next = self.actions.lock().unwrap().pop_front();
        match next {
            Some(next) => next,
            None => {
                self.shutdown.cancel();
                Err(TransportError::Cancelled)
            }
        }
    }

    async fn write(
        &self,
        _shutdown: &CancellationToken,
        event: &Event,
    ) -> Result<(), TransportError> {
        let fail = self.fail_writes.lock().unwrap().pop_front().unwrap_or(false);
        if fail {
            return Err(TransportError::Config("report rejected".into()));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

enum Step {
    Succeed,
    Fail,
    /// Block until the context fires and report why
    Hang,
}

struct ScriptedRuntime {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicU32,
}

impl ScriptedRuntime {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeExecutor for ScriptedRuntime {
    async fn execute(&self, ctx: &ExecContext, action: &Action) -> Result<(), RuntimeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Fail);
        match step {
            Step::Succeed => Ok(()),
            Step::Fail => Err(RuntimeError::NonZeroExit {
                action: action.id.clone(),
                code: 1,
            }),
            Step::Hang => Err(RuntimeError::Interrupted {
                action: action.id.clone(),
                reason: ctx.done().await,
            }),
        }
    }
}

fn action(name: &str, retries: i32, timeout_seconds: i64) -> Action {
    Action {
        id: format!("{}-id", name),
        name: name.to_string(),
        image: "alpine".to_string(),
        cmd: "/bin/true".to_string(),
        retries,
        timeout_seconds,
        ..Default::default()
    }
}

async fn run_agent(transport: Arc<QueueTransport>, runtime: Arc<ScriptedRuntime>, shutdown: CancellationToken) {
    let agent = Agent::new(transport, runtime);
    tokio::time::timeout(Duration::from_secs(30), agent.run(shutdown))
        .await
        .expect("agent loop did not stop");
}

#[tokio::test]
async fn test_zero_retries_means_one_attempt() {
    let shutdown = CancellationToken::new();
    let transport = Arc::new(QueueTransport::new(vec![action("a1", 0, 0)], &shutdown));
    let runtime = Arc::new(ScriptedRuntime::new(vec![Step::Fail, Step::Succeed]));

    run_agent(transport.clone(), runtime.clone(), shutdown).await;

    assert_eq!(runtime.calls(), 1);
    assert_eq!(
        transport.states(),
        vec![("a1".to_string(), State::Running), ("a1".to_string(), State::Failure)]
    );
}

#[tokio::test]
async fn test_retries_stop_at_first_success() {
    let shutdown = CancellationToken::new();
    let transport = Arc::new(QueueTransport::new(vec![action("a1", 5, 0)], &shutdown));
    let runtime = Arc::new(ScriptedRuntime::new(vec![Step::Fail, Step::Fail, Step::Succeed]));

    run_agent(transport.clone(), runtime.clone(), shutdown).await;

    assert_eq!(runtime.calls(), 3);
    assert_eq!(transport.states().last().unwrap().1, State::Success);
}

#[tokio::test]
async fn test_retries_exhausted_reports_last_error() {
    let shutdown = CancellationToken::new();
    let transport = Arc::new(QueueTransport::new(vec![action("a1", 3, 0)], &shutdown));
    let runtime = Arc::new(ScriptedRuntime::new(vec![Step::Fail, Step::Fail, Step::Fail]));

    run_agent(transport.clone(), runtime.clone(), shutdown).await;

    assert_eq!(runtime.calls(), 3);
    let events = transport.events();
    let last = events.last().unwrap();
    assert_eq!(last.state, State::Failure);
    assert!(last.message.contains("non-zero status 1"), "message: {}", last.message);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_reports_timeout_without_retrying() {
    let shutdown = CancellationToken::new();
    let transport = Arc::new(QueueTransport::new(vec![action("slow", 4, 2)], &shutdown));
    let runtime = Arc::new(ScriptedRuntime::new(vec![Step::Hang, Step::Succeed]));

    run_agent(transport.clone(), runtime.clone(), shutdown).await;

    assert_eq!(runtime.calls(), 1);
    assert_eq!(
        transport.states(),
        vec![
            ("slow".to_string(), State::Running),
            ("slow".to_string(), State::Timeout)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_deadline_spans_all_attempts() {
    let shutdown = CancellationToken::new();
    let transport = Arc::new(QueueTransport::new(vec![action("a1", 3, 5)], &shutdown));
    // First attempt fails fast, second hangs into the deadline shared with the first.
    let runtime = Arc::new(ScriptedRuntime::new(vec![Step::Fail, Step::Hang, Step::Succeed]));

    let start = tokio::time::Instant::now();
    run_agent(transport.clone(), runtime.clone(), shutdown).await;

    assert_eq!(runtime.calls(), 2);
    assert_eq!(transport.states().last().unwrap().1, State::Timeout);
    assert!(start.elapsed() < Duration::from_secs(6));
}

#[tokio::test]
async fn test_read_error_does_not_stop_loop() {
    let shutdown = CancellationToken::new();
    let transport = Arc::new(
        QueueTransport::new(vec![action("a1", 1, 0)], &shutdown).with_read_error_first(),
    );
    let runtime = Arc::new(ScriptedRuntime::new(vec![Step::Succeed]));

    run_agent(transport.clone(), runtime.clone(), shutdown).await;

    assert_eq!(runtime.calls(), 1);
    assert_eq!(transport.states().last().unwrap().1, State::Success);
}

#[tokio::test]
async fn test_failed_running_report_skips_execution() {
    let shutdown = CancellationToken::new();
    let transport = Arc::new(
        QueueTransport::new(vec![action("a1", 1, 0), action("a2", 1, 0)], &shutdown)
            .with_write_failures(&[true]),
    );
    let runtime = Arc::new(ScriptedRuntime::new(vec![Step::Succeed]));

    run_agent(transport.clone(), runtime.clone(), shutdown).await;

    assert_eq!(runtime.calls(), 1);
    assert_eq!(
        transport.states(),
        vec![("a2".to_string(), State::Running), ("a2".to_string(), State::Success)]
    );
}

#[tokio::test]
async fn test_failed_terminal_report_does_not_stall() {
    let shutdown = CancellationToken::new();
    let transport = Arc::new(
        QueueTransport::new(vec![action("a1", 1, 0), action("a2", 1, 0)], &shutdown)
            .with_write_failures(&[false, true]),
    );
    let runtime = Arc::new(ScriptedRuntime::new(vec![Step::Succeed, Step::Succeed]));

    run_agent(transport.clone(), runtime.clone(), shutdown).await;

    assert_eq!(runtime.calls(), 2);
    assert_eq!(
        transport.states(),
        vec![
            ("a1".to_string(), State::Running),
            ("a2".to_string(), State::Running),
            ("a2".to_string(), State::Success)
        ]
    );
}

#[tokio::test]
async fn test_cancellation_during_execute_reports_failure_without_retry() {
    let shutdown = CancellationToken::new();
    // Only the hanging action; shutdown is triggered externally while it runs.
    let transport = Arc::new(QueueTransport::new(vec![action("a1", 3, 0)], &shutdown));
    let runtime = Arc::new(ScriptedRuntime::new(vec![Step::Hang, Step::Succeed]));

    let canceller = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });
    run_agent(transport.clone(), runtime.clone(), shutdown).await;

    assert_eq!(runtime.calls(), 1);
    let events = transport.events();
    let last = events.last().unwrap();
    assert_eq!(last.state, State::Failure);
    assert!(last.message.contains(&Interrupted::Cancelled.to_string()));
}

#[tokio::test]
async fn test_loop_exits_immediately_when_already_cancelled() {
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let transport = Arc::new(QueueTransport::new(vec![action("a1", 1, 0)], &shutdown));
    let runtime = Arc::new(ScriptedRuntime::new(vec![Step::Succeed]));

    run_agent(transport.clone(), runtime.clone(), shutdown).await;

    assert_eq!(runtime.calls(), 0);
    assert!(transport.states().is_empty());
}
