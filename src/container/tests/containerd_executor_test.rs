//! containerd executor lifecycle tests against an in-memory daemon
#![cfg(target_os = "linux")]

use async_trait::async_trait;
use container::containerd::{DaemonApi, DaemonError, ImageConfig, RootfsMount, TaskStdio};
use container::{ContainerdExecutor, ExecContext, RuntimeError, RuntimeExecutor};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use workflow::{Action, Env, Namespaces};

#[derive(Default)]
struct FakeDaemon {
    calls: Mutex<Vec<String>>,
    specs: Mutex<Vec<serde_json::Value>>,
    stdio: Mutex<Vec<TaskStdio>>,
    image_present: bool,
    fail_pull: bool,
    fail_create_task: bool,
    fail_delete_task: bool,
    exit_status: u32,
    block_wait: bool,
    ignore_sigterm: bool,
    exited: Notify,
}

impl FakeDaemon {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn teardown_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with("delete") || c.starts_with("remove"))
            .map(|c| c.split(':').next().unwrap_or_default().to_string())
            .collect()
    }
}

#[async_trait]
impl DaemonApi for FakeDaemon {
    async fn image_exists(&self, reference: &str) -> Result<bool, DaemonError> {
        self.record(format!("exists:{}", reference));
        Ok(self.image_present)
    }

    async fn pull_image(&self, reference: &str) -> Result<(), DaemonError> {
        self.record(format!("pull:{}", reference));
        if self.fail_pull {
            return Err(DaemonError::Message("pull access denied".into()));
        }
        Ok(())
    }

    async fn image_config(&self, _reference: &str) -> Result<ImageConfig, DaemonError> {
        self.record("config".into());
        Ok(ImageConfig {
            env: vec!["PATH=/usr/bin:/bin".into(), "MODE=image".into()],
            entrypoint: vec!["/entry".into()],
            cmd: vec!["default".into()],
            chain_id: "sha256:chain".into(),
            ..Default::default()
        })
    }

    async fn prepare_snapshot(&self, key: &str, parent: &str) -> Result<Vec<RootfsMount>, DaemonError> {
        self.record(format!("prepare:{}:{}", key, parent));
        Ok(vec![RootfsMount {
            kind: "overlay".into(),
            source: "overlay".into(),
            options: vec!["lowerdir=/a".into()],
        }])
    }

    async fn create_container(
        &self,
        id: &str,
        _image: &str,
        _snapshot_key: &str,
        spec: &serde_json::Value,
    ) -> Result<(), DaemonError> {
        self.record(format!("container:{}", id));
        self.specs.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn create_task(&self, id: &str, _rootfs: &[RootfsMount], stdio: &TaskStdio) -> Result<(), DaemonError> {
        self.record(format!("task:{}", id));
        self.stdio.lock().unwrap().push(stdio.clone());
        if self.fail_create_task {
            return Err(DaemonError::Message("shim failed".into()));
        }
        Ok(())
    }

    async fn start_task(&self, _id: &str) -> Result<(), DaemonError> {
        self.record("start".into());
        Ok(())
    }

    async fn wait_task(&self, _id: &str) -> Result<u32, DaemonError> {
        if self.block_wait {
            self.exited.notified().await;
            return Ok(137);
        }
        Ok(self.exit_status)
    }

    async fn kill_task(&self, _id: &str, signal: i32) -> Result<(), DaemonError> {
        self.record(format!("kill:{}", signal));
        if signal == nix::libc::SIGKILL || !self.ignore_sigterm {
            self.exited.notify_one();
        }
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<(), DaemonError> {
        self.record(format!("delete_task:{}", id));
        if self.fail_delete_task {
            return Err(DaemonError::Message("task still running".into()));
        }
        Ok(())
    }

    async fn delete_container(&self, id: &str) -> Result<(), DaemonError> {
        self.record(format!("delete_container:{}", id));
        Ok(())
    }

    async fn remove_snapshot(&self, key: &str) -> Result<(), DaemonError> {
        self.record(format!("remove_snapshot:{}", key));
        Ok(())
    }
}

fn action() -> Action {
    Action {
        id: "wf-2".into(),
        name: "kexec".into(),
        image: "alpine".into(),
        cmd: "/bin/sh".into(),
        args: vec!["-c".into(), "true".into()],
        env: vec![Env::new("MODE", "action")],
        namespaces: Namespaces {
            pid: "host".into(),
            network: "host".into(),
        },
        ..Default::default()
    }
}

fn executor(daemon: &Arc<FakeDaemon>) -> ContainerdExecutor {
    ContainerdExecutor::new(daemon.clone())
        .without_stdio()
        .with_kill_grace(Duration::from_millis(50))
}

#[tokio::test]
async fn test_success_pulls_short_name_and_tears_down_in_order() {
    let daemon = Arc::new(FakeDaemon::default());

    executor(&daemon)
        .execute(&ExecContext::background(), &action())
        .await
        .unwrap();

    assert_eq!(daemon.count("pull:docker.io/library/alpine:latest"), 1);
    assert_eq!(daemon.count("prepare:tinkerbell_kexec_wf-2_"), 1);
    assert!(daemon.calls().iter().any(|c| c.ends_with(":sha256:chain")));
    assert_eq!(
        daemon.teardown_calls(),
        vec!["delete_task", "delete_container", "remove_snapshot"]
    );
}

#[tokio::test]
async fn test_present_image_is_not_pulled() {
    let daemon = Arc::new(FakeDaemon {
        image_present: true,
        ..Default::default()
    });

    executor(&daemon)
        .with_registry("registry.local:5000")
        .execute(&ExecContext::background(), &action())
        .await
        .unwrap();

    assert_eq!(daemon.count("exists:registry.local:5000/alpine:latest"), 1);
    assert_eq!(daemon.count("pull"), 0);
}

#[tokio::test]
async fn test_runtime_spec_reflects_action() {
    let daemon = Arc::new(FakeDaemon::default());

    executor(&daemon)
        .execute(&ExecContext::background(), &action())
        .await
        .unwrap();

    let spec = daemon.specs.lock().unwrap()[0].clone();
    assert_eq!(spec["process"]["args"], serde_json::json!(["/bin/sh", "-c", "true"]));
    let env: Vec<String> = serde_json::from_value(spec["process"]["env"].clone()).unwrap();
    assert_eq!(env, vec!["PATH=/usr/bin:/bin", "MODE=action"]);

    let namespaces: Vec<String> = spec["linux"]["namespaces"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["type"].as_str().unwrap().to_string())
        .collect();
    assert!(!namespaces.contains(&"pid".to_string()));
    assert!(!namespaces.contains(&"network".to_string()));
}

#[tokio::test]
async fn test_non_zero_exit_is_failure_and_tears_down() {
    let daemon = Arc::new(FakeDaemon {
        exit_status: 2,
        ..Default::default()
    });

    let err = executor(&daemon)
        .execute(&ExecContext::background(), &action())
        .await
        .unwrap_err();

    assert!(matches!(err, RuntimeError::NonZeroExit { code: 2, .. }));
    assert_eq!(daemon.teardown_calls().len(), 3);
}

#[tokio::test]
async fn test_pull_failure_creates_nothing() {
    let daemon = Arc::new(FakeDaemon {
        fail_pull: true,
        ..Default::default()
    });

    let err = executor(&daemon)
        .execute(&ExecContext::background(), &action())
        .await
        .unwrap_err();

    assert!(matches!(err, RuntimeError::Pull { .. }));
    assert_eq!(daemon.count("prepare"), 0);
    assert!(daemon.teardown_calls().is_empty());
}

#[tokio::test]
async fn test_task_create_failure_removes_container_and_snapshot() {
    let daemon = Arc::new(FakeDaemon {
        fail_create_task: true,
        ..Default::default()
    });

    let err = executor(&daemon)
        .execute(&ExecContext::background(), &action())
        .await
        .unwrap_err();

    assert!(matches!(err, RuntimeError::Create { .. }));
    assert_eq!(
        daemon.teardown_calls(),
        vec!["delete_container", "remove_snapshot"]
    );
}

#[tokio::test]
async fn test_teardown_continues_after_failed_step() {
    let daemon = Arc::new(FakeDaemon {
        fail_delete_task: true,
        ..Default::default()
    });

    executor(&daemon)
        .execute(&ExecContext::background(), &action())
        .await
        .unwrap();

    assert_eq!(
        daemon.teardown_calls(),
        vec!["delete_task", "delete_container", "remove_snapshot"]
    );
}

#[tokio::test]
async fn test_cancel_sends_sigterm_and_tears_down() {
    let daemon = Arc::new(FakeDaemon {
        block_wait: true,
        ..Default::default()
    });
    let token = CancellationToken::new();
    let ctx = ExecContext::new(token.clone());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let err = executor(&daemon).execute(&ctx, &action()).await.unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(daemon.calls().iter().filter(|c| c.starts_with("kill")).count(), 1);
    assert_eq!(daemon.count(&format!("kill:{}", nix::libc::SIGTERM)), 1);
    assert_eq!(daemon.teardown_calls().len(), 3);
}

#[tokio::test]
async fn test_ignored_sigterm_escalates_to_sigkill_on_deadline() {
    let daemon = Arc::new(FakeDaemon {
        block_wait: true,
        ignore_sigterm: true,
        ..Default::default()
    });
    let ctx = ExecContext::background().with_timeout(Some(Duration::from_millis(50)));

    let err = executor(&daemon).execute(&ctx, &action()).await.unwrap_err();

    assert!(err.is_deadline_exceeded());
    assert_eq!(daemon.count(&format!("kill:{}", nix::libc::SIGTERM)), 1);
    assert_eq!(daemon.count(&format!("kill:{}", nix::libc::SIGKILL)), 1);
    assert_eq!(daemon.teardown_calls().len(), 3);
}

#[tokio::test]
async fn test_stdio_fifos_are_handed_to_task() {
    let daemon = Arc::new(FakeDaemon::default());

    ContainerdExecutor::new(daemon.clone())
        .execute(&ExecContext::background(), &action())
        .await
        .unwrap();

    let stdio = daemon.stdio.lock().unwrap()[0].clone();
    assert!(stdio.stdout.to_string_lossy().ends_with("-stdout"));
    assert!(stdio.stderr.to_string_lossy().ends_with("-stderr"));
    // FIFOs are removed with the task io once the action finishes.
    assert!(!stdio.stdout.exists());
}
