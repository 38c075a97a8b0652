use super::{decode_exec_output, spawn_line_pump, spawn_stderr_drain, TaskLaunch, Transport};
use crate::errors::{AppError, AppResult};
use crate::harness::classifier::{classify_line, LineKind};
use crate::harness::remediation::with_remediation;
use crate::models::{ExecOutput, TransportConfig, TransportKind};
use crate::supervisor::{LaunchSpec, ProcessHandle, ProcessSupervisor};
use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::time::Duration;

const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs each task as a direct child process and reads its stdout.
pub struct StdioTransport {
    launch: LaunchSpec,
    supervisor: ProcessSupervisor,
    active: Arc<StdMutex<Option<ProcessHandle>>>,
    exec_timeout: Duration,
}

impl StdioTransport {
    pub fn new(config: &TransportConfig, supervisor: ProcessSupervisor) -> AppResult<Self> {
        let launch = LaunchSpec::from(config);
        launch.validate()?;
        Ok(Self {
            launch,
            supervisor,
            active: Arc::new(StdMutex::new(None)),
            exec_timeout: EXEC_TIMEOUT,
        })
    }

    pub fn with_exec_timeout(mut self, exec_timeout: Duration) -> Self {
        self.exec_timeout = exec_timeout;
        self
    }

    fn active_handle(&self) -> Option<ProcessHandle> {
        match self.active.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_active(&self, handle: Option<ProcessHandle>) {
        match self.active.lock() {
            Ok(mut guard) => *guard = handle,
            Err(poisoned) => *poisoned.into_inner() = handle,
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn start(&self, launch: TaskLaunch) -> AppResult<()> {
        let TaskLaunch {
            task_id,
            args,
            classifier,
            exit,
        } = launch;

        let spawned = self.supervisor.start(&self.launch, &args, exit.clone()).await?;
        let handle = spawned.handle;
        let pid = handle.pid();

        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = spawned.stdout {
            drains.push(spawn_line_pump(stdout, classifier));
        }
        if let Some(stderr) = spawned.stderr {
            drains.push(spawn_stderr_drain(stderr, pid));
        }

        self.set_active(Some(handle.clone()));
        let active = self.active.clone();
        exit.on_exit(move |_| {
            let mut slot = match active.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if slot.as_ref().map(ProcessHandle::pid) == Some(pid) {
                *slot = None;
            }
        });

        self.supervisor.wait_async(&handle, drains);
        tracing::info!(task_id = %task_id, pid, "task started over stdio");
        Ok(())
    }

    async fn stop(&self) -> AppResult<()> {
        let Some(handle) = self.active_handle() else {
            return Ok(());
        };
        self.supervisor.kill(&handle).await;
        Ok(())
    }

    async fn exec(&self, args: &[String]) -> AppResult<ExecOutput> {
        let output = self
            .supervisor
            .run_to_completion(&self.launch, args, self.exec_timeout)
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let decoded = decode_exec_output(&stdout);
        if output.status.success() {
            return Ok(decoded);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let detail = exec_failure_detail(&stderr, &stdout)
            .unwrap_or_else(|| format!("exit status {:?}", output.status.code()));
        tracing::warn!(args = ?args, code = ?output.status.code(), "worker command failed");
        Err(AppError::ProcessStartFailed(with_remediation(
            format!("command '{}' failed: {}", args.join(" "), detail),
            &[&stderr],
        )))
    }

    async fn is_active(&self) -> bool {
        match self.active_handle() {
            Some(handle) => self.supervisor.is_running(&handle).await,
            None => false,
        }
    }

    async fn shutdown(&self) {
        if let Err(error) = self.stop().await {
            tracing::warn!(error = %error, "failed to stop stdio task during shutdown");
        }
    }
}

/// Prefers stderr; otherwise the last stdout line when it is a log message.
fn exec_failure_detail(stderr: &str, stdout: &str) -> Option<String> {
    if !stderr.is_empty() {
        return Some(stderr.to_string());
    }
    let last = stdout.lines().rev().find(|line| !line.trim().is_empty())?;
    match classify_line(last)? {
        LineKind::Log(message) if !message.message.is_empty() => Some(message.message),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{exec_failure_detail, StdioTransport};
    use crate::models::TransportConfig;
    use crate::supervisor::ProcessSupervisor;

    #[test]
    fn failure_detail_prefers_stderr_then_last_log_message() {
        assert_eq!(exec_failure_detail("boom", "{\"level\":\"ERROR\",\"message\":\"x\"}"), Some("boom".to_string()));
        assert_eq!(
            exec_failure_detail("", "noise\n{\"level\":\"ERROR\",\"message\":\"Device not found\"}\n\n"),
            Some("Device not found".to_string())
        );
        assert_eq!(exec_failure_detail("", "plain text"), None);
    }

    #[test]
    fn rejects_unconfigured_binary() {
        assert!(StdioTransport::new(&TransportConfig::stdio(""), ProcessSupervisor::new()).is_err());
    }

    #[cfg(unix)]
    mod unix {
        use super::super::StdioTransport;
        use crate::errors::AppError;
        use crate::models::TransportConfig;
        use crate::supervisor::ProcessSupervisor;
        use crate::transport::Transport;
        use std::os::unix::fs::PermissionsExt;

        fn transport(dir: &std::path::Path, body: &str) -> StdioTransport {
            let path = dir.join("worker.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
            let mut config = TransportConfig::stdio(path);
            config.working_dir = Some(dir.to_path_buf());
            StdioTransport::new(&config, ProcessSupervisor::new()).expect("transport")
        }

        #[tokio::test]
        async fn exec_returns_decoded_messages() {
            let dir = tempfile::tempdir().expect("tempdir");
            let transport = transport(
                dir.path(),
                "echo '{\"level\":\"INFO\",\"message\":\"AFKJourney\"}'",
            );
            let output = transport.exec(&["GetRunningGame".to_string()]).await.expect("exec");
            assert_eq!(output.messages.len(), 1);
            assert_eq!(output.messages[0].message, "AFKJourney");
            assert!(!transport.is_active().await);
        }

        #[tokio::test]
        async fn exec_failure_attaches_antivirus_hint() {
            let dir = tempfile::tempdir().expect("tempdir");
            let transport = transport(
                dir.path(),
                "echo 'Operation did not complete successfully because the file contains a virus' >&2\nexit 1",
            );
            match transport.exec(&["GetRunningGame".to_string()]).await {
                Err(AppError::ProcessStartFailed(message)) => {
                    assert!(message.contains("contains a virus"));
                    assert!(message.contains("antivirus"));
                }
                other => panic!("expected exec failure, got {:?}", other.map(|o| o.raw)),
            }
        }

        #[tokio::test]
        async fn exec_gives_up_after_its_timeout() {
            let dir = tempfile::tempdir().expect("tempdir");
            let transport = transport(dir.path(), "sleep 5")
                .with_exec_timeout(std::time::Duration::from_millis(200));
            let started = std::time::Instant::now();
            match transport.exec(&["GetRunningGame".to_string()]).await {
                Err(AppError::ProcessStartFailed(message)) => assert!(message.contains("did not finish")),
                other => panic!("expected timeout, got {:?}", other.map(|o| o.raw)),
            }
            assert!(started.elapsed() < std::time::Duration::from_secs(4));
        }
    }
}
