use crate::errors::{AppError, AppResult};
use crate::harness::exit_hook::ExitHook;
use crate::harness::remediation::with_remediation;
use crate::models::{TaskExit, TransportConfig};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Duration, Instant};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const KILL_REAP_TIMEOUT: Duration = Duration::from_millis(1500);
const DEV_LAUNCHER: &str = "uv";

/// How to turn worker arguments into an OS command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub binary_path: PathBuf,
    pub is_dev_mode: bool,
    pub dev_entry_point: String,
    pub working_dir: Option<PathBuf>,
}

impl From<&TransportConfig> for LaunchSpec {
    fn from(config: &TransportConfig) -> Self {
        Self {
            binary_path: config.binary_path.clone(),
            is_dev_mode: config.is_dev_mode,
            dev_entry_point: config.dev_entry_point.clone(),
            working_dir: config.working_dir.clone(),
        }
    }
}

impl LaunchSpec {
    /// Checks what can be checked without spawning anything.
    pub fn validate(&self) -> AppResult<()> {
        if self.binary_path.as_os_str().is_empty() {
            return Err(AppError::ProcessStartFailed(
                "worker binary path is not configured".to_string(),
            ));
        }
        if self.is_dev_mode && !self.binary_path.is_dir() {
            return Err(AppError::ProcessStartFailed(format!(
                "dev worker directory does not exist: {}",
                self.binary_path.display()
            )));
        }
        Ok(())
    }

    /// Direct binary in production; `uv run <entry>` from the source
    /// directory in development mode.
    pub fn command(&self, args: &[String]) -> AppResult<Command> {
        self.validate()?;
        if self.is_dev_mode {
            let launcher = which::which(DEV_LAUNCHER).map_err(|error| {
                AppError::ProcessStartFailed(format!("{} not found in PATH: {}", DEV_LAUNCHER, error))
            })?;
            let mut command = Command::new(launcher);
            command
                .arg("run")
                .arg(&self.dev_entry_point)
                .args(args)
                .current_dir(&self.binary_path);
            return Ok(command);
        }

        let mut command = Command::new(&self.binary_path);
        command.args(args);
        let working_dir = match &self.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        command.current_dir(working_dir);
        Ok(command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(Option<i32>),
}

/// A live worker process. Cloning shares the same OS child.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: u32,
    child: Arc<Mutex<Child>>,
    exit: Arc<ExitHook>,
    // False until the output pumps have finished (or were given up on).
    drained: Arc<watch::Sender<bool>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait_drained(&self, limit: Duration) -> bool {
        let mut drained = self.drained.subscribe();
        let done = matches!(timeout(limit, drained.wait_for(|done| *done)).await, Ok(Ok(_)));
        done
    }

    pub async fn poll(&self) -> ProcessState {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(None) => ProcessState::Running,
            Ok(Some(status)) => ProcessState::Exited(status.code()),
            Err(error) => {
                tracing::warn!(pid = self.pid, error = %error, "failed to poll process status");
                ProcessState::Exited(None)
            }
        }
    }
}

pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

/// Owns the single live worker (or worker server) process.
#[derive(Clone, Default)]
pub struct ProcessSupervisor {
    current: Arc<Mutex<Option<ProcessHandle>>>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self) -> Option<ProcessHandle> {
        self.current.lock().await.clone()
    }

    pub async fn start(
        &self,
        spec: &LaunchSpec,
        args: &[String],
        exit: Arc<ExitHook>,
    ) -> AppResult<SpawnedProcess> {
        self.reap_stale().await?;

        let mut command = spec.command(args)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut current = self.current.lock().await;
        if let Some(existing) = current.as_ref() {
            return Err(AppError::AlreadyRunning(format!(
                "a process is already running (pid {})",
                existing.pid
            )));
        }

        let mut child = command.spawn().map_err(|error| {
            AppError::ProcessStartFailed(with_remediation(
                format!("failed to start {}: {}", spec.binary_path.display(), error),
                &[],
            ))
        })?;
        let Some(pid) = child.id() else {
            return Err(AppError::ProcessStartFailed(
                "process exited before it could be tracked".to_string(),
            ));
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tracing::debug!(pid, args = ?args, "started worker process");

        let handle = ProcessHandle {
            pid,
            child: Arc::new(Mutex::new(child)),
            exit,
            drained: Arc::new(watch::Sender::new(false)),
        };
        *current = Some(handle.clone());

        Ok(SpawnedProcess {
            handle,
            stdout,
            stderr,
        })
    }

    /// True while the process lives. Observing it dead runs the same
    /// cleanup as the exit waiter, in case the waiter has not got there:
    /// output pumps get to finish before the exit hook fires.
    pub async fn is_running(&self, handle: &ProcessHandle) -> bool {
        match handle.poll().await {
            ProcessState::Running => true,
            ProcessState::Exited(code) => {
                if !handle.wait_drained(OUTPUT_DRAIN_TIMEOUT + EXIT_POLL_INTERVAL).await {
                    tracing::debug!(pid = handle.pid, "output not drained after exit; ending run anyway");
                }
                self.release(handle.pid).await;
                handle.exit.fire(TaskExit::Exited { code });
                false
            }
        }
    }

    /// Watches the process in the background. Output pumps in `drain` get
    /// a bounded chance to finish before the exit hook fires.
    pub fn wait_async(&self, handle: &ProcessHandle, drain: Vec<JoinHandle<()>>) {
        let supervisor = self.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            let code = loop {
                match handle.poll().await {
                    ProcessState::Running => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
                    ProcessState::Exited(code) => break code,
                }
            };
            if code == Some(0) {
                tracing::debug!(pid = handle.pid, "worker process exited");
            } else {
                tracing::warn!(pid = handle.pid, code = ?code, "worker process ended with error");
            }

            let deadline = Instant::now() + OUTPUT_DRAIN_TIMEOUT;
            for task in drain {
                if timeout_at(deadline, task).await.is_err() {
                    tracing::debug!(pid = handle.pid, "output pump still open after exit; not waiting further");
                }
            }
            handle.drained.send_replace(true);

            supervisor.release(handle.pid).await;
            handle.exit.fire(TaskExit::Exited { code });
        });
    }

    /// Kills the process and all of its descendants, deepest first.
    pub async fn kill(&self, handle: &ProcessHandle) {
        let root = handle.pid;
        let order = tokio::task::spawn_blocking(move || {
            let children = snapshot_children();
            kill_order(&children, root)
        })
        .await
        .unwrap_or_else(|error| {
            tracing::warn!(pid = root, error = %error, "process table scan failed");
            vec![root]
        });

        for pid in order.iter().copied().filter(|pid| *pid != root) {
            kill_pid(pid);
        }

        let mut child = handle.child.lock().await;
        match child.start_kill() {
            Ok(()) => tracing::debug!(pid = root, "killed worker process"),
            Err(error) if error.kind() == std::io::ErrorKind::InvalidInput => {
                tracing::debug!(pid = root, "process already exited");
            }
            Err(error) => tracing::error!(pid = root, error = %error, "failed to kill process"),
        }
        // Reap so the next poll observes the exit.
        if timeout(KILL_REAP_TIMEOUT, child.wait()).await.is_err() {
            tracing::warn!(pid = root, "process still running after kill");
        }
    }

    /// Runs a short-lived, untracked invocation to completion.
    pub async fn run_to_completion(
        &self,
        spec: &LaunchSpec,
        args: &[String],
        limit: Duration,
    ) -> AppResult<std::process::Output> {
        let mut command = spec.command(args)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|error| {
            AppError::ProcessStartFailed(with_remediation(
                format!("failed to execute {}: {}", spec.binary_path.display(), error),
                &[],
            ))
        })?;
        match timeout(limit, child.wait_with_output()).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(AppError::ProcessStartFailed(format!(
                "command did not finish within {}s",
                limit.as_secs()
            ))),
        }
    }

    async fn reap_stale(&self) -> AppResult<()> {
        let existing = self.current.lock().await.clone();
        let Some(existing) = existing else {
            return Ok(());
        };
        if self.is_running(&existing).await {
            return Err(AppError::AlreadyRunning(format!(
                "a process is already running (pid {})",
                existing.pid
            )));
        }
        Ok(())
    }

    async fn release(&self, pid: u32) {
        let mut current = self.current.lock().await;
        if current.as_ref().map(|handle| handle.pid) == Some(pid) {
            *current = None;
        }
    }
}

fn snapshot_children() -> HashMap<u32, Vec<u32>> {
    use sysinfo::{ProcessesToUpdate, System};

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent.as_u32()).or_default().push(pid.as_u32());
        }
    }
    for kids in children.values_mut() {
        kids.sort_unstable();
    }
    children
}

/// Depth-first post-order over the process tree: every child comes before
/// its parent and `root` comes last.
pub fn kill_order(children: &HashMap<u32, Vec<u32>>, root: u32) -> Vec<u32> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![(root, false)];
    while let Some((pid, expanded)) = stack.pop() {
        if expanded {
            order.push(pid);
            continue;
        }
        if !seen.insert(pid) {
            continue;
        }
        stack.push((pid, true));
        if let Some(kids) = children.get(&pid) {
            for kid in kids.iter().rev() {
                if !seen.contains(kid) {
                    stack.push((*kid, false));
                }
            }
        }
    }
    order
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => tracing::debug!(pid, "killed descendant process"),
        Err(Errno::ESRCH) => tracing::debug!(pid, "process already exited"),
        Err(error) => tracing::error!(pid, error = %error, "failed to kill process"),
    }
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    match system.process(target) {
        Some(process) if process.kill() => tracing::debug!(pid, "killed descendant process"),
        Some(_) => tracing::error!(pid, "failed to kill process"),
        None => tracing::debug!(pid, "process already exited"),
    }
}

#[cfg(test)]
mod tests {
    use super::{kill_order, LaunchSpec, ProcessSupervisor};
    use crate::errors::AppError;
    use crate::harness::exit_hook::ExitHook;
    use std::collections::HashMap;
    use std::path::PathBuf;

    #[test]
    fn kill_order_visits_children_before_parents() {
        let mut children = HashMap::new();
        children.insert(1, vec![2, 3]);
        children.insert(2, vec![4]);
        children.insert(4, vec![5]);
        children.insert(9, vec![10]);
        assert_eq!(kill_order(&children, 1), vec![5, 4, 2, 3, 1]);
        assert_eq!(kill_order(&HashMap::new(), 7), vec![7]);
    }

    #[test]
    fn kill_order_survives_cycles() {
        let mut children = HashMap::new();
        children.insert(1, vec![2]);
        children.insert(2, vec![1]);
        assert_eq!(kill_order(&children, 1), vec![2, 1]);
    }

    #[test]
    fn launch_spec_requires_binary_path() {
        let spec = LaunchSpec {
            binary_path: PathBuf::new(),
            is_dev_mode: false,
            dev_entry_point: "worker".to_string(),
            working_dir: None,
        };
        assert!(matches!(spec.validate(), Err(AppError::ProcessStartFailed(_))));
    }

    #[test]
    fn dev_mode_requires_existing_source_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = LaunchSpec {
            binary_path: dir.path().join("missing"),
            is_dev_mode: true,
            dev_entry_point: "worker".to_string(),
            working_dir: None,
        };
        match spec.validate() {
            Err(AppError::ProcessStartFailed(message)) => assert!(message.contains("does not exist")),
            other => panic!("expected start failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_start_failure_with_hint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = LaunchSpec {
            binary_path: dir.path().join("no-such-worker"),
            is_dev_mode: false,
            dev_entry_point: "worker".to_string(),
            working_dir: Some(dir.path().to_path_buf()),
        };
        let supervisor = ProcessSupervisor::new();
        match supervisor.start(&spec, &[], ExitHook::new()).await {
            Err(AppError::ProcessStartFailed(message)) => assert!(message.contains("could not be found")),
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("spawn should fail"),
        }
        assert!(supervisor.current().await.is_none());
    }

    #[cfg(unix)]
    mod unix {
        use super::super::{LaunchSpec, ProcessSupervisor};
        use crate::errors::AppError;
        use crate::harness::exit_hook::ExitHook;
        use crate::models::TaskExit;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::{Arc, Mutex};
        use tokio::time::{sleep, Duration};

        fn script(dir: &std::path::Path, body: &str) -> LaunchSpec {
            let path = dir.join("worker.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
            LaunchSpec {
                binary_path: path,
                is_dev_mode: false,
                dev_entry_point: "worker".to_string(),
                working_dir: Some(dir.to_path_buf()),
            }
        }

        fn recording_hook() -> (Arc<ExitHook>, Arc<Mutex<Vec<TaskExit>>>) {
            let hook = ExitHook::new();
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = seen.clone();
            hook.on_exit(move |exit| sink.lock().expect("seen lock").push(exit.clone()));
            (hook, seen)
        }

        #[tokio::test]
        async fn second_start_is_rejected_while_first_lives() {
            let dir = tempfile::tempdir().expect("tempdir");
            let spec = script(dir.path(), "sleep 30");
            let supervisor = ProcessSupervisor::new();
            let first = supervisor.start(&spec, &[], ExitHook::new()).await.expect("first start");

            let second = supervisor.start(&spec, &[], ExitHook::new()).await;
            assert!(matches!(second, Err(AppError::AlreadyRunning(_))));

            supervisor.kill(&first.handle).await;
            sleep(Duration::from_millis(200)).await;
            assert!(!supervisor.is_running(&first.handle).await);
            assert!(supervisor.current().await.is_none());
        }

        #[tokio::test]
        async fn liveness_poll_fires_exit_hook_once() {
            let dir = tempfile::tempdir().expect("tempdir");
            let spec = script(dir.path(), "exit 3");
            let supervisor = ProcessSupervisor::new();
            let (hook, seen) = recording_hook();
            let spawned = supervisor.start(&spec, &[], hook).await.expect("start");

            sleep(Duration::from_millis(300)).await;
            assert!(!supervisor.is_running(&spawned.handle).await);
            assert!(!supervisor.is_running(&spawned.handle).await);
            assert_eq!(*seen.lock().expect("seen lock"), vec![TaskExit::Exited { code: Some(3) }]);
        }

        #[tokio::test]
        async fn liveness_poll_lets_output_drain_before_firing() {
            use std::sync::atomic::{AtomicUsize, Ordering};
            use tokio::io::AsyncBufReadExt;

            let dir = tempfile::tempdir().expect("tempdir");
            let spec = script(
                dir.path(),
                "i=0\nwhile [ $i -lt 1200 ]; do echo \"line $i\"; i=$((i+1)); done\nexit 1",
            );
            let supervisor = ProcessSupervisor::new();
            let read = Arc::new(AtomicUsize::new(0));
            let seen_at_exit = Arc::new(Mutex::new(None));
            let hook = ExitHook::new();
            let (counter, record) = (read.clone(), seen_at_exit.clone());
            hook.on_exit(move |_| {
                *record.lock().expect("record lock") = Some(counter.load(Ordering::SeqCst));
            });

            let spawned = supervisor.start(&spec, &[], hook).await.expect("start");
            let stdout = spawned.stdout.expect("stdout");
            let counter = read.clone();
            let pump = tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stdout).lines();
                while let Ok(Some(_)) = lines.next_line().await {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                }
            });
            supervisor.wait_async(&spawned.handle, vec![pump]);

            let polled = tokio::time::timeout(Duration::from_secs(10), async {
                while supervisor.is_running(&spawned.handle).await {
                    tokio::task::yield_now().await;
                }
            })
            .await;
            assert!(polled.is_ok(), "process never observed as exited");
            assert_eq!(*seen_at_exit.lock().expect("record lock"), Some(1200));
        }

        #[tokio::test]
        async fn waiter_reports_exit_and_frees_the_slot() {
            let dir = tempfile::tempdir().expect("tempdir");
            let spec = script(dir.path(), "exit 0");
            let supervisor = ProcessSupervisor::new();
            let (hook, seen) = recording_hook();
            let spawned = supervisor.start(&spec, &[], hook.clone()).await.expect("start");
            supervisor.wait_async(&spawned.handle, Vec::new());

            for _ in 0..40 {
                if hook.has_fired() {
                    break;
                }
                sleep(Duration::from_millis(50)).await;
            }
            assert_eq!(*seen.lock().expect("seen lock"), vec![TaskExit::Exited { code: Some(0) }]);
            assert!(supervisor.current().await.is_none());
        }

        #[tokio::test]
        async fn kill_takes_down_grandchildren() {
            let dir = tempfile::tempdir().expect("tempdir");
            let marker = dir.path().join("child.pid");
            let spec = script(
                dir.path(),
                &format!("sleep 30 &\necho $! > {}\nwait", marker.display()),
            );
            let supervisor = ProcessSupervisor::new();
            let spawned = supervisor.start(&spec, &[], ExitHook::new()).await.expect("start");

            let mut child_pid = None;
            for _ in 0..40 {
                if let Ok(text) = std::fs::read_to_string(&marker) {
                    if let Ok(pid) = text.trim().parse::<i32>() {
                        child_pid = Some(pid);
                        break;
                    }
                }
                sleep(Duration::from_millis(50)).await;
            }
            let child_pid = child_pid.expect("grandchild pid");

            supervisor.kill(&spawned.handle).await;
            sleep(Duration::from_millis(300)).await;
            let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(child_pid), None).is_ok();
            assert!(!alive, "grandchild {} survived", child_pid);
        }

        #[tokio::test]
        async fn run_to_completion_captures_output() {
            let dir = tempfile::tempdir().expect("tempdir");
            let spec = script(dir.path(), "echo \"$@\"");
            let supervisor = ProcessSupervisor::new();
            let output = supervisor
                .run_to_completion(&spec, &["GetRunningGame".to_string()], Duration::from_secs(5))
                .await
                .expect("exec");
            assert!(output.status.success());
            assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "GetRunningGame");
            assert!(supervisor.current().await.is_none());
        }
    }
}
