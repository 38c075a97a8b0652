#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, Duration, Instant};
use worker_ipc::events::ChannelSink;
use worker_ipc::ipc::WorkerIpc;
use worker_ipc::models::{EventEnvelope, TaskPhase};
use worker_ipc::notify::Notifier;
use worker_ipc::settings::{Settings, SettingsStore};

#[derive(Default)]
pub struct RecordingNotifier(Mutex<Vec<(String, String)>>);

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.0.lock().expect("notifications").clone()
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, title: &str, body: &str) {
        self.0
            .lock()
            .expect("notifications")
            .push((title.to_string(), body.to_string()));
    }
}

pub struct Harness {
    pub ipc: Arc<WorkerIpc>,
    pub events: UnboundedReceiver<EventEnvelope>,
    pub notifier: Arc<RecordingNotifier>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn debug_dir(&self) -> PathBuf {
        self.dir.path().join("debug")
    }

    pub fn drain(&mut self) -> Vec<EventEnvelope> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn log_messages(events: &[EventEnvelope]) -> Vec<String> {
        events
            .iter()
            .filter(|event| event.r#type == "log-message")
            .map(|event| event.payload["message"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub async fn wait_for_phase(&self, phase: TaskPhase, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if self.ipc.phase() == phase {
                return true;
            }
            sleep(Duration::from_millis(25)).await;
        }
        self.ipc.phase() == phase
    }
}

/// Copies the mock worker into `dir` and makes it executable.
#[cfg(unix)]
pub fn install_worker(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let source = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/mock-worker.sh");
    let target = dir.join("worker.sh");
    std::fs::copy(&source, &target).expect("copy mock worker");
    std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755)).expect("chmod mock worker");
    target
}

pub fn base_settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.advanced.binary_path = dir.join("worker.sh");
    settings.logging.debug_dir = dir.join("debug");
    settings.logging.level = "DEBUG".to_string();
    settings.ui.notifications_enabled = true;
    settings
}

pub async fn harness_with(dir: tempfile::TempDir, settings: Settings) -> Harness {
    let (sink, events) = ChannelSink::new();
    let notifier = Arc::new(RecordingNotifier::default());
    let ipc = WorkerIpc::with_stop_grace(
        dir.path().to_path_buf(),
        SettingsStore::in_memory(settings),
        Arc::new(sink),
        notifier.clone(),
        Duration::from_millis(200),
    )
    .await;
    Harness {
        ipc,
        events,
        notifier,
        dir,
    }
}

pub async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("local addr").port()
}
