use crate::controller::TaskController;
use crate::errors::AppResult;
use crate::events::{EventSink, LogLevelFilter, UiEvents};
use crate::models::{ExecOutput, ExportResponse, StartTaskPayload, StartTaskResponse, TaskPhase, TransportConfig, TransportKind};
use crate::notify::{GatedNotifier, Notifier};
use crate::retention::LogRetention;
use crate::settings::{Settings, SettingsStore};
use crate::supervisor::ProcessSupervisor;
use crate::transport::{SettingsScope, TransportManager};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Duration;

/// Application context: one of everything, constructed once and shared.
pub struct WorkerIpc {
    app_data_dir: PathBuf,
    settings: SettingsStore,
    filter: Arc<LogLevelFilter>,
    notifier: Arc<GatedNotifier>,
    transports: Arc<TransportManager>,
    retention: Arc<LogRetention>,
    controller: TaskController,
    shut_down: AtomicBool,
}

impl WorkerIpc {
    pub async fn new(
        app_data_dir: PathBuf,
        settings: SettingsStore,
        sink: Arc<dyn EventSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Self::with_stop_grace(app_data_dir, settings, sink, notifier, crate::controller::DEFAULT_STOP_GRACE).await
    }

    pub async fn with_stop_grace(
        app_data_dir: PathBuf,
        settings: SettingsStore,
        sink: Arc<dyn EventSink>,
        notifier: Arc<dyn Notifier>,
        stop_grace: Duration,
    ) -> Arc<Self> {
        let current = settings.get();
        let filter = Arc::new(LogLevelFilter::new(current.log_level()));
        let events = UiEvents::new(sink, filter.clone());
        let notifier = Arc::new(GatedNotifier::new(notifier, current.ui.notifications_enabled));
        let supervisor = ProcessSupervisor::new();
        let transports = Arc::new(TransportManager::new(supervisor, events.clone()));
        let retention = Arc::new(LogRetention::new(
            resolve_dir(&app_data_dir, &current.logging.debug_dir),
            current.logging.action_log_limit,
        ));
        let controller = TaskController::new(
            transports.clone(),
            retention.clone(),
            events,
            notifier.clone(),
        )
        .with_stop_grace(stop_grace);

        let ipc = Arc::new(Self {
            app_data_dir,
            settings,
            filter,
            notifier,
            transports,
            retention,
            controller,
            shut_down: AtomicBool::new(false),
        });
        if let Err(error) = ipc.transports.reconfigure(ipc.transport_config(&current)).await {
            tracing::warn!(error = %error, "no transport available at startup");
        }
        ipc
    }

    pub fn settings(&self) -> Settings {
        self.settings.get()
    }

    pub fn phase(&self) -> TaskPhase {
        self.controller.phase()
    }

    pub async fn transport_kind(&self) -> Option<TransportKind> {
        self.transports.active_kind().await
    }

    pub async fn start_task(&self, payload: StartTaskPayload) -> AppResult<StartTaskResponse> {
        self.controller.start_task(payload).await
    }

    pub async fn stop_task(&self, reason: Option<String>) -> AppResult<()> {
        self.controller.stop_task(reason).await
    }

    pub async fn exec(&self, args: Vec<String>) -> AppResult<ExecOutput> {
        self.controller.exec(args).await
    }

    pub async fn is_task_running(&self) -> bool {
        self.controller.is_task_running().await
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.controller.set_blocked(blocked);
    }

    /// Persists a partial settings patch, re-applies runtime settings and
    /// rebuilds the transport when its configuration changed.
    pub async fn update_settings(&self, patch: serde_json::Value) -> AppResult<Settings> {
        let updated = self.settings.update(patch)?;
        self.filter.set(updated.log_level());
        self.retention.set_limit(updated.logging.action_log_limit);
        self.notifier.set_enabled(updated.ui.notifications_enabled);
        if resolve_dir(&self.app_data_dir, &updated.logging.debug_dir) != self.retention.debug_dir() {
            tracing::info!("debug directory change takes effect after restart");
        }

        if let Err(error) = self.transports.reconfigure(self.transport_config(&updated)).await {
            tracing::warn!(error = %error, "transport unavailable after settings change");
            return Ok(updated);
        }
        self.notify_settings_changed(SettingsScope::General).await;
        Ok(updated)
    }

    /// Lets a running worker server drop cached per-game settings.
    pub async fn game_settings_changed(&self) {
        self.notify_settings_changed(SettingsScope::Game).await;
    }

    pub fn export_debug_zip(&self) -> AppResult<ExportResponse> {
        self.retention.export_debug_zip()
    }

    /// Stops any task, then releases the transport. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.controller.set_blocked(true);
        if let Err(error) = self.controller.stop_task(Some("Shutting down".to_string())).await {
            tracing::warn!(error = %error, "failed to stop task during shutdown");
        }
        self.transports.shutdown().await;
        self.controller.set_blocked(false);
        tracing::info!("worker ipc shut down");
    }

    fn transport_config(&self, settings: &Settings) -> TransportConfig {
        let mut config = settings.transport_config();
        config.binary_path = resolve_dir(&self.app_data_dir, &config.binary_path);
        config.working_dir = Some(self.app_data_dir.clone());
        config
    }

    async fn notify_settings_changed(&self, scope: SettingsScope) {
        let Ok(transport) = self.transports.active().await else {
            return;
        };
        if let Err(error) = transport.settings_changed(scope).await {
            tracing::warn!(error = %error, scope = ?scope, "worker did not acknowledge settings change");
        }
    }
}

/// Relative paths in settings are relative to the app data directory.
fn resolve_dir(base: &Path, path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() || path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
