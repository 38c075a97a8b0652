pub mod controller;
pub mod errors;
pub mod events;
pub mod harness;
pub mod ipc;
pub mod models;
pub mod notify;
pub mod retention;
pub mod settings;
pub mod supervisor;
pub mod transport;

use crate::events::EventSink;
use crate::ipc::WorkerIpc;
use crate::models::{ExecOutput, ExportResponse, StartTaskPayload, StartTaskResponse};
use crate::notify::Notifier;
use crate::settings::{Settings, SettingsStore};
use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

pub const SETTINGS_FILE_NAME: &str = "config.toml";

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

#[derive(Clone)]
pub struct AppState {
    pub ipc: Arc<WorkerIpc>,
}

/// Builds the context the UI shell talks to: host logging, settings from
/// `config.toml` and the transport those settings select.
pub async fn bootstrap(
    app_data_dir: &Path,
    sink: Arc<dyn EventSink>,
    notifier: Arc<dyn Notifier>,
) -> Result<AppState, String> {
    std::fs::create_dir_all(app_data_dir).map_err(|error| error.to_string())?;
    init_tracing(app_data_dir)?;

    let settings = SettingsStore::open(app_data_dir.join(SETTINGS_FILE_NAME)).map_err(to_client_error)?;
    let ipc = WorkerIpc::new(app_data_dir.to_path_buf(), settings, sink, notifier).await;
    Ok(AppState { ipc })
}

pub async fn start_task(state: &AppState, payload: StartTaskPayload) -> Result<StartTaskResponse, String> {
    state.ipc.start_task(payload).await.map_err(to_client_error)
}

pub async fn stop_task(state: &AppState, reason: Option<String>) -> Result<(), String> {
    state.ipc.stop_task(reason).await.map_err(to_client_error)
}

pub async fn exec(state: &AppState, args: Vec<String>) -> Result<ExecOutput, String> {
    state.ipc.exec(args).await.map_err(to_client_error)
}

pub async fn is_task_running(state: &AppState) -> Result<bool, String> {
    Ok(state.ipc.is_task_running().await)
}

pub fn get_settings(state: &AppState) -> Result<Settings, String> {
    Ok(state.ipc.settings())
}

pub async fn update_settings(state: &AppState, patch: serde_json::Value) -> Result<Settings, String> {
    state.ipc.update_settings(patch).await.map_err(to_client_error)
}

pub async fn game_settings_updated(state: &AppState) -> Result<(), String> {
    state.ipc.game_settings_changed().await;
    Ok(())
}

pub fn export_debug_zip(state: &AppState) -> Result<ExportResponse, String> {
    state.ipc.export_debug_zip().map_err(to_client_error)
}

pub async fn shutdown(state: &AppState) -> Result<(), String> {
    state.ipc.shutdown().await;
    Ok(())
}

pub fn init_tracing(app_data_dir: &Path) -> Result<(), String> {
    let log_dir = app_data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "supervisor.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}

fn to_client_error(error: impl std::fmt::Display) -> String {
    error.to_string()
}
