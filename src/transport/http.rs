use super::server::WorkerServer;
use super::{SettingsScope, TaskLaunch, Transport};
use crate::errors::{AppError, AppResult};
use crate::events::UiEvents;
use crate::harness::exit_hook::ExitHook;
use crate::models::{ExecOutput, LogLevel, LogMessage, TaskExit, TransportConfig, TransportKind};
use crate::supervisor::ProcessSupervisor;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const STARTUP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    messages: Vec<serde_json::Value>,
}

struct PendingRequest {
    task_id: String,
    join: JoinHandle<()>,
    exit: Arc<ExitHook>,
}

/// Request/response channel to the worker running as an HTTP server.
///
/// A task is a single `/execute` request; its returned messages are
/// classified in order and the task completes when the response arrives.
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    server: WorkerServer,
    pending: Arc<StdMutex<Option<PendingRequest>>>,
}

impl HttpTransport {
    pub async fn connect(
        config: &TransportConfig,
        supervisor: ProcessSupervisor,
        events: UiEvents,
    ) -> AppResult<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let server = WorkerServer::ensure(config, supervisor, events).await?;
        if server.spawned() {
            tokio::time::sleep(STARTUP_GRACE).await;
        }
        Ok(Self {
            base_url: config.http_base_url(),
            client,
            server,
            pending: Arc::new(StdMutex::new(None)),
        })
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<PendingRequest>> {
        lock_slot(&self.pending)
    }
}

fn lock_slot(slot: &StdMutex<Option<PendingRequest>>) -> std::sync::MutexGuard<'_, Option<PendingRequest>> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn post_execute(
    client: &reqwest::Client,
    base_url: &str,
    args: &[String],
) -> AppResult<(String, Vec<serde_json::Value>)> {
    let response = client
        .post(format!("{}/execute", base_url))
        .json(&serde_json::json!({ "command": args }))
        .send()
        .await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(AppError::TransportConnectionFailed(format!(
            "worker server returned {}: {}",
            status, body
        )));
    }
    let parsed: ExecuteResponse = serde_json::from_str(&body)?;
    Ok((body, parsed.messages))
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn start(&self, launch: TaskLaunch) -> AppResult<()> {
        let TaskLaunch {
            task_id,
            args,
            mut classifier,
            exit,
        } = launch;

        let mut pending = self.lock_pending();
        if let Some(existing) = pending.as_ref() {
            if !existing.join.is_finished() {
                return Err(AppError::AlreadyRunning(format!(
                    "request for task {} is still in flight",
                    existing.task_id
                )));
            }
        }

        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let request_exit = exit.clone();
        let join = tokio::spawn(async move {
            match post_execute(&client, &base_url, &args).await {
                Ok((_, messages)) => {
                    for message in messages {
                        classifier.process_line(&message.to_string());
                    }
                }
                Err(error) => {
                    tracing::warn!(error = %error, "worker server request failed");
                    let failure = LogMessage::new(LogLevel::Error, error.to_string());
                    if let Ok(line) = serde_json::to_string(&failure) {
                        classifier.process_line(&line);
                    }
                }
            }
            classifier.finish();
            request_exit.fire(TaskExit::Completed);
        });

        *pending = Some(PendingRequest {
            task_id: task_id.clone(),
            join,
            exit: exit.clone(),
        });
        drop(pending);

        let slot = self.pending.clone();
        let finished_task = task_id.clone();
        exit.on_exit(move |_| {
            let mut pending = lock_slot(&slot);
            if pending.as_ref().map(|request| request.task_id.as_str()) == Some(finished_task.as_str()) {
                *pending = None;
            }
        });
        tracing::info!(task_id = %task_id, url = %self.base_url, "task started over http");
        Ok(())
    }

    async fn stop(&self) -> AppResult<()> {
        let request = self.lock_pending().take();
        if let Some(request) = request {
            request.join.abort();
            tracing::debug!(task_id = %request.task_id, "aborted in-flight worker request");
        }
        Ok(())
    }

    async fn exec(&self, args: &[String]) -> AppResult<ExecOutput> {
        let (raw, values) = post_execute(&self.client, &self.base_url, args).await?;
        let messages = values
            .into_iter()
            .filter_map(|value| serde_json::from_value::<LogMessage>(value).ok())
            .collect();
        Ok(ExecOutput { raw, messages })
    }

    async fn is_active(&self) -> bool {
        self.lock_pending()
            .as_ref()
            .map(|request| !request.join.is_finished() && !request.exit.has_fired())
            .unwrap_or(false)
    }

    async fn settings_changed(&self, scope: SettingsScope) -> AppResult<()> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, scope.endpoint()))
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::TransportConnectionFailed(format!(
                "worker server returned {} for {}: {}",
                status,
                scope.endpoint(),
                body
            )));
        }
        Ok(())
    }

    async fn shutdown(&self) {
        if let Err(error) = self.stop().await {
            tracing::warn!(error = %error, "failed to stop http task during shutdown");
        }
        self.server.shutdown().await;
    }
}
