use super::http::HttpTransport;
use super::stdio::StdioTransport;
use super::websocket::WebSocketTransport;
use super::Transport;
use crate::errors::{AppError, AppResult};
use crate::events::UiEvents;
use crate::models::{TransportConfig, TransportKind};
use crate::supervisor::ProcessSupervisor;
use std::sync::Arc;
use tokio::sync::Mutex;

struct ManagerState {
    config: Option<TransportConfig>,
    active: Option<Arc<dyn Transport>>,
}

/// Holds the single active transport and swaps it when configuration
/// changes.
///
/// `state` is held only to read or swap the transport. Teardown and
/// construction run under `rebuild`; while one is in progress callers see
/// no transport.
pub struct TransportManager {
    supervisor: ProcessSupervisor,
    events: UiEvents,
    state: Mutex<ManagerState>,
    rebuild: Mutex<()>,
}

impl TransportManager {
    pub fn new(supervisor: ProcessSupervisor, events: UiEvents) -> Self {
        Self {
            supervisor,
            events,
            state: Mutex::new(ManagerState {
                config: None,
                active: None,
            }),
            rebuild: Mutex::new(()),
        }
    }

    pub async fn active(&self) -> AppResult<Arc<dyn Transport>> {
        self.state
            .lock()
            .await
            .active
            .clone()
            .ok_or_else(|| AppError::NoTransportAvailable("no transport is configured".to_string()))
    }

    pub async fn active_kind(&self) -> Option<TransportKind> {
        self.state.lock().await.active.as_ref().map(|transport| transport.kind())
    }

    /// Rebuilds the transport when `config` differs from the current one.
    /// The old transport is always torn down before the new one is built.
    /// Socket and HTTP failures fall back to stdio.
    pub async fn reconfigure(&self, config: TransportConfig) -> AppResult<TransportKind> {
        let _rebuild = self.rebuild.lock().await;
        let previous = {
            let mut state = self.state.lock().await;
            if let (Some(current), Some(active)) = (state.config.as_ref(), state.active.as_ref()) {
                if *current == config {
                    return Ok(active.kind());
                }
            }
            state.config = None;
            state.active.take()
        };

        if let Some(previous) = previous {
            tracing::info!(kind = previous.kind().as_str(), "tearing down transport");
            previous.shutdown().await;
        }

        let transport = self.build(&config).await?;
        let kind = transport.kind();
        {
            let mut state = self.state.lock().await;
            state.active = Some(transport);
            state.config = Some(config);
        }
        tracing::info!(kind = kind.as_str(), "transport ready");
        Ok(kind)
    }

    /// Installs a prebuilt transport in place of the current one. The next
    /// `reconfigure` replaces it.
    pub async fn install(&self, transport: Arc<dyn Transport>) {
        let _rebuild = self.rebuild.lock().await;
        let previous = {
            let mut state = self.state.lock().await;
            state.config = None;
            state.active.replace(transport)
        };
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
    }

    /// Waits for any rebuild in progress so nothing is installed after it.
    pub async fn shutdown(&self) {
        let _rebuild = self.rebuild.lock().await;
        let previous = {
            let mut state = self.state.lock().await;
            state.config = None;
            state.active.take()
        };
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
    }

    async fn build(&self, config: &TransportConfig) -> AppResult<Arc<dyn Transport>> {
        let attempt: AppResult<Arc<dyn Transport>> = match config.kind {
            TransportKind::Stdio => return self.build_stdio(config),
            TransportKind::Http => HttpTransport::connect(config, self.supervisor.clone(), self.events.clone())
                .await
                .map(|transport| Arc::new(transport) as Arc<dyn Transport>),
            TransportKind::WebSocket => {
                WebSocketTransport::connect(config, self.supervisor.clone(), self.events.clone())
                    .await
                    .map(|transport| Arc::new(transport) as Arc<dyn Transport>)
            }
        };
        match attempt {
            Ok(transport) => Ok(transport),
            Err(error) => {
                tracing::warn!(
                    kind = config.kind.as_str(),
                    error = %error,
                    "transport unavailable; falling back to stdio"
                );
                self.build_stdio(config)
            }
        }
    }

    fn build_stdio(&self, config: &TransportConfig) -> AppResult<Arc<dyn Transport>> {
        StdioTransport::new(config, self.supervisor.clone())
            .map(|transport| Arc::new(transport) as Arc<dyn Transport>)
            .map_err(|error| AppError::NoTransportAvailable(error.to_string()))
    }
}
