use super::server::WorkerServer;
use super::{decode_exec_output, TaskLaunch, Transport};
use crate::errors::{AppError, AppResult};
use crate::events::UiEvents;
use crate::harness::classifier::StreamClassifier;
use crate::harness::exit_hook::ExitHook;
use crate::harness::remediation::with_remediation;
use crate::models::{ExecOutput, LogMessage, TaskExit, TransportConfig, TransportKind};
use crate::supervisor::ProcessSupervisor;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type SocketStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PING_TIMEOUT: Duration = Duration::from_secs(2);
const EXEC_TIMEOUT: Duration = Duration::from_secs(10);
const READER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Where inbound lines go: a task's classifier, or a detached one between
/// tasks.
struct Route {
    task_id: Option<String>,
    classifier: StreamClassifier,
    exit: Option<Arc<ExitHook>>,
}

impl Route {
    fn detached(events: &UiEvents) -> Self {
        Self {
            task_id: None,
            classifier: StreamClassifier::detached(events.clone()),
            exit: None,
        }
    }
}

enum ReaderCommand {
    Attach(Route),
    Detach(String),
    AwaitExec(oneshot::Sender<ExecReply>),
    Close,
}

#[derive(Debug, Default, Deserialize)]
struct ExecReply {
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

impl ExecReply {
    fn into_output(self) -> AppResult<ExecOutput> {
        if let Some(error) = self.error.filter(|error| !error.trim().is_empty()) {
            return Err(AppError::ProcessStartFailed(with_remediation(error, &[])));
        }
        Ok(match self.output {
            Some(serde_json::Value::String(text)) => decode_exec_output(&text),
            Some(serde_json::Value::Array(items)) => {
                let raw = serde_json::Value::Array(items.clone()).to_string();
                let messages = items
                    .into_iter()
                    .filter_map(|item| serde_json::from_value::<LogMessage>(item).ok())
                    .collect();
                ExecOutput { raw, messages }
            }
            Some(other) => ExecOutput {
                raw: other.to_string(),
                messages: Vec::new(),
            },
            None => ExecOutput::default(),
        })
    }
}

struct Connection {
    writer: SplitSink<SocketStream, Message>,
    commands: mpsc::UnboundedSender<ReaderCommand>,
    pong: Arc<Notify>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn spawn(socket: SocketStream, events: UiEvents) -> Self {
        let (writer, stream) = socket.split();
        let (commands, receiver) = mpsc::unbounded_channel();
        let pong = Arc::new(Notify::new());
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(run_reader(stream, receiver, events, pong.clone(), alive.clone()));
        Self {
            writer,
            commands,
            pong,
            alive,
            reader,
        }
    }

    /// Ping/Pong round trip bounded by `PING_TIMEOUT`.
    async fn probe(&mut self) -> bool {
        if !self.alive.load(Ordering::SeqCst) {
            return false;
        }
        let notified = self.pong.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.writer.send(Message::Ping(Vec::new())).await.is_err() {
            return false;
        }
        timeout(PING_TIMEOUT, notified).await.is_ok()
    }

    async fn send_json(&mut self, payload: serde_json::Value) -> AppResult<()> {
        self.writer.send(Message::Text(payload.to_string())).await?;
        Ok(())
    }

    async fn close(mut self) {
        let _ = self.commands.send(ReaderCommand::Close);
        if let Err(error) = self.writer.send(Message::Close(None)).await {
            tracing::debug!(error = %error, "socket already closed");
        }
        match timeout(READER_SHUTDOWN_TIMEOUT, &mut self.reader).await {
            Ok(_) => {}
            Err(_) => {
                tracing::debug!("socket reader did not stop in time; aborting");
                self.reader.abort();
            }
        }
    }
}

async fn run_reader(
    mut stream: SplitStream<SocketStream>,
    mut commands: mpsc::UnboundedReceiver<ReaderCommand>,
    events: UiEvents,
    pong: Arc<Notify>,
    alive: Arc<AtomicBool>,
) {
    let mut route = Route::detached(&events);
    let mut pending_exec: Option<oneshot::Sender<ExecReply>> = None;

    let reason = loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(ReaderCommand::Attach(attached)) => {
                    route.classifier.finish();
                    route = attached;
                }
                Some(ReaderCommand::Detach(task_id)) => {
                    if route.task_id.as_deref() == Some(task_id.as_str()) {
                        route.classifier.finish();
                        route = Route::detached(&events);
                    }
                }
                Some(ReaderCommand::AwaitExec(reply)) => pending_exec = Some(reply),
                Some(ReaderCommand::Close) | None => break "socket transport shut down".to_string(),
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = take_exec_reply(&text, &pending_exec) {
                        if let Some(sender) = pending_exec.take() {
                            let _ = sender.send(reply);
                        }
                        continue;
                    }
                    for line in text.lines() {
                        route.classifier.process_line(line);
                    }
                }
                Some(Ok(Message::Pong(_))) => pong.notify_waiters(),
                Some(Ok(Message::Close(_))) => break "server closed the connection".to_string(),
                Some(Ok(_)) => {}
                Some(Err(error)) => break error.to_string(),
                None => break "connection closed".to_string(),
            },
        }
    };

    alive.store(false, Ordering::SeqCst);
    route.classifier.finish();
    tracing::info!(reason = %reason, "socket connection ended");
    if let Some(exit) = route.exit {
        exit.fire(TaskExit::ConnectionLost(reason));
    }
}

/// Replies to `exec` carry `output` or `error`; anything else is stream
/// output.
fn take_exec_reply(text: &str, pending: &Option<oneshot::Sender<ExecReply>>) -> Option<ExecReply> {
    pending.as_ref()?;
    let value: serde_json::Value = serde_json::from_str(text.trim()).ok()?;
    let object = value.as_object()?;
    if !object.contains_key("output") && !object.contains_key("error") {
        return None;
    }
    serde_json::from_value(value).ok()
}

struct ActiveTask {
    task_id: String,
    exit: Arc<ExitHook>,
}

/// Persistent socket to the worker server. Output is streamed, never
/// returned from `start`.
pub struct WebSocketTransport {
    url: String,
    events: UiEvents,
    retry: RetryPolicy,
    server: WorkerServer,
    connection: Mutex<Option<Connection>>,
    exec_lock: Mutex<()>,
    task: Arc<StdMutex<Option<ActiveTask>>>,
}

impl WebSocketTransport {
    pub async fn connect(
        config: &TransportConfig,
        supervisor: ProcessSupervisor,
        events: UiEvents,
    ) -> AppResult<Self> {
        Self::connect_with(config, supervisor, events, RetryPolicy::default()).await
    }

    pub async fn connect_with(
        config: &TransportConfig,
        supervisor: ProcessSupervisor,
        events: UiEvents,
        retry: RetryPolicy,
    ) -> AppResult<Self> {
        let server = WorkerServer::ensure(config, supervisor, events.clone()).await?;
        let transport = Self {
            url: config.websocket_url(),
            events,
            retry,
            server,
            connection: Mutex::new(None),
            exec_lock: Mutex::new(()),
            task: Arc::new(StdMutex::new(None)),
        };
        if let Err(error) = transport.ensure_connected().await {
            transport.server.shutdown().await;
            return Err(error);
        }
        Ok(transport)
    }

    /// Reuses a live connection after a liveness probe, reconnecting
    /// otherwise.
    async fn ensure_connected(&self) -> AppResult<()> {
        let mut connection = self.connection.lock().await;
        if let Some(existing) = connection.as_mut() {
            if existing.probe().await {
                return Ok(());
            }
            tracing::warn!(url = %self.url, "socket liveness probe failed; reconnecting");
            if let Some(stale) = connection.take() {
                stale.close().await;
            }
        }
        *connection = Some(self.connect_with_retry().await?);
        Ok(())
    }

    async fn connect_with_retry(&self) -> AppResult<Connection> {
        let mut last_error = String::new();
        for attempt in 1..=self.retry.attempts {
            match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((socket, _)) => {
                    tracing::info!(url = %self.url, attempt, "connected to worker socket");
                    return Ok(Connection::spawn(socket, self.events.clone()));
                }
                Err(error) => {
                    tracing::debug!(url = %self.url, attempt, error = %error, "socket connect failed");
                    last_error = error.to_string();
                    if attempt < self.retry.attempts {
                        sleep(self.retry.backoff).await;
                    }
                }
            }
        }
        Err(AppError::TransportConnectionFailed(format!(
            "could not connect to {} after {} attempts: {}",
            self.url, self.retry.attempts, last_error
        )))
    }

    async fn send_command(&self, command: &str, args: &[String]) -> AppResult<()> {
        let mut connection = self.connection.lock().await;
        let Some(connection) = connection.as_mut() else {
            return Err(AppError::TransportConnectionFailed("socket is not connected".to_string()));
        };
        connection
            .send_json(serde_json::json!({ "command": command, "args": args }))
            .await
    }

    async fn reader_commands(&self) -> AppResult<mpsc::UnboundedSender<ReaderCommand>> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|connection| connection.commands.clone())
            .ok_or_else(|| AppError::TransportConnectionFailed("socket is not connected".to_string()))
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<ActiveTask>> {
        lock_active(&self.task)
    }
}

fn lock_active(slot: &StdMutex<Option<ActiveTask>>) -> std::sync::MutexGuard<'_, Option<ActiveTask>> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn clear_task(slot: &StdMutex<Option<ActiveTask>>, task_id: &str) {
    let mut active = lock_active(slot);
    if active.as_ref().map(|task| task.task_id.as_str()) == Some(task_id) {
        *active = None;
    }
}

fn send_to_reader(commands: &mpsc::UnboundedSender<ReaderCommand>, command: ReaderCommand) -> AppResult<()> {
    commands
        .send(command)
        .map_err(|_| AppError::TransportConnectionFailed("socket reader has stopped".to_string()))
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn start(&self, launch: TaskLaunch) -> AppResult<()> {
        let TaskLaunch {
            task_id,
            args,
            classifier,
            exit,
        } = launch;

        if let Some(active) = self.lock_task().as_ref() {
            if !active.exit.has_fired() {
                return Err(AppError::AlreadyRunning(format!(
                    "task {} is still running on the worker server",
                    active.task_id
                )));
            }
        }

        self.ensure_connected().await?;
        let commands = self.reader_commands().await?;
        send_to_reader(
            &commands,
            ReaderCommand::Attach(Route {
                task_id: Some(task_id.clone()),
                classifier,
                exit: Some(exit.clone()),
            }),
        )?;
        *self.lock_task() = Some(ActiveTask {
            task_id: task_id.clone(),
            exit: exit.clone(),
        });

        let slot = self.task.clone();
        let finished_task = task_id.clone();
        let detach = commands.clone();
        exit.on_exit(move |_| {
            clear_task(&slot, &finished_task);
            let _ = detach.send(ReaderCommand::Detach(finished_task));
        });

        if let Err(error) = self.send_command("start", &args).await {
            clear_task(&self.task, &task_id);
            let _ = commands.send(ReaderCommand::Detach(task_id));
            return Err(error);
        }
        tracing::info!(task_id = %task_id, url = %self.url, "task started over socket");
        Ok(())
    }

    async fn stop(&self) -> AppResult<()> {
        let running = self.lock_task().as_ref().map(|task| task.task_id.clone());
        let Some(task_id) = running else {
            return Ok(());
        };
        tracing::debug!(task_id = %task_id, "sending stop to worker server");
        self.send_command("stop", &[]).await
    }

    async fn exec(&self, args: &[String]) -> AppResult<ExecOutput> {
        self.ensure_connected().await?;
        let _exclusive = self.exec_lock.lock().await;
        let (reply_tx, reply_rx) = oneshot::channel();
        send_to_reader(&self.reader_commands().await?, ReaderCommand::AwaitExec(reply_tx))?;
        self.send_command("exec", args).await?;
        match timeout(EXEC_TIMEOUT, reply_rx).await {
            Ok(Ok(reply)) => reply.into_output(),
            Ok(Err(_)) => Err(AppError::TransportConnectionFailed(
                "connection closed before the worker replied".to_string(),
            )),
            Err(_) => Err(AppError::TransportConnectionFailed(format!(
                "worker did not reply within {}s",
                EXEC_TIMEOUT.as_secs()
            ))),
        }
    }

    async fn is_active(&self) -> bool {
        let running = self
            .lock_task()
            .as_ref()
            .map(|task| !task.exit.has_fired())
            .unwrap_or(false);
        if !running {
            return false;
        }
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|connection| connection.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    async fn shutdown(&self) {
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            connection.close().await;
        }
        self.server.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::{take_exec_reply, ExecReply};
    use crate::errors::AppError;
    use tokio::sync::oneshot;

    #[test]
    fn exec_reply_only_matches_while_pending() {
        assert!(take_exec_reply(r#"{"output":"x"}"#, &None).is_none());

        let (sender, _receiver) = oneshot::channel();
        let pending = Some(sender);
        assert!(take_exec_reply(r#"{"level":"INFO","message":"log"}"#, &pending).is_none());
        assert!(take_exec_reply(r#"{"output":"x"}"#, &pending).is_some());
    }

    #[test]
    fn exec_reply_decodes_array_and_errors() {
        let reply: ExecReply = serde_json::from_str(
            r#"{"output":[{"level":"INFO","message":"AFKJourney"},{"bogus":true}]}"#,
        )
        .expect("reply");
        let output = reply.into_output().expect("output");
        assert_eq!(output.messages.len(), 1);
        assert_eq!(output.messages[0].message, "AFKJourney");

        let reply: ExecReply = serde_json::from_str(r#"{"error":"Device not found"}"#).expect("reply");
        assert!(matches!(reply.into_output(), Err(AppError::ProcessStartFailed(_))));
    }
}
