pub mod http;
pub mod manager;
mod server;
pub mod stdio;
pub mod websocket;

use crate::errors::AppResult;
use crate::harness::classifier::{classify_line, LineKind, StreamClassifier};
use crate::harness::exit_hook::ExitHook;
use crate::harness::line_buffer::LineBuffer;
use crate::models::{ExecOutput, TransportKind};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::task::JoinHandle;

pub use manager::TransportManager;

/// Worker subcommand that runs it as a long-lived server.
pub const SERVER_SUBCOMMAND: &str = "StartServer";
pub const MAX_LINE_BYTES: usize = 1024 * 1024;
const READ_CHUNK_BYTES: usize = 8192;

/// Everything a transport needs to run one task.
pub struct TaskLaunch {
    pub task_id: String,
    pub args: Vec<String>,
    pub classifier: StreamClassifier,
    pub exit: Arc<ExitHook>,
}

/// One channel to the worker. Exactly one is active at a time.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Begins a task. Output flows into the launch's classifier and the
    /// exit hook fires once when the task is over.
    async fn start(&self, launch: TaskLaunch) -> AppResult<()>;

    /// Asks the running task to end. No-op without one.
    async fn stop(&self) -> AppResult<()>;

    /// Fire-and-wait request independent of any running task.
    async fn exec(&self, args: &[String]) -> AppResult<ExecOutput>;

    async fn is_active(&self) -> bool;

    /// Tells a running worker server that settings on disk changed.
    async fn settings_changed(&self, _scope: SettingsScope) -> AppResult<()> {
        Ok(())
    }

    /// Releases server processes and connections. Safe to call twice.
    async fn shutdown(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsScope {
    General,
    Game,
}

impl SettingsScope {
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::General => "/general-settings-updated",
            Self::Game => "/game-settings-updated",
        }
    }
}

pub(crate) fn server_args(port: u16) -> Vec<String> {
    vec![SERVER_SUBCOMMAND.to_string(), format!("--ws-port={}", port)]
}

/// Reads a worker stream to EOF, feeding complete lines to the classifier
/// in read order.
pub(crate) fn spawn_line_pump<R>(stream: R, mut classifier: StreamClassifier) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
        let mut line_buffer = LineBuffer::new(MAX_LINE_BYTES);
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(size) => {
                    for line in line_buffer.push(&chunk[..size]) {
                        classifier.process_line(&line);
                    }
                    let truncated = line_buffer.consume_truncated_lines();
                    if truncated > 0 {
                        tracing::warn!(
                            truncated,
                            max_line_bytes = MAX_LINE_BYTES,
                            "worker output line exceeded limit and was truncated"
                        );
                    }
                }
                Err(error) => {
                    tracing::warn!(error = %error, "failed reading worker output");
                    break;
                }
            }
        }
        if let Some(line) = line_buffer.flush() {
            classifier.process_line(&line);
        }
        classifier.finish();
    })
}

/// Forwards stderr to host diagnostics.
pub(crate) fn spawn_stderr_drain<R>(stream: R, pid: u32) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
        let mut line_buffer = LineBuffer::new(MAX_LINE_BYTES);
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(size) => {
                    for line in line_buffer.push(&chunk[..size]) {
                        tracing::debug!(pid, line = %line, "worker stderr");
                    }
                }
            }
        }
        if let Some(line) = line_buffer.flush() {
            tracing::debug!(pid, line = %line, "worker stderr");
        }
    })
}

/// Splits captured exec output into lines and keeps those that decode as
/// log messages.
pub(crate) fn decode_exec_output(raw: &str) -> ExecOutput {
    let messages = raw
        .lines()
        .filter_map(|line| match classify_line(line)? {
            LineKind::Log(message) => Some(message),
            _ => None,
        })
        .collect();
    ExecOutput {
        raw: raw.to_string(),
        messages,
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_exec_output, server_args, spawn_line_pump};
    use crate::events::{ChannelSink, LogLevelFilter, UiEvents};
    use crate::harness::classifier::{RunOutcome, StreamClassifier};
    use crate::models::LogLevel;
    use std::sync::Arc;

    #[test]
    fn server_invocation_carries_port() {
        assert_eq!(server_args(8123), vec!["StartServer", "--ws-port=8123"]);
    }

    #[test]
    fn exec_output_keeps_only_log_messages() {
        let raw = "{\"level\":\"INFO\",\"message\":\"AFKJourney\"}\r\nwarming up\n{\"summaryMessage\":\"s\"}\n";
        let output = decode_exec_output(raw);
        assert_eq!(output.messages.len(), 1);
        assert_eq!(output.messages[0].message, "AFKJourney");
        assert_eq!(output.raw, raw);
    }

    #[tokio::test]
    async fn pump_flushes_unterminated_tail() {
        let (sink, mut receiver) = ChannelSink::new();
        let events = UiEvents::new(Arc::new(sink), Arc::new(LogLevelFilter::new(LogLevel::Trace)));
        let outcome = RunOutcome::new();
        let classifier = StreamClassifier::new(None, events, outcome.clone(), None);

        let input: &[u8] = b"{\"level\":\"INFO\",\"message\":\"a\"}\r\n{\"level\":\"INFO\",\"message\":\"b\"}";
        spawn_line_pump(input, classifier).await.expect("pump task");

        let first = receiver.try_recv().expect("first message");
        let second = receiver.try_recv().expect("second message");
        assert_eq!(first.payload["message"], "a");
        assert_eq!(second.payload["message"], "b");
        assert!(first.seq < second.seq);
        assert_eq!(outcome.last_log_message().map(|m| m.message), Some("b".to_string()));
    }
}
