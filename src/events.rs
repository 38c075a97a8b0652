use crate::models::{EventEnvelope, LogLevel, LogMessage};
use chrono::Utc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;

pub const EVENT_LOG_MESSAGE: &str = "log-message";
pub const EVENT_TASK_STARTED: &str = "task-started";
pub const EVENT_WRITE_SUMMARY_TO_LOG: &str = "write-summary-to-log";
pub const EVENT_TASK_STOPPED: &str = "task-stopped";

/// Receives everything this layer wants the UI to see.
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: EventEnvelope);
}

#[derive(Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<EventEnvelope>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, envelope: EventEnvelope) {
        if self.sender.send(envelope).is_err() {
            tracing::debug!("ui event receiver dropped");
        }
    }
}

/// Minimum level a worker message needs to reach the UI.
#[derive(Debug)]
pub struct LogLevelFilter {
    min_priority: AtomicU8,
}

impl LogLevelFilter {
    pub fn new(level: LogLevel) -> Self {
        Self {
            min_priority: AtomicU8::new(level.priority()),
        }
    }

    pub fn current(&self) -> LogLevel {
        LogLevel::from_priority(self.min_priority.load(Ordering::SeqCst))
    }

    pub fn set(&self, level: LogLevel) {
        self.min_priority.store(level.priority(), Ordering::SeqCst);
    }

    /// Installs `level` and hands back the one it replaced.
    pub fn replace(&self, level: LogLevel) -> LogLevel {
        LogLevel::from_priority(self.min_priority.swap(level.priority(), Ordering::SeqCst))
    }

    pub fn allows(&self, level: LogLevel) -> bool {
        level.priority() >= self.min_priority.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct UiEvents {
    sink: Arc<dyn EventSink>,
    filter: Arc<LogLevelFilter>,
    seq: Arc<StdMutex<u64>>,
}

impl UiEvents {
    pub fn new(sink: Arc<dyn EventSink>, filter: Arc<LogLevelFilter>) -> Self {
        Self {
            sink,
            filter,
            seq: Arc::new(StdMutex::new(0)),
        }
    }

    pub fn filter(&self) -> &Arc<LogLevelFilter> {
        &self.filter
    }

    pub fn emit(&self, task_id: Option<&str>, event_type: &str, payload: serde_json::Value) {
        // Numbering and delivery share the lock so seq order is delivery order.
        let mut seq = match self.seq.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *seq += 1;
        self.sink.emit(EventEnvelope {
            task_id: task_id.map(str::to_string),
            r#type: event_type.to_string(),
            payload,
            timestamp: Utc::now(),
            seq: *seq,
        });
    }

    /// Forwards a worker message if it clears the level filter.
    pub fn log_message(&self, task_id: Option<&str>, message: &LogMessage) -> bool {
        if !self.filter.allows(message.level) {
            return false;
        }
        match serde_json::to_value(message) {
            Ok(payload) => {
                self.emit(task_id, EVENT_LOG_MESSAGE, payload);
                true
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to encode log message for ui");
                false
            }
        }
    }

    /// Host-side note shown in the UI log next to worker output.
    pub fn note(&self, task_id: Option<&str>, level: LogLevel, text: impl Into<String>) {
        let message = LogMessage::new(level, text);
        self.log_message(task_id, &message);
    }
}
