use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }

    /// Numeric priority used by the UI delivery filter. Higher is more severe.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Trace => 1,
            Self::Debug => 2,
            Self::Info => 3,
            Self::Warning => 4,
            Self::Error => 5,
            Self::Fatal => 6,
        }
    }

    pub fn from_priority(priority: u8) -> Self {
        match priority {
            0 | 1 => Self::Trace,
            2 => Self::Debug,
            3 => Self::Info,
            4 => Self::Warning,
            5 => Self::Error,
            _ => Self::Fatal,
        }
    }

    /// Lenient parse for values coming from settings: anything unknown is Info.
    pub fn from_setting(value: &str) -> Self {
        value.parse().unwrap_or(Self::Info)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "TRACE" => Ok(Self::Trace),
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARNING" | "WARN" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "FATAL" | "CRITICAL" => Ok(Self::Fatal),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for LogLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One diagnostic line produced by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: LogLevel,
    pub message: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_class: Option<String>,
}

impl LogMessage {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
            source_file: None,
            function_name: None,
            line_number: None,
            html_class: None,
        }
    }
}

/// Outcome message for a task run. Everything besides the message text is
/// kept verbatim for the UI.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    pub summary_message: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

const SUMMARY_KEYS: [&str; 2] = ["summaryMessage", "summary_message"];

impl Summary {
    pub fn new(summary_message: impl Into<String>) -> Self {
        Self {
            summary_message: summary_message.into(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn is_populated(&self) -> bool {
        !self.summary_message.trim().is_empty()
    }
}

impl Serialize for Summary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut object = self.fields.clone();
        object.insert(
            SUMMARY_KEYS[0].to_string(),
            serde_json::Value::String(self.summary_message.clone()),
        );
        object.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Summary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut fields = serde_json::Map::<String, serde_json::Value>::deserialize(deserializer)?;
        let mut summary_message = String::new();
        for key in SUMMARY_KEYS {
            match fields.remove(key) {
                Some(serde_json::Value::String(text)) if summary_message.is_empty() => summary_message = text,
                Some(serde_json::Value::String(_)) | Some(serde_json::Value::Null) | None => {}
                Some(other) => {
                    return Err(serde::de::Error::custom(format!(
                        "{} must be a string, got {}",
                        key, other
                    )))
                }
            }
        }
        Ok(Self {
            summary_message,
            fields,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Http,
    #[serde(alias = "ws")]
    WebSocket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::WebSocket => "websocket",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub host: String,
    pub port: u16,
    pub websocket_path: String,
    pub binary_path: PathBuf,
    pub is_dev_mode: bool,
    pub dev_entry_point: String,
    pub working_dir: Option<PathBuf>,
}

impl TransportConfig {
    pub fn stdio(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            kind: TransportKind::Stdio,
            host: "127.0.0.1".to_string(),
            port: 62121,
            websocket_path: "/ws".to_string(),
            binary_path: binary_path.into(),
            is_dev_mode: false,
            dev_entry_point: "worker".to_string(),
            working_dir: None,
        }
    }

    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn http_base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn websocket_url(&self) -> String {
        let path = if self.websocket_path.starts_with('/') || self.websocket_path.is_empty() {
            self.websocket_path.clone()
        } else {
            format!("/{}", self.websocket_path)
        };
        format!("ws://{}:{}{}", self.host, self.port, path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Idle,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskExit {
    Exited { code: Option<i32> },
    Stopped,
    ConnectionLost(String),
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTaskPayload {
    pub args: Vec<String>,
    #[serde(default)]
    pub notify_on_end: bool,
    #[serde(default)]
    pub log_level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTaskResponse {
    pub task_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub raw: String,
    pub messages: Vec<LogMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub task_id: Option<String>,
    pub r#type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResponse {
    pub path: String,
}
