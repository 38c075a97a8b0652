use crate::models::{LogLevel, LogMessage, Summary};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const TITLE_TASK_ENDED: &str = "Task ended";
pub const TITLE_TASK_FAILED: &str = "Task exited with Error";

/// Desktop notification channel provided by the host shell.
pub trait Notifier: Send + Sync {
    fn send(&self, title: &str, body: &str);
}

#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn send(&self, title: &str, body: &str) {
        tracing::info!(title = %title, body = %body, "notification");
    }
}

/// Honors the user's "notifications enabled" switch.
pub struct GatedNotifier {
    inner: Arc<dyn Notifier>,
    enabled: AtomicBool,
}

impl GatedNotifier {
    pub fn new(inner: Arc<dyn Notifier>, enabled: bool) -> Self {
        Self {
            inner,
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl Notifier for GatedNotifier {
    fn send(&self, title: &str, body: &str) {
        if !self.is_enabled() {
            tracing::debug!(title = %title, "notification suppressed by settings");
            return;
        }
        self.inner.send(title, body);
    }
}

/// Title and body for the end-of-task notification. An error-level final
/// message wins over any summary.
pub fn end_of_task_notification(
    last_log_message: Option<&LogMessage>,
    summary: Option<&Summary>,
) -> (&'static str, String) {
    if let Some(last) = last_log_message {
        if last.level == LogLevel::Error {
            return (TITLE_TASK_FAILED, last.message.clone());
        }
    }
    let body = summary
        .map(|summary| summary.summary_message.clone())
        .unwrap_or_default();
    (TITLE_TASK_ENDED, body)
}
