use crate::events::UiEvents;
use crate::models::{LogMessage, Summary};
use crate::retention::RunLog;
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex as StdMutex};

static ANSI_ESCAPE_RE: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("valid ansi escape regex")
});

#[derive(Debug, Clone, PartialEq)]
pub enum LineKind {
    Summary(Summary),
    Log(LogMessage),
    Noise(String),
}

/// Classifies one raw line. Blank lines yield `None`.
///
/// Summary decoding is tried first and only counts when the message text is
/// non-empty; anything else falls through to LogMessage decoding.
pub fn classify_line(raw: &str) -> Option<LineKind> {
    let line = sanitize_line(raw);
    if line.is_empty() {
        return None;
    }
    if let Some(summary) = decode_summary(&line) {
        return Some(LineKind::Summary(summary));
    }
    Some(match serde_json::from_str::<LogMessage>(&line) {
        Ok(message) => LineKind::Log(message),
        Err(_) => LineKind::Noise(line),
    })
}

fn decode_summary(line: &str) -> Option<Summary> {
    serde_json::from_str::<Summary>(line)
        .ok()
        .filter(Summary::is_populated)
}

fn sanitize_line(raw: &str) -> String {
    ANSI_ESCAPE_RE.replace_all(raw, "").trim().to_string()
}

#[derive(Debug, Default, Clone)]
struct OutcomeState {
    summary: Option<Summary>,
    last_log_message: Option<LogMessage>,
}

/// What a run has produced so far: the latest populated summary and the
/// last delivered log message.
#[derive(Debug, Default)]
pub struct RunOutcome {
    state: StdMutex<OutcomeState>,
}

impl RunOutcome {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_summary(&self, summary: Summary) {
        self.lock().summary = Some(summary);
    }

    pub fn record_log_message(&self, message: LogMessage) {
        self.lock().last_log_message = Some(message);
    }

    pub fn summary(&self) -> Option<Summary> {
        self.lock().summary.clone()
    }

    pub fn last_log_message(&self) -> Option<LogMessage> {
        self.lock().last_log_message.clone()
    }

    pub fn take(&self) -> (Option<Summary>, Option<LogMessage>) {
        let mut state = self.lock();
        (state.summary.take(), state.last_log_message.take())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OutcomeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierStats {
    pub summaries: u64,
    pub messages: u64,
    pub noise: u64,
}

/// Routes the lines of one output stream. One instance per stream keeps
/// delivery in read order.
pub struct StreamClassifier {
    task_id: Option<String>,
    events: UiEvents,
    outcome: Arc<RunOutcome>,
    run_log: Option<RunLog>,
    stats: ClassifierStats,
}

impl StreamClassifier {
    pub fn new(
        task_id: Option<String>,
        events: UiEvents,
        outcome: Arc<RunOutcome>,
        run_log: Option<RunLog>,
    ) -> Self {
        Self {
            task_id,
            events,
            outcome,
            run_log,
            stats: ClassifierStats::default(),
        }
    }

    /// Classifier for output that arrives while no task is running.
    pub fn detached(events: UiEvents) -> Self {
        Self::new(None, events, RunOutcome::new(), None)
    }

    pub fn stats(&self) -> ClassifierStats {
        self.stats
    }

    pub fn process_line(&mut self, raw: &str) {
        let line = sanitize_line(raw);
        if line.is_empty() {
            return;
        }

        // Summaries are operational metadata and stay out of the run log.
        if let Some(summary) = decode_summary(&line) {
            self.stats.summaries += 1;
            self.outcome.set_summary(summary);
            return;
        }

        self.write_run_log(&line);

        match serde_json::from_str::<LogMessage>(&line) {
            Ok(message) => {
                self.stats.messages += 1;
                self.events.log_message(self.task_id.as_deref(), &message);
                self.outcome.record_log_message(message);
            }
            Err(error) => {
                self.stats.noise += 1;
                tracing::debug!(error = %error, line = %line, "skipping unparsable worker output");
            }
        }
    }

    pub fn finish(&mut self) {
        if let Some(run_log) = self.run_log.as_mut() {
            if let Err(error) = run_log.flush() {
                tracing::warn!(error = %error, path = %run_log.path().display(), "failed to flush run log");
            }
        }
    }

    fn write_run_log(&mut self, line: &str) {
        let Some(run_log) = self.run_log.as_mut() else {
            return;
        };
        if let Err(error) = run_log.write_line(line) {
            tracing::error!(error = %error, path = %run_log.path().display(), "failed to write run log; disabling it");
            self.run_log = None;
        }
    }
}
