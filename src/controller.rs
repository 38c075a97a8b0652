use crate::errors::{AppError, AppResult};
use crate::events::{UiEvents, EVENT_TASK_STARTED, EVENT_TASK_STOPPED, EVENT_WRITE_SUMMARY_TO_LOG};
use crate::harness::classifier::{RunOutcome, StreamClassifier};
use crate::harness::exit_hook::ExitHook;
use crate::models::{
    ExecOutput, LogLevel, StartTaskPayload, StartTaskResponse, TaskExit, TaskPhase,
};
use crate::notify::{end_of_task_notification, Notifier};
use crate::retention::LogRetention;
use crate::transport::{TaskLaunch, TransportManager};
use chrono::{DateTime, Local};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::time::Duration;
use uuid::Uuid;

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

struct ActiveTask {
    id: String,
    args: Vec<String>,
    notify_on_end: bool,
    previous_level: Option<LogLevel>,
    started_at: DateTime<Local>,
    outcome: Arc<RunOutcome>,
    exit: Arc<ExitHook>,
}

struct ControllerState {
    phase: TaskPhase,
    task: Option<ActiveTask>,
    // Exit observed before the transport confirmed the start.
    deferred_exit: Option<TaskExit>,
}

/// The part of the controller the exit hook needs after the caller is gone.
struct TaskLedger {
    state: StdMutex<ControllerState>,
    events: UiEvents,
    notifier: Arc<dyn Notifier>,
}

impl TaskLedger {
    fn lock(&self) -> std::sync::MutexGuard<'_, ControllerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Terminal transition. Runs at most once per task; unknown ids are
    /// ignored.
    fn finish_task(&self, task_id: &str, exit: &TaskExit) {
        let task = {
            let mut state = self.lock();
            if state.task.as_ref().map(|task| task.id.as_str()) != Some(task_id) {
                return;
            }
            if state.phase == TaskPhase::Starting {
                state.deferred_exit = Some(exit.clone());
                return;
            }
            state.phase = TaskPhase::Idle;
            state.deferred_exit = None;
            state.task.take()
        };
        let Some(task) = task else {
            return;
        };

        if let Some(previous) = task.previous_level {
            self.events.filter().set(previous);
        }
        let (summary, last_log_message) = task.outcome.take();
        let elapsed_ms = (Local::now() - task.started_at).num_milliseconds();
        tracing::info!(task_id = %task.id, exit = ?exit, elapsed_ms, "task finished");

        if let Some(summary) = summary.as_ref() {
            match serde_json::to_value(summary) {
                Ok(payload) => self.events.emit(Some(&task.id), EVENT_WRITE_SUMMARY_TO_LOG, payload),
                Err(error) => tracing::warn!(error = %error, "failed to encode task summary"),
            }
        }
        self.events.emit(
            Some(&task.id),
            EVENT_TASK_STOPPED,
            json!({
                "taskId": task.id,
                "args": task.args,
                "reason": exit_reason(exit),
                "exitCode": exit_code(exit),
            }),
        );

        if task.notify_on_end {
            let (title, body) = end_of_task_notification(last_log_message.as_ref(), summary.as_ref());
            self.notifier.send(title, &body);
        }
    }
}

fn exit_reason(exit: &TaskExit) -> String {
    match exit {
        TaskExit::Exited { .. } => "exited".to_string(),
        TaskExit::Stopped => "stopped".to_string(),
        TaskExit::Completed => "completed".to_string(),
        TaskExit::ConnectionLost(reason) => format!("connection lost: {}", reason),
    }
}

fn exit_code(exit: &TaskExit) -> Option<i32> {
    match exit {
        TaskExit::Exited { code } => *code,
        _ => None,
    }
}

/// Single-task state machine: Idle, Starting, Running, Stopping.
pub struct TaskController {
    transports: Arc<TransportManager>,
    retention: Arc<LogRetention>,
    ledger: Arc<TaskLedger>,
    blocked: AtomicBool,
    stop_grace: Duration,
}

impl TaskController {
    pub fn new(
        transports: Arc<TransportManager>,
        retention: Arc<LogRetention>,
        events: UiEvents,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            transports,
            retention,
            ledger: Arc::new(TaskLedger {
                state: StdMutex::new(ControllerState {
                    phase: TaskPhase::Idle,
                    task: None,
                    deferred_exit: None,
                }),
                events,
                notifier,
            }),
            blocked: AtomicBool::new(false),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_stop_grace(mut self, stop_grace: Duration) -> Self {
        self.stop_grace = stop_grace;
        self
    }

    pub fn phase(&self) -> TaskPhase {
        self.ledger.lock().phase
    }

    pub fn current_task_id(&self) -> Option<String> {
        self.ledger.lock().task.as_ref().map(|task| task.id.clone())
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    pub async fn start_task(&self, payload: StartTaskPayload) -> AppResult<StartTaskResponse> {
        let StartTaskPayload {
            args,
            notify_on_end,
            log_level,
        } = payload;

        {
            let mut state = self.ledger.lock();
            if state.phase != TaskPhase::Idle {
                let running = state.task.as_ref().map(|task| task.id.clone()).unwrap_or_default();
                return Err(AppError::AlreadyRunning(format!(
                    "task {} is {:?}; stop it before starting another",
                    running, state.phase
                )));
            }
            state.phase = TaskPhase::Starting;
        }

        let transport = match self.transports.active().await {
            Ok(transport) => transport,
            Err(error) => {
                self.ledger.lock().phase = TaskPhase::Idle;
                return Err(error);
            }
        };

        let task_id = Uuid::new_v4().to_string();
        let previous_level = log_level.map(|level| self.ledger.events.filter().replace(level));
        let started_at = Local::now();
        let run_log = match self.retention.open_run_log(&args, started_at) {
            Ok(run_log) => Some(run_log),
            Err(error) => {
                tracing::warn!(error = %error, "continuing without a run log");
                None
            }
        };
        let outcome = RunOutcome::new();
        let classifier = StreamClassifier::new(
            Some(task_id.clone()),
            self.ledger.events.clone(),
            outcome.clone(),
            run_log,
        );
        let exit = ExitHook::new();

        self.ledger.lock().task = Some(ActiveTask {
            id: task_id.clone(),
            args: args.clone(),
            notify_on_end,
            previous_level,
            started_at,
            outcome,
            exit: exit.clone(),
        });
        let ledger = self.ledger.clone();
        let finished_id = task_id.clone();
        exit.on_exit(move |exit| ledger.finish_task(&finished_id, exit));

        let launch = TaskLaunch {
            task_id: task_id.clone(),
            args: args.clone(),
            classifier,
            exit,
        };
        if let Err(error) = transport.start(launch).await {
            {
                let mut state = self.ledger.lock();
                if state.task.as_ref().map(|task| task.id.as_str()) == Some(task_id.as_str()) {
                    state.task = None;
                    state.deferred_exit = None;
                    state.phase = TaskPhase::Idle;
                }
            }
            if let Some(previous) = previous_level {
                self.ledger.events.filter().set(previous);
            }
            tracing::error!(task_id = %task_id, error = %error, "task failed to start");
            return Err(error);
        }

        let (running, deferred) = {
            let mut state = self.ledger.lock();
            if state.task.as_ref().map(|task| task.id.as_str()) == Some(task_id.as_str()) {
                if state.phase == TaskPhase::Starting {
                    state.phase = TaskPhase::Running;
                }
                (true, state.deferred_exit.take())
            } else {
                (false, None)
            }
        };
        if running {
            self.ledger.events.emit(
                Some(&task_id),
                EVENT_TASK_STARTED,
                json!({ "taskId": task_id, "args": args, "transport": transport.kind().as_str() }),
            );
        }
        if let Some(exit) = deferred {
            self.ledger.finish_task(&task_id, &exit);
        }
        Ok(StartTaskResponse { task_id })
    }

    /// Best-effort stop: signal the transport, wait the grace period, then
    /// end the task whether or not the worker has gone.
    pub async fn stop_task(&self, reason: Option<String>) -> AppResult<()> {
        let target = {
            let mut state = self.ledger.lock();
            if state.phase == TaskPhase::Idle {
                None
            } else {
                state.phase = TaskPhase::Stopping;
                state.task.as_mut().map(|task| {
                    task.notify_on_end = false;
                    (task.id.clone(), task.exit.clone())
                })
            }
        };
        let Some((task_id, exit)) = target else {
            return Ok(());
        };

        let text = reason.unwrap_or_else(|| "Stopping".to_string());
        tracing::warn!(task_id = %task_id, reason = %text, "stopping task");
        self.ledger.events.note(Some(&task_id), LogLevel::Warning, text);

        match self.transports.active().await {
            Ok(transport) => {
                if let Err(error) = transport.stop().await {
                    tracing::warn!(task_id = %task_id, error = %error, "transport failed to stop task");
                }
            }
            Err(error) => tracing::warn!(task_id = %task_id, error = %error, "no transport to stop task on"),
        }

        tokio::time::sleep(self.stop_grace).await;
        exit.fire(TaskExit::Stopped);
        Ok(())
    }

    /// Runs a fire-and-wait command. Never touches task state.
    pub async fn exec(&self, args: Vec<String>) -> AppResult<ExecOutput> {
        let transport = self.transports.active().await?;
        transport.exec(&args).await
    }

    pub async fn is_task_running(&self) -> bool {
        if self.blocked.load(Ordering::SeqCst) {
            return true;
        }
        match self.transports.active().await {
            Ok(transport) => transport.is_active().await,
            Err(_) => false,
        }
    }
}
