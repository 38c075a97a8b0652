use crate::models::TaskExit;
use std::sync::{Arc, Mutex as StdMutex};

type ExitCallback = Box<dyn FnOnce(&TaskExit) + Send>;

#[derive(Default)]
struct HookState {
    fired: Option<TaskExit>,
    callbacks: Vec<ExitCallback>,
}

/// One-shot end-of-run signal shared by everything that can observe a run
/// ending: the exit waiter, a liveness poll, an explicit stop.
///
/// Whichever path fires first wins; later fires are no-ops. Callbacks run
/// last-registered first, outside the internal lock.
#[derive(Default)]
pub struct ExitHook {
    state: StdMutex<HookState>,
}

impl ExitHook {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_exit(&self, callback: impl FnOnce(&TaskExit) + Send + 'static) {
        let already = {
            let mut state = self.lock();
            match state.fired.clone() {
                Some(exit) => Some(exit),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        if let Some(exit) = already {
            callback(&exit);
        }
    }

    /// Returns true when this call was the one that ended the run.
    pub fn fire(&self, exit: TaskExit) -> bool {
        let callbacks = {
            let mut state = self.lock();
            if state.fired.is_some() {
                return false;
            }
            state.fired = Some(exit.clone());
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks.into_iter().rev() {
            callback(&exit);
        }
        true
    }

    pub fn has_fired(&self) -> bool {
        self.lock().fired.is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HookState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
