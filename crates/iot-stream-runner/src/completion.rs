//! One-shot completion notification.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use iot_stream_core::CloseReason;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The owner asked the runner to stop.
    Cancelled {
        /// Whether a disconnect frame was fully written before closing.
        disconnect_sent: bool,
    },
    /// The transport or the session ended the run.
    TransportClosed(CloseReason),
    /// The runner could not start its thread or runtime.
    Runtime(String),
}

impl StopReason {
    /// Whether the run ended without being asked to.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        !matches!(self, Self::Cancelled { .. })
    }
}

type Callback = Box<dyn FnOnce(&StopReason) + Send>;

enum Slot {
    Waiting(Option<Callback>),
    Fired(StopReason),
}

struct State {
    slot: Slot,
    /// Set once the callback (if any) has returned.
    done: bool,
}

/// Exactly-once completion slot.
///
/// A callback registered before firing is invoked by the firing thread; one
/// registered afterwards is invoked right away by the registering thread.
pub(crate) struct Completion {
    state: Mutex<State>,
    done: Condvar,
}

impl Completion {
    pub(crate) const fn new() -> Self {
        Self {
            state: Mutex::new(State {
                slot: Slot::Waiting(None),
                done: false,
            }),
            done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the callback, replacing any earlier one that has not fired.
    pub(crate) fn register(&self, callback: Callback) {
        let mut state = self.lock();
        match &mut state.slot {
            Slot::Waiting(current) => {
                *current = Some(callback);
            }
            Slot::Fired(reason) => {
                let reason = reason.clone();
                drop(state);
                invoke(callback, &reason);
            }
        }
    }

    /// Record the outcome and run the callback. Returns `false` if already fired.
    pub(crate) fn fire(&self, reason: StopReason) -> bool {
        let callback = {
            let mut state = self.lock();
            match std::mem::replace(&mut state.slot, Slot::Fired(reason.clone())) {
                Slot::Waiting(callback) => callback,
                Slot::Fired(previous) => {
                    state.slot = Slot::Fired(previous);
                    return false;
                }
            }
        };

        if let Some(callback) = callback {
            invoke(callback, &reason);
        }

        self.lock().done = true;
        self.done.notify_all();
        true
    }

    pub(crate) fn reason(&self) -> Option<StopReason> {
        match &self.lock().slot {
            Slot::Fired(reason) => Some(reason.clone()),
            Slot::Waiting(_) => None,
        }
    }

    /// Block until the callback has run. Returns `false` on timeout.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .done
            .wait_timeout_while(state, timeout, |s| !s.done)
            .unwrap_or_else(PoisonError::into_inner);
        state.done
    }
}

fn invoke(callback: Callback, reason: &StopReason) {
    if catch_unwind(AssertUnwindSafe(|| callback(reason))).is_err() {
        tracing::error!(?reason, "Stop callback panicked");
    }
}
