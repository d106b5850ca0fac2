//! Runner lifecycle state.

use std::sync::atomic::{AtomicU8, Ordering};

/// Where a runner is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunnerState {
    /// Constructed, not started.
    Idle = 0,
    /// Event loop is pumping bytes.
    Running = 1,
    /// A stop was requested or the transport closed; teardown in progress.
    Stopping = 2,
    /// Streams are closed and completion has fired.
    Stopped = 3,
}

impl RunnerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Atomic holder for [`RunnerState`].
pub(crate) struct Status(AtomicU8);

impl Status {
    pub(crate) const fn new() -> Self {
        Self(AtomicU8::new(RunnerState::Idle as u8))
    }

    pub(crate) fn get(&self) -> RunnerState {
        RunnerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: RunnerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move `from` -> `to`. Returns `false` if the state was not `from`.
    pub(crate) fn transition(&self, from: RunnerState, to: RunnerState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
