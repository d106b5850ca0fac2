//! The stream runner: one thread, one session, one pair of streams.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};

use iot_stream_core::{RunnerConfig, Session, SessionClaim, SessionError, SharedSession};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::{
    completion::{Completion, StopReason},
    event_loop::{EventLoop, panic_message},
    state::{RunnerState, Status},
    stop::StopSignal,
    streams::{StreamPair, Tee},
};

/// Runner identifier, used in thread names and log spans.
pub type RunnerId = Uuid;

/// Runner error.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Runner already started")]
    AlreadyStarted,
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Failed to spawn runner thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// State shared between the owner's handle and the runner thread.
struct Control {
    status: Status,
    stop: StopSignal,
    completion: Completion,
}

impl Control {
    fn finish(&self, reason: StopReason) {
        self.status.set(RunnerState::Stopped);
        self.completion.fire(reason);
    }
}

/// Everything the thread takes ownership of on start.
struct Launch<S> {
    claim: SessionClaim<S>,
    streams: StreamPair,
}

/// Drives a [`Session`] over an input stream and an output stream on a
/// dedicated thread.
///
/// Construction does no I/O. [`StreamRunner::start`] spawns the thread;
/// [`StreamRunner::cancel_and_disconnect`] stops it from anywhere; the
/// callback given to [`StreamRunner::on_stop`] runs exactly once after the
/// streams are closed.
///
/// Dropping the handle does not stop a started runner.
pub struct StreamRunner<S: Session> {
    id: RunnerId,
    config: RunnerConfig,
    launch: Mutex<Option<Launch<S>>>,
    control: Arc<Control>,
}

impl<S: Session> StreamRunner<S> {
    /// Bind a session to an input and an output stream.
    ///
    /// # Errors
    /// Returns error if another runner is driving the session.
    pub fn new(
        session: &SharedSession<S>,
        input: impl AsyncRead + Send + Unpin + 'static,
        output: impl AsyncWrite + Send + Unpin + 'static,
        config: RunnerConfig,
    ) -> Result<Self, RunnerError> {
        Self::with_tee(session, input, output, Tee::None, config)
    }

    /// Bind a session to an input, an output, and a tee that receives a copy
    /// of everything written to the output.
    ///
    /// # Errors
    /// Returns error if another runner is driving the session.
    pub fn with_tee(
        session: &SharedSession<S>,
        input: impl AsyncRead + Send + Unpin + 'static,
        output: impl AsyncWrite + Send + Unpin + 'static,
        tee: Tee,
        config: RunnerConfig,
    ) -> Result<Self, RunnerError> {
        let claim = session.claim()?;
        let streams = StreamPair::new(Box::new(input), Box::new(output), tee);

        Ok(Self {
            id: Uuid::new_v4(),
            config,
            launch: Mutex::new(Some(Launch { claim, streams })),
            control: Arc::new(Control {
                status: Status::new(),
                stop: StopSignal::new(),
                completion: Completion::new(),
            }),
        })
    }

    /// Identifier used in the thread name and log span.
    #[must_use]
    pub const fn id(&self) -> RunnerId {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunnerState {
        self.control.status.get()
    }

    /// How the run ended, once it has.
    #[must_use]
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.control.completion.reason()
    }

    /// Spawn the runner thread.
    ///
    /// A stop requested before this call takes effect as soon as the loop starts.
    ///
    /// # Errors
    /// Returns error if already started, or if the thread cannot be spawned.
    /// On spawn failure the streams are dropped and the stop callback still fires.
    pub fn start(&self) -> Result<(), RunnerError> {
        let Launch { claim, streams } = self
            .launch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(RunnerError::AlreadyStarted)?;

        self.control
            .status
            .transition(RunnerState::Idle, RunnerState::Running);
        if let Some(request) = self.control.stop.requested() {
            self.control
                .status
                .transition(RunnerState::Running, RunnerState::Stopping);
            tracing::debug!(runner = %self.id, ?request, "Starting with a stop already requested");
        }

        let event_loop = EventLoop::new(
            claim,
            streams,
            self.control.stop.subscribe(),
            self.config.clone(),
        );
        let control = Arc::clone(&self.control);
        let id = self.id;
        let name = format!("{}-{}", self.config.thread_name_prefix, id.simple());

        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || drive(id, event_loop, &control));

        if let Err(e) = spawned {
            tracing::error!(runner = %self.id, "Failed to spawn runner thread: {e}");
            self.control.finish(StopReason::Runtime(e.to_string()));
            return Err(RunnerError::Spawn(e));
        }
        tracing::info!(runner = %self.id, "Runner started");
        Ok(())
    }

    /// Ask the runner to stop without waiting for it.
    ///
    /// With `should_disconnect`, a connected session gets to send its
    /// disconnect frame (bounded by the configured deadline) before the
    /// streams close. Only the first request counts; later calls, from any
    /// thread and with either flag, are no-ops.
    pub fn cancel_and_disconnect(&self, should_disconnect: bool) {
        if self.control.status.get() == RunnerState::Stopped {
            tracing::debug!(runner = %self.id, "Runner already stopped");
            return;
        }
        if self.control.stop.post(should_disconnect) {
            self.control
                .status
                .transition(RunnerState::Running, RunnerState::Stopping);
            tracing::info!(runner = %self.id, should_disconnect, "Stop requested");
        } else {
            tracing::debug!(runner = %self.id, "Stop already requested");
        }
    }

    /// Set the callback run once the runner has fully stopped.
    ///
    /// If the runner already stopped, `f` runs immediately on this thread.
    /// Setting it again before the runner stops replaces the earlier one.
    pub fn on_stop(&self, f: impl FnOnce(&StopReason) + Send + 'static) {
        self.control.completion.register(Box::new(f));
    }

    /// Block until the runner has stopped and its callback has returned.
    ///
    /// Returns `false` on timeout. Never call this from the stop callback.
    #[must_use]
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        self.control.completion.wait(timeout)
    }
}

fn drive<S: Session>(id: RunnerId, event_loop: EventLoop<S>, control: &Control) {
    let span = tracing::info_span!("stream_runner", runner = %id);
    let _enter = span.enter();

    let reason = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => {
            let run = catch_unwind(AssertUnwindSafe(|| {
                runtime.block_on(event_loop.run(&control.status))
            }));
            run.unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                tracing::error!("Runner panicked: {message}");
                StopReason::Runtime(format!("runner panicked: {message}"))
            })
        }
        Err(e) => {
            tracing::error!("Failed to build runtime: {e}");
            drop(event_loop);
            StopReason::Runtime(e.to_string())
        }
    };

    tracing::info!(?reason, "Runner stopped");
    control.finish(reason);
}
