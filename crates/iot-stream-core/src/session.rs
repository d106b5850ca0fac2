//! Protocol session contract and the shared session handle.

use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{Notify, futures::Notified};

/// Why the transport under a session went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The input stream reported end-of-stream.
    EndOfStream,
    /// Reading the input stream failed.
    ReadFailed(String),
    /// Writing the primary output stream failed.
    WriteFailed(String),
    /// The session rejected inbound bytes.
    Protocol(String),
}

/// Session error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Session is already driven by another runner")]
    AlreadyDriven,
    #[error("Session lock poisoned")]
    Poisoned,
    #[error("Session panicked: {0}")]
    Panicked(String),
}

/// Protocol state machine driven by a stream runner.
///
/// All calls are synchronous and run on the runner's thread. Implementations
/// must not block, or the whole session stalls.
pub trait Session: Send + 'static {
    /// Consume inbound bytes in arrival order.
    ///
    /// Chunks carry no frame boundaries; reassembly is the session's job.
    /// Responses derived from the input are queued and surfaced through
    /// [`Session::next_outbound`].
    ///
    /// # Errors
    /// Returns error on a fatal protocol violation.
    fn decode(&mut self, bytes: &[u8]) -> Result<(), SessionError>;

    /// Next chunk of bytes waiting to be sent, if any.
    fn next_outbound(&mut self) -> Option<Bytes>;

    /// The transport closed without a requested stop.
    fn on_transport_closed(&mut self, reason: &CloseReason);

    /// Encode the protocol "closing" frame.
    ///
    /// Returns `None` when there is nothing to say goodbye to.
    fn disconnect_frame(&mut self) -> Option<Bytes>;

    /// Whether the protocol handshake completed and has not been torn down.
    fn is_connected(&self) -> bool;
}

struct Shared<S> {
    session: Mutex<S>,
    driven: AtomicBool,
    outbound: Notify,
}

/// Handle to a session shared between its owner and the runner driving it.
///
/// The owner keeps a clone to publish through [`SharedSession::update`] and to
/// inspect final state once the runner reports completion.
pub struct SharedSession<S> {
    inner: Arc<Shared<S>>,
}

impl<S> Clone for SharedSession<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Session> SharedSession<S> {
    /// Wrap a session.
    #[must_use]
    pub fn new(session: S) -> Self {
        Self {
            inner: Arc::new(Shared {
                session: Mutex::new(session),
                driven: AtomicBool::new(false),
                outbound: Notify::new(),
            }),
        }
    }

    /// Lock the session.
    ///
    /// # Errors
    /// Returns error if a previous holder panicked.
    pub fn lock(&self) -> Result<MutexGuard<'_, S>, SessionError> {
        self.inner.session.lock().map_err(|_| SessionError::Poisoned)
    }

    /// Mutate the session and wake the runner so queued output gets written.
    ///
    /// # Errors
    /// Returns error if a previous holder panicked.
    pub fn update<R>(&self, f: impl FnOnce(&mut S) -> R) -> Result<R, SessionError> {
        let result = f(&mut *self.lock()?);
        self.inner.outbound.notify_one();
        Ok(result)
    }

    /// Whether a runner currently holds the drive claim.
    #[must_use]
    pub fn is_driven(&self) -> bool {
        self.inner.driven.load(Ordering::Acquire)
    }

    /// Take the exclusive right to drive this session.
    ///
    /// The claim is released when the returned guard is dropped.
    ///
    /// # Errors
    /// Returns error if another claim is live.
    pub fn claim(&self) -> Result<SessionClaim<S>, SessionError> {
        self.inner
            .driven
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                tracing::debug!("Rejected claim on a session that is already driven");
                SessionError::AlreadyDriven
            })?;
        Ok(SessionClaim {
            shared: self.clone(),
        })
    }
}

/// Exclusive drive right over a [`SharedSession`].
pub struct SessionClaim<S> {
    shared: SharedSession<S>,
}

impl<S: Session> SessionClaim<S> {
    /// The claimed session.
    #[must_use]
    pub const fn session(&self) -> &SharedSession<S> {
        &self.shared
    }

    /// Completes once the owner has touched the session through `update`.
    ///
    /// A wakeup posted while nobody is waiting is kept for the next call.
    pub fn outbound_ready(&self) -> Notified<'_> {
        self.shared.inner.outbound.notified()
    }
}

impl<S> Drop for SessionClaim<S> {
    fn drop(&mut self) {
        self.shared.inner.driven.store(false, Ordering::Release);
    }
}
