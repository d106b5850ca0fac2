//! Cross-thread stop requests.

use tokio::sync::watch;

/// A request to end the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopRequest {
    /// Send the protocol disconnect frame before closing the streams.
    pub disconnect: bool,
}

/// Write side of the stop channel.
///
/// The first posted request wins. Later requests, whatever their disconnect
/// preference, are ignored.
pub(crate) struct StopSignal {
    tx: watch::Sender<Option<StopRequest>>,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Post a request. Returns `true` if this call was the one that took effect.
    pub(crate) fn post(&self, disconnect: bool) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(StopRequest { disconnect });
            true
        })
    }

    /// The request that took effect, if any.
    pub(crate) fn requested(&self) -> Option<StopRequest> {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<StopRequest>> {
        self.tx.subscribe()
    }
}
