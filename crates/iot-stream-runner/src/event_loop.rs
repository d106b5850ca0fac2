//! The pump between the streams and the session.

use std::{
    any::Any,
    io,
    panic::{AssertUnwindSafe, catch_unwind},
};

use bytes::BytesMut;
use iot_stream_core::{CloseReason, RunnerConfig, Session, SessionClaim, SessionError};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::watch,
};

use crate::{
    completion::StopReason,
    state::{RunnerState, Status},
    stop::StopRequest,
    streams::{BoxedWriter, StreamPair},
};

/// Why the pump returned.
enum Exit {
    Stop(StopRequest),
    Closed(CloseReason),
}

pub(crate) struct EventLoop<S: Session> {
    claim: SessionClaim<S>,
    streams: StreamPair,
    stop_rx: watch::Receiver<Option<StopRequest>>,
    config: RunnerConfig,
    /// Bytes taken from the session and not yet accepted by the primary stream.
    pending: BytesMut,
    /// Bytes were accepted by the primary stream since its last flush.
    unflushed: bool,
}

impl<S: Session> EventLoop<S> {
    pub(crate) fn new(
        claim: SessionClaim<S>,
        streams: StreamPair,
        stop_rx: watch::Receiver<Option<StopRequest>>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            claim,
            streams,
            stop_rx,
            config,
            pending: BytesMut::new(),
            unflushed: false,
        }
    }

    /// Pump until stopped or closed, then tear down. The session claim is
    /// released before this returns.
    pub(crate) async fn run(mut self, status: &Status) -> StopReason {
        tracing::debug!("Event loop started");
        let exit = self.pump().await;
        status.set(RunnerState::Stopping);

        let reason = match exit {
            Exit::Stop(request) => {
                let disconnect_sent = request.disconnect && self.disconnect().await;
                tracing::info!(disconnect_sent, "Runner cancelled");
                StopReason::Cancelled { disconnect_sent }
            }
            Exit::Closed(close) => {
                tracing::warn!(reason = ?close, "Transport closed unexpectedly");
                if let Err(e) = with_session(&self.claim, |s| s.on_transport_closed(&close)) {
                    tracing::error!("Cannot notify session of closure: {e}");
                }
                StopReason::TransportClosed(close)
            }
        };

        let close_timeout = self.config.close_timeout();
        let Self { claim, streams, .. } = self;
        streams.close(close_timeout).await;
        drop(claim);
        reason
    }

    async fn pump(&mut self) -> Exit {
        if let Some(request) = *self.stop_rx.borrow_and_update() {
            return Exit::Stop(request);
        }

        let mut buf = vec![0u8; self.config.chunk_size()];
        loop {
            if let Err(e) = self.drain_outbound() {
                return Exit::Closed(CloseReason::Protocol(e.to_string()));
            }

            tokio::select! {
                biased;

                changed = self.stop_rx.changed() => {
                    let request = match changed {
                        Ok(()) => *self.stop_rx.borrow_and_update(),
                        // Sender gone: nobody can ask for a graceful stop any more.
                        Err(_) => Some(StopRequest { disconnect: false }),
                    };
                    if let Some(request) = request {
                        return Exit::Stop(request);
                    }
                }

                // Flushing shares this branch so a stream that never drains
                // cannot hide a stop request.
                written = send(&mut self.streams.output, &self.pending), if self.unflushed || !self.pending.is_empty() => {
                    match written {
                        Ok(0) if self.pending.is_empty() => self.unflushed = false,
                        Ok(0) => return Exit::Closed(CloseReason::WriteFailed("stream accepted no bytes".into())),
                        Ok(n) => {
                            let sent = self.pending.split_to(n).freeze();
                            self.unflushed = true;
                            tracing::trace!(bytes = n, remaining = self.pending.len(), "Wrote outbound bytes");
                            self.streams.copy_to_tee(&sent, self.config.close_timeout()).await;
                        }
                        Err(e) => return Exit::Closed(CloseReason::WriteFailed(e.to_string())),
                    }
                }

                read = self.streams.input.read(&mut buf) => {
                    match read {
                        Ok(0) => return Exit::Closed(CloseReason::EndOfStream),
                        Ok(n) => {
                            tracing::trace!(bytes = n, "Read inbound bytes");
                            if let Err(e) = self.decode(&buf[..n]) {
                                return Exit::Closed(CloseReason::Protocol(e.to_string()));
                            }
                        }
                        Err(e) => return Exit::Closed(CloseReason::ReadFailed(e.to_string())),
                    }
                }

                () = self.claim.outbound_ready() => {}
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<(), SessionError> {
        with_session(&self.claim, |s| s.decode(bytes))?
    }

    fn drain_outbound(&mut self) -> Result<(), SessionError> {
        let pending = &mut self.pending;
        with_session(&self.claim, |s| {
            while let Some(chunk) = s.next_outbound() {
                pending.extend_from_slice(&chunk);
            }
        })
    }

    /// Finish any half-written output, then write the disconnect frame, all
    /// under one deadline. Returns whether the frame went out.
    async fn disconnect(&mut self) -> bool {
        let frame = match with_session(&self.claim, |s| {
            if s.is_connected() {
                s.disconnect_frame()
            } else {
                None
            }
        }) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Cannot build disconnect frame: {e}");
                None
            }
        };
        let Some(frame) = frame else {
            tracing::debug!("Session not connected; skipping disconnect frame");
            return false;
        };

        let mut outbound = self.pending.split();
        outbound.extend_from_slice(&frame);
        let outbound = outbound.freeze();

        let output = &mut self.streams.output;
        let result = tokio::time::timeout(self.config.disconnect_timeout(), async {
            output.write_all(&outbound).await?;
            output.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => {
                tracing::debug!(bytes = outbound.len(), "Disconnect frame written");
                self.streams
                    .copy_to_tee(&outbound, self.config.close_timeout())
                    .await;
                true
            }
            Ok(Err(e)) => {
                tracing::warn!("Disconnect write failed: {e}");
                false
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.disconnect_timeout_ms,
                    "Disconnect write timed out"
                );
                false
            }
        }
    }
}

/// Write a prefix of `pending`, or flush once nothing is left to write.
///
/// Returns the number of bytes written, zero for a flush. Cancel-safe.
async fn send(output: &mut BoxedWriter, pending: &[u8]) -> io::Result<usize> {
    if pending.is_empty() {
        output.flush().await.map(|()| 0)
    } else {
        output.write(pending).await
    }
}

/// Run `f` against the claimed session, turning a panic into an error so the
/// runner can still tear down.
fn with_session<S: Session, R>(
    claim: &SessionClaim<S>,
    f: impl FnOnce(&mut S) -> R,
) -> Result<R, SessionError> {
    let mut session = claim.session().lock()?;
    catch_unwind(AssertUnwindSafe(|| f(&mut session)))
        .map_err(|payload| SessionError::Panicked(panic_message(payload.as_ref())))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
