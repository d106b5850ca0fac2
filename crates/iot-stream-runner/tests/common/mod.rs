//! Shared test doubles for runner integration tests.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::{Arc, Mutex, Once},
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use bytes::Bytes;
use iot_stream_runner::{CloseReason, Session, SessionError};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// MQTT DISCONNECT packet.
pub const DISCONNECT: &[u8] = &[0xE0, 0x00];

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Poll `cond` until it holds or the timeout expires.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Encode a length-prefixed frame.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = vec![u8::try_from(payload.len()).unwrap()];
    out.extend_from_slice(payload);
    out
}

/// Payload that makes [`FrameSession`] panic while decoding.
pub const BOOM: &[u8] = b"BOOM";

/// Session that reassembles `[len][payload]` frames.
///
/// A `PING` frame queues a `PONG` reply. A zero-length frame is a protocol
/// violation. A `BOOM` frame panics.
pub struct FrameSession {
    buffer: Vec<u8>,
    pub frames: Vec<Vec<u8>>,
    pub decode_calls: usize,
    pub outbound: VecDeque<Bytes>,
    pub connected: bool,
    pub closed: Vec<CloseReason>,
}

impl FrameSession {
    pub fn connected() -> Self {
        Self {
            buffer: Vec::new(),
            frames: Vec::new(),
            decode_calls: 0,
            outbound: VecDeque::new(),
            connected: true,
            closed: Vec::new(),
        }
    }

    pub fn publish(&mut self, payload: &[u8]) {
        self.outbound.push_back(Bytes::from(frame(payload)));
    }
}

impl Session for FrameSession {
    fn decode(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        self.decode_calls += 1;
        self.buffer.extend_from_slice(bytes);

        while let Some(&len) = self.buffer.first() {
            if len == 0 {
                return Err(SessionError::Protocol("zero-length frame".into()));
            }
            let len = usize::from(len);
            if self.buffer.len() < len + 1 {
                break;
            }
            let payload: Vec<u8> = self.buffer.drain(..=len).skip(1).collect();
            assert!(payload != BOOM, "decoder exploded");
            if payload == b"PING" {
                self.publish(b"PONG");
            }
            self.frames.push(payload);
        }
        Ok(())
    }

    fn next_outbound(&mut self) -> Option<Bytes> {
        self.outbound.pop_front()
    }

    fn on_transport_closed(&mut self, reason: &CloseReason) {
        self.connected = false;
        self.closed.push(reason.clone());
    }

    fn disconnect_frame(&mut self) -> Option<Bytes> {
        self.connected = false;
        Some(Bytes::from_static(DISCONNECT))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Something that happened to a recording writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Write(&'static str, Vec<u8>),
    /// A write was refused with `Pending`.
    Blocked(&'static str),
    Close(&'static str),
}

/// Event log shared by every writer in a test.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Event>>>);

impl Journal {
    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn bytes(&self, stream: &str) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Write(name, bytes) if name == stream => Some(bytes),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn write_calls(&self, stream: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Write(name, _) if *name == stream))
            .count()
    }

    pub fn blocked(&self, stream: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Blocked(name) if *name == stream))
            .count()
    }

    pub fn closes(&self, stream: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Close(name) if *name == stream))
            .count()
    }

    fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }
}

/// Holds a writer shut until the test opens it.
#[derive(Debug, Clone, Default)]
pub struct Gate(Arc<Mutex<(bool, Option<Waker>)>>);

impl Gate {
    pub fn open(&self) {
        let mut gate = self.0.lock().unwrap();
        gate.0 = true;
        if let Some(waker) = gate.1.take() {
            waker.wake();
        }
    }

    fn is_open(&self, cx: &Context<'_>) -> bool {
        let mut gate = self.0.lock().unwrap();
        if !gate.0 {
            gate.1 = Some(cx.waker().clone());
        }
        gate.0
    }
}

/// How a recording writer reacts to writes.
#[derive(Debug, Clone)]
pub enum WriteMode {
    /// Accept everything.
    Accept,
    /// Accept at most this many bytes per call.
    Partial(usize),
    /// Fail every write.
    Fail,
    /// Never become writable.
    Stall,
    /// Accept writes, but never finish a flush.
    FlushStall,
    /// Accept at most `chunk` bytes once, then nothing until the gate opens.
    Gated { chunk: usize, gate: Gate },
}

pub struct RecordingWriter {
    name: &'static str,
    journal: Journal,
    mode: WriteMode,
    writes: usize,
}

impl RecordingWriter {
    pub fn new(name: &'static str, journal: &Journal, mode: WriteMode) -> Self {
        Self {
            name,
            journal: journal.clone(),
            mode,
            writes: 0,
        }
    }
}

impl AsyncWrite for RecordingWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = match &this.mode {
            WriteMode::Accept | WriteMode::FlushStall => buf.len(),
            WriteMode::Partial(max) => buf.len().min(*max),
            WriteMode::Fail => {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")));
            }
            WriteMode::Stall => {
                this.journal.push(Event::Blocked(this.name));
                return Poll::Pending;
            }
            WriteMode::Gated { chunk, gate } => {
                if this.writes > 0 && !gate.is_open(cx) {
                    this.journal.push(Event::Blocked(this.name));
                    return Poll::Pending;
                }
                buf.len().min(*chunk)
            }
        };
        this.writes += 1;
        this.journal.push(Event::Write(this.name, buf[..n].to_vec()));
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if matches!(self.mode, WriteMode::FlushStall) {
            return Poll::Pending;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.journal.push(Event::Close(self.name));
        Poll::Ready(Ok(()))
    }
}

/// Input stream fed chunk by chunk from the test thread.
///
/// Dropping the feeder is end-of-stream.
pub struct ChunkReader {
    rx: mpsc::UnboundedReceiver<io::Result<Vec<u8>>>,
    current: Vec<u8>,
}

pub type Feeder = mpsc::UnboundedSender<io::Result<Vec<u8>>>;

pub fn chunk_reader() -> (Feeder, ChunkReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        tx,
        ChunkReader {
            rx,
            current: Vec::new(),
        },
    )
}

impl AsyncRead for ChunkReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        while self.current.is_empty() {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.current = chunk,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = self.current.len().min(buf.remaining());
        buf.put_slice(&self.current[..n]);
        self.current.drain(..n);
        Poll::Ready(Ok(()))
    }
}

/// Input stream whose first read panics.
pub struct PanickingReader;

impl AsyncRead for PanickingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        panic!("reader exploded");
    }
}
