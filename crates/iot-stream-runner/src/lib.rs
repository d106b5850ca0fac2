//! Dedicated-thread stream runner driving a protocol session.
//!
//! Provides:
//! - `StreamRunner` - Owns a session's byte streams on its own thread
//! - `Tee` - Optional passive copy of outbound bytes
//! - `StopReason` - How a run ended, delivered once through `on_stop`

pub mod completion;
mod event_loop;
pub mod runner;
pub mod state;
pub mod stop;
pub mod streams;

pub use completion::StopReason;
pub use iot_stream_core::{CloseReason, RunnerConfig, Session, SessionError, SharedSession};
pub use runner::{RunnerError, RunnerId, StreamRunner};
pub use state::RunnerState;
pub use stop::StopRequest;
pub use streams::{BoxedReader, BoxedWriter, Tee};
