//! Session contract and configuration for IoT stream runners.
//!
//! Provides:
//! - `Session` - The protocol state machine a runner drives
//! - `SharedSession` - Owner/runner shared handle with single-driver claims
//! - `RunnerConfig` - Tunables for the stream runner

pub mod config;
pub mod session;

pub use config::RunnerConfig;
pub use session::{CloseReason, Session, SessionClaim, SessionError, SharedSession};
