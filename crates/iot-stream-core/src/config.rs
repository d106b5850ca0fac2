//! Stream runner configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_READ_CHUNK_SIZE: usize = 4096;
const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 1000;
const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 500;
const DEFAULT_THREAD_NAME_PREFIX: &str = "iot-stream";

/// Tunables for a stream runner.
///
/// Every field has a default, so a partial document deserializes cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Maximum number of bytes pulled from the input stream per read.
    pub read_chunk_size: usize,
    /// Deadline for writing the disconnect frame on a graceful stop.
    pub disconnect_timeout_ms: u64,
    /// Deadline for shutting down each output stream during teardown.
    pub close_timeout_ms: u64,
    /// Prefix for the runner's OS thread name.
    pub thread_name_prefix: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            disconnect_timeout_ms: DEFAULT_DISCONNECT_TIMEOUT_MS,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
        }
    }
}

impl RunnerConfig {
    /// Set the read chunk size.
    #[must_use]
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    /// Set the graceful disconnect deadline.
    #[must_use]
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the per-stream close deadline.
    #[must_use]
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Read chunk size, never zero.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.read_chunk_size.max(1)
    }

    /// Deadline for the graceful disconnect write.
    #[must_use]
    pub const fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    /// Deadline for shutting down each output stream.
    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}
