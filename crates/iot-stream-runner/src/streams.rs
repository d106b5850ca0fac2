//! Byte streams owned by a runner.

use std::{fmt, time::Duration};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Boxed inbound byte stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed outbound byte stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Secondary output that receives a copy of every byte written to the primary.
///
/// Failures on the tee are logged and switch it off; they never affect the
/// primary stream.
#[derive(Default)]
pub enum Tee {
    /// Outbound bytes go to the primary stream only.
    #[default]
    None,
    /// Outbound bytes are copied here after the primary accepts them.
    Stream(BoxedWriter),
}

impl Tee {
    /// Tee into the given writer.
    #[must_use]
    pub fn to(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self::Stream(Box::new(writer))
    }

    /// Build from an optional writer.
    #[must_use]
    pub fn from_option(writer: Option<BoxedWriter>) -> Self {
        writer.map_or(Self::None, Self::Stream)
    }

    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Debug for Tee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("Tee::None"),
            Self::Stream(_) => f.write_str("Tee::Stream(..)"),
        }
    }
}

/// The streams a runner reads from and writes to.
///
/// Consumed by [`StreamPair::close`], so no stream is closed twice.
pub(crate) struct StreamPair {
    pub(crate) input: BoxedReader,
    pub(crate) output: BoxedWriter,
    tee: Tee,
}

impl StreamPair {
    pub(crate) fn new(input: BoxedReader, output: BoxedWriter, tee: Tee) -> Self {
        Self { input, output, tee }
    }

    /// Copy bytes already accepted by the primary stream to the tee.
    pub(crate) async fn copy_to_tee(&mut self, bytes: &[u8], deadline: Duration) {
        let Tee::Stream(writer) = &mut self.tee else {
            return;
        };
        if bytes.is_empty() {
            return;
        }

        let result = tokio::time::timeout(deadline, async {
            writer.write_all(bytes).await?;
            writer.flush().await
        })
        .await;

        let failure = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timed out".to_string(),
        };
        tracing::warn!(error = %failure, "Tee write failed; disabling tee");
        self.tee = Tee::None;
    }

    /// Shut down the outputs and drop the input.
    pub(crate) async fn close(self, deadline: Duration) {
        let Self {
            input,
            mut output,
            tee,
        } = self;

        shutdown("primary", &mut output, deadline).await;
        if let Tee::Stream(mut writer) = tee {
            shutdown("tee", &mut writer, deadline).await;
        }
        drop(input);
        tracing::debug!("Streams closed");
    }
}

async fn shutdown(name: &'static str, writer: &mut BoxedWriter, deadline: Duration) {
    match tokio::time::timeout(deadline, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(stream = name, "Shutdown failed: {e}"),
        Err(_) => tracing::warn!(stream = name, "Shutdown timed out"),
    }
}
