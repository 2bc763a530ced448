//! Serialized access to the child's stdin

use crate::error::{ChannelError, Result};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

type BoxedWriter = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Shared handle to the child's stdin.
///
/// Every write goes through one mutex and is flushed before the lock is
/// released, so two concurrent senders can never interleave bytes within a
/// line. Clones share the same underlying pipe.
#[derive(Clone, Default)]
pub struct StdinWriter {
    inner: Arc<Mutex<Option<BoxedWriter>>>,
}

impl StdinWriter {
    /// A writer with no pipe attached yet; writes fail with
    /// [`ChannelError::NotStarted`] until the process is started.
    pub fn detached() -> Self {
        Self::default()
    }

    /// A writer already bound to `writer`
    pub fn attached<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        Self {
            inner: Arc::new(Mutex::new(Some(BufWriter::new(writer)))),
        }
    }

    pub(crate) async fn attach<W>(&self, writer: W)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        *self.inner.lock().await = Some(BufWriter::new(writer));
    }

    /// Whether a pipe is attached
    pub async fn is_attached(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Write one complete line and flush it.
    ///
    /// `line` must already carry its terminating newline.
    pub async fn write_line(&self, line: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let writer = guard.as_mut().ok_or(ChannelError::NotStarted)?;

        writer.write_all(line).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Close the pipe so the child sees end-of-file on its stdin
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(mut writer) = self.inner.lock().await.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for StdinWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdinWriter").finish_non_exhaustive()
    }
}
