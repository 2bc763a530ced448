//! Line-delimited JSON RPC over a supervised child's stdio
//!
//! Lines the child writes to stdout starting with `!RPC ` are decoded and
//! handed to a [`MessageHandler`]; a reply returned by the handler is written
//! straight back to the child's stdin. Everything else the child prints, on
//! either stream, is reported through [`Diagnostics`].

use super::codec::{self, InboundLine};
use super::process::{ProcessConfig, ProcessSupervisor};
use super::writer::StdinWriter;
use crate::diagnostics::{Diagnostics, OutputSource, TracingDiagnostics};
use crate::error::{ChannelError, Result};
use crate::traits::{LineHandler, MessageHandler, RpcMessage};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// Decodes RPC lines from stdout, dispatches them, and writes replies.
pub struct RpcLineHandler {
    handler: Arc<dyn MessageHandler>,
    stdin: StdinWriter,
    diagnostics: Arc<dyn Diagnostics>,
}

impl RpcLineHandler {
    /// Create a handler replying through `stdin`
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        stdin: StdinWriter,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Self {
        Self {
            handler,
            stdin,
            diagnostics,
        }
    }
}

#[async_trait]
impl LineHandler for RpcLineHandler {
    async fn handle_line(&self, line: &[u8]) -> Result<()> {
        match codec::decode_line(line)? {
            InboundLine::Message(message) => {
                let reply = self
                    .handler
                    .handle_message(message)
                    .await
                    .map_err(ChannelError::Handler)?;

                if let Some(reply) = reply {
                    self.stdin.write_line(&codec::encode_frame(&reply)?).await?;
                }
            }
            InboundLine::Text(text) => self.diagnostics.child_output(OutputSource::Stdout, &text),
        }
        Ok(())
    }
}

/// Forwards every line to diagnostics without looking for RPC traffic.
pub struct DiagnosticLineHandler {
    source: OutputSource,
    diagnostics: Arc<dyn Diagnostics>,
}

impl DiagnosticLineHandler {
    /// Create a forwarder tagging lines with `source`
    pub fn new(source: OutputSource, diagnostics: Arc<dyn Diagnostics>) -> Self {
        Self {
            source,
            diagnostics,
        }
    }
}

#[async_trait]
impl LineHandler for DiagnosticLineHandler {
    async fn handle_line(&self, line: &[u8]) -> Result<()> {
        self.diagnostics
            .child_output(self.source, &codec::decode_text(line));
        Ok(())
    }
}

/// RPC channel to a child process.
///
/// # Example
///
/// ```no_run
/// use childrpc_transport::{ProcessConfig, RpcChannel, RpcMessage};
/// use serde_json::json;
///
/// # async fn example() -> childrpc_transport::Result<()> {
/// let channel = RpcChannel::new(
///     ProcessConfig::new("phantomjs").with_arg("bridge.js"),
///     |message: RpcMessage| async move {
///         println!("child says {message}");
///         Ok(None)
///     },
/// );
///
/// channel.start(true).await?;
/// channel.send_message(&json!({"cmd": "ping"})).await?;
/// channel.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct RpcChannel {
    supervisor: ProcessSupervisor,
}

impl RpcChannel {
    /// Create a channel that reports child output as `tracing` warnings.
    ///
    /// Any line handlers already present in `config` are replaced.
    pub fn new(config: ProcessConfig, handler: impl MessageHandler + 'static) -> Self {
        Self::with_diagnostics(config, handler, Arc::new(TracingDiagnostics))
    }

    /// Create a channel with a custom diagnostics sink
    pub fn with_diagnostics(
        config: ProcessConfig,
        handler: impl MessageHandler + 'static,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Self {
        let stdin = StdinWriter::detached();

        let config = config
            .with_stdout_handler(RpcLineHandler::new(
                Arc::new(handler),
                stdin.clone(),
                Arc::clone(&diagnostics),
            ))
            .with_stderr_handler(DiagnosticLineHandler::new(
                OutputSource::Stderr,
                diagnostics,
            ));

        Self {
            supervisor: ProcessSupervisor::with_stdin(config, stdin),
        }
    }

    /// Spawn the child and start reading its output.
    ///
    /// # Panics
    ///
    /// Panics if the channel was already started.
    pub async fn start(&self, auto_terminate_at_exit: bool) -> Result<()> {
        self.supervisor.start(auto_terminate_at_exit).await
    }

    /// Send a message to the child.
    ///
    /// Returns once the whole line has been flushed to the pipe.
    pub async fn send_message(&self, message: &RpcMessage) -> Result<()> {
        self.send(message).await
    }

    /// Send any serializable value as a message
    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        let frame = codec::encode_frame(message)?;
        self.supervisor.stdin().write_line(&frame).await
    }

    /// Terminate the child; blocks the calling thread. See [`ProcessSupervisor::close`].
    pub fn close(&self) -> Result<()> {
        self.supervisor.close()
    }

    /// Terminate the child off the async runtime and wait for the read loops
    pub async fn shutdown(&self) -> Result<()> {
        self.supervisor.shutdown().await
    }

    /// Wait for the read loops, surfacing protocol or handler failures
    pub async fn join_readers(&self) -> Result<()> {
        self.supervisor.join_readers().await
    }

    /// The underlying supervisor
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("supervisor", &self.supervisor)
            .finish()
    }
}
