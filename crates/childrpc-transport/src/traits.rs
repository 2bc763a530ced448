//! Handler traits
//!
//! Defines the seams where the host plugs behaviour into a channel:
//! [`LineHandler`] for raw lines read from the child's output streams and
//! [`MessageHandler`] for decoded RPC messages.

use crate::error::HandlerError;
use async_trait::async_trait;
use std::future::Future;

/// A decoded RPC message exchanged with the child.
pub type RpcMessage = serde_json::Value;

/// Result returned by a [`MessageHandler`]
pub type HandlerResult = std::result::Result<Option<RpcMessage>, HandlerError>;

/// Receives each line read from one of the child's output streams.
///
/// `line` includes the trailing newline if the child wrote one. The read
/// loop awaits this call before reading the next line, so implementations
/// see lines one at a time and in order.
#[async_trait]
pub trait LineHandler: Send + Sync {
    /// Handle a single raw line
    ///
    /// # Errors
    ///
    /// Any error terminates the owning read loop.
    async fn handle_line(&self, line: &[u8]) -> crate::error::Result<()>;
}

/// Receives decoded inbound RPC messages and optionally produces a reply.
///
/// A returned `Some(reply)` is framed and written back to the child before
/// the next inbound line is read. Returning `Err` is treated as fatal for
/// the stdout read loop.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one inbound message
    async fn handle_message(&self, message: RpcMessage) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(RpcMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle_message(&self, message: RpcMessage) -> HandlerResult {
        (self)(message).await
    }
}
