//! Child process supervision with a line-delimited JSON RPC protocol
//!
//! Drives an external helper process over its standard streams: start it,
//! exchange JSON messages with it, and shut it down deterministically even
//! when it stops responding.
//!
//! # Architecture
//!
//! - **ProcessSupervisor**: owns one child, runs a read loop per output
//!   stream, terminates with SIGTERM then SIGKILL
//! - **RpcChannel**: frames messages as `!RPC <json>\n`, dispatches inbound
//!   messages to a handler, writes replies back on stdin

#![deny(unsafe_code)]
#![warn(missing_docs)]
//! - **Diagnostics**: everything the child prints outside the protocol
//! - **Exit hooks**: close children when the host shuts down
//!
//! # Usage
//!
//! ```no_run
//! use childrpc_transport::{ProcessConfig, RpcChannel, RpcMessage};
//! use serde_json::json;
//!
//! # async fn example() -> childrpc_transport::Result<()> {
//! let channel = RpcChannel::new(ProcessConfig::new("helper"), |message: RpcMessage| async move {
//!     Ok((message["cmd"] == "ping").then(|| json!({"cmd": "pong"})))
//! });
//! channel.start(true).await?;
//! channel.send_message(&json!({"cmd": "hello"})).await?;
//! channel.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod diagnostics;
pub mod error;
pub mod exit_hook;
pub mod subprocess;
pub mod traits;

// Re-export commonly used types
pub use diagnostics::{Diagnostics, OutputSource, RecordingDiagnostics, TracingDiagnostics};
pub use error::{ChannelError, HandlerError, Result};
pub use subprocess::{ProcessConfig, ProcessSupervisor, RpcChannel, StdinWriter, TerminationPolicy};
pub use traits::{HandlerResult, LineHandler, MessageHandler, RpcMessage};
