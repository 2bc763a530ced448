//! Subprocess transport
//!
//! Supervises a child process over its standard streams and layers the
//! `!RPC ` line protocol on top of stdout/stdin.

pub mod codec;
pub mod process;
pub mod rpc;
pub mod writer;

pub use process::{ProcessConfig, ProcessSupervisor, TerminationPolicy};
pub use rpc::{DiagnosticLineHandler, RpcChannel, RpcLineHandler};
pub use writer::StdinWriter;
