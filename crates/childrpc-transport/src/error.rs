//! Channel error types

use std::io;

/// Result type for channel operations
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Error type returned by message handlers and line handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while supervising a child process or talking to it
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The child process could not be spawned
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        /// Program that was being started
        program: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// I/O error on one of the child's pipes
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Delivering a signal failed for a reason other than the process being gone
    #[error("Failed to send {signal} to process {pid}: {source}")]
    Signal {
        /// Signal name (SIGTERM / SIGKILL)
        signal: &'static str,
        /// Target process id
        pid: u32,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// The process survived a forceful kill
    #[error("Process {pid} is still running after kill")]
    StillRunning {
        /// Process id
        pid: u32,
    },

    /// The operation needs a started process
    #[error("Process has not been started")]
    NotStarted,

    /// A pipe that the operation needs was not available
    #[error("Child {0} pipe is not available")]
    MissingPipe(&'static str),

    /// Outbound message could not be encoded as JSON
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    /// The child sent an RPC line whose payload is not valid JSON
    #[error("Malformed RPC payload {line:?}: {source}")]
    Decode {
        /// Offending payload, lossily decoded
        line: String,
        /// JSON error
        #[source]
        source: serde_json::Error,
    },

    /// A message or line handler failed
    #[error("Handler failed: {0}")]
    Handler(#[source] HandlerError),

    /// A background read loop panicked or was aborted
    #[error("{name} task failed: {source}")]
    ReaderTask {
        /// Task name
        name: &'static str,
        /// Join error
        #[source]
        source: tokio::task::JoinError,
    },
}

impl ChannelError {
    /// Whether this error was caused by the child violating the wire protocol
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}
