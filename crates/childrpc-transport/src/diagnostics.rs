//! Reporting of child output that is not protocol traffic

use std::fmt;
use std::sync::Mutex;

/// Which of the child's output streams a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputSource {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

impl OutputSource {
    /// Stream name as used in log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for OutputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for free-form text the child writes outside the RPC protocol.
///
/// The channel does not format or localize this text; it only decodes it
/// and strips trailing whitespace.
pub trait Diagnostics: Send + Sync {
    /// Report one line of child output
    fn child_output(&self, source: OutputSource, text: &str);
}

/// Default sink: every line becomes a `tracing` warning.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn child_output(&self, source: OutputSource, text: &str) {
        tracing::warn!(source = %source, "Subprocess: {}", text);
    }
}

/// Sink that keeps every reported line in memory.
///
/// Useful in tests and for hosts that want to surface child output in
/// their own UI.
#[derive(Debug, Default)]
pub struct RecordingDiagnostics {
    lines: Mutex<Vec<(OutputSource, String)>>,
}

impl RecordingDiagnostics {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything reported so far
    pub fn lines(&self) -> Vec<(OutputSource, String)> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    /// Lines reported for a single source
    pub fn lines_from(&self, source: OutputSource) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(s, _)| *s == source)
            .map(|(_, text)| text)
            .collect()
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn child_output(&self, source: OutputSource, text: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((source, text.to_string()));
        }
    }
}
