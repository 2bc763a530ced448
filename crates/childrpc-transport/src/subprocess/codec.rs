//! Line framing for the RPC protocol
//!
//! A protocol line is the ASCII marker `!RPC `, a JSON document encoded as
//! UTF-8, and a single `\n`. JSON string escaping keeps raw newlines out of
//! the payload, so `\n` is the only delimiter needed. Anything else the
//! child writes is free-form text.

use crate::error::{ChannelError, Result};
use crate::traits::RpcMessage;
use serde::Serialize;

/// Prefix marking a line as RPC traffic
pub const RPC_MARKER: &[u8] = b"!RPC ";

/// Classification of a line read from the child's stdout
#[derive(Debug, Clone, PartialEq)]
pub enum InboundLine {
    /// A decoded protocol message
    Message(RpcMessage),
    /// Diagnostic text with trailing whitespace removed
    Text(String),
}

/// Whether a raw line carries the RPC marker
pub fn is_rpc_line(line: &[u8]) -> bool {
    line.starts_with(RPC_MARKER)
}

/// Encode a message as a complete protocol line, newline included
pub fn encode_frame<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(message).map_err(ChannelError::Encode)?;

    let mut frame = Vec::with_capacity(RPC_MARKER.len() + payload.len() + 1);
    frame.extend_from_slice(RPC_MARKER);
    frame.extend_from_slice(&payload);
    frame.push(b'\n');
    Ok(frame)
}

/// Decode a raw stdout line.
///
/// # Errors
///
/// Returns [`ChannelError::Decode`] if the line carries the marker but the
/// payload is not valid UTF-8 JSON. Non-protocol lines never fail.
pub fn decode_line(line: &[u8]) -> Result<InboundLine> {
    let Some(payload) = line.strip_prefix(RPC_MARKER) else {
        return Ok(InboundLine::Text(decode_text(line)));
    };

    serde_json::from_slice(payload)
        .map(InboundLine::Message)
        .map_err(|source| ChannelError::Decode {
            line: String::from_utf8_lossy(payload).trim_end().to_string(),
            source,
        })
}

/// Decode diagnostic text: invalid UTF-8 is replaced, trailing whitespace dropped
pub fn decode_text(line: &[u8]) -> String {
    String::from_utf8_lossy(line).trim_end().to_string()
}
