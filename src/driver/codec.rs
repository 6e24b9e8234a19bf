//! NDJSON codec for agent output streams.
//!
//! Wraps [`LinesCodec`] with a maximum line length so an unterminated or
//! oversized line from a misbehaving runtime cannot exhaust memory.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tracing::debug;

use crate::{AppError, Result};

use super::AgentOutput;

/// Maximum accepted line length: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Line-delimited JSON decoder with a fixed [`MAX_LINE_BYTES`] limit.
#[derive(Debug)]
pub struct NdjsonCodec(LinesCodec);

impl NdjsonCodec {
    /// Create a codec with the default limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for NdjsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NdjsonCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Agent(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}

/// Parse one NDJSON line into an [`AgentOutput`].
///
/// Blank lines and unknown `type` values yield `Ok(None)`.
///
/// # Errors
///
/// Returns `AppError::Agent` for malformed JSON or a known type with missing
/// fields.
pub fn parse_output_line(line: &str) -> Result<Option<AgentOutput>> {
    if line.trim().is_empty() {
        return Ok(None);
    }

    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| AppError::Agent(format!("malformed json: {e}")))?;

    match value.get("type").and_then(serde_json::Value::as_str) {
        Some("text_delta" | "tool_call" | "tool_result" | "finish") => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| AppError::Agent(format!("invalid agent output: {e}"))),
        Some(other) => {
            debug!(kind = other, "skipping unknown agent output type");
            Ok(None)
        }
        None => Err(AppError::Agent("agent output without type".into())),
    }
}
