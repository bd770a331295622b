//! Incremental decoding of the server-pushed event stream.
//!
//! The response body is newline-delimited. Only lines starting with [`DATA_PREFIX`]
//! carry events; their remainder is a JSON record with a `type` discriminator.

use std::fmt::Display;

use futures_util::stream::{BoxStream, Stream, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

pub const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

/// An event relayed to the foreground while a streaming call is running.
///
/// `Error` and `Complete` are terminal: exactly one of them ends every stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    Content { text: String },
    Error { message: String },
    Complete,
}

impl StreamEvent {
    pub fn content(text: impl Into<String>) -> Self {
        StreamEvent::Content { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Content { .. })
    }
}

/// Splits a byte stream into lines, carrying an unterminated tail across chunks.
///
/// Buffering happens on raw bytes, so a multi-byte character split between two
/// reads is reassembled before it is decoded.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|byte| *byte == b'\n') {
            let end = start + offset;
            lines.push(decode_line(&self.pending[start..end]));
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Flushes whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[derive(Deserialize)]
struct StreamRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, alias = "text", alias = "delta")]
    content: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Interprets one line of the body.
///
/// `Ok(None)` means the line is not significant (no prefix, a sentinel, or an
/// unknown record type). `Err` means the record could not be parsed.
pub fn parse_line(line: &str) -> Result<Option<StreamEvent>, serde_json::Error> {
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return Ok(None);
    };
    let payload = payload.trim();
    if payload.is_empty() || payload == DONE_SENTINEL {
        return Ok(None);
    }
    let record: StreamRecord = serde_json::from_str(payload)?;
    Ok(match record.kind.as_str() {
        "content" => record.content.map(StreamEvent::content),
        "error" => Some(StreamEvent::error(
            record
                .error
                .or(record.message)
                .or(record.content)
                .unwrap_or_else(|| String::from("the assistant reported an error")),
        )),
        other => {
            debug!("Skipping stream record of type {}", other);
            None
        }
    })
}

/// Malformed records are logged and dropped; they never end the stream.
fn interpret(line: &str) -> Option<StreamEvent> {
    match parse_line(line) {
        Ok(event) => event,
        Err(err) => {
            warn!("Skipping malformed stream record ({}): {}", err, line);
            None
        }
    }
}

/// Turns a chunked response body into a lazy sequence of [`StreamEvent`]s.
///
/// The sequence always ends with exactly one terminal event: `Complete` when the
/// body ends normally, `Error` on a read failure or an error record.
pub fn decode_stream<S, B, E>(body: S) -> BoxStream<'static, StreamEvent>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut decoder = LineDecoder::new();
        let mut body = Box::pin(body);
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!("Stream interrupted: {}", err);
                    yield StreamEvent::error(format!("stream interrupted: {err}"));
                    return;
                }
            };
            for line in decoder.push(chunk.as_ref()) {
                if let Some(event) = interpret(&line) {
                    let terminal = event.is_terminal();
                    yield event;
                    if terminal {
                        return;
                    }
                }
            }
        }
        if let Some(line) = decoder.finish()
            && let Some(event) = interpret(&line)
        {
            let terminal = event.is_terminal();
            yield event;
            if terminal {
                return;
            }
        }
        yield StreamEvent::Complete;
    })
}
