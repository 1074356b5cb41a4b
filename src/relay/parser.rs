//! Incremental SSE decoding.
//!
//! `SseDecoder` turns arbitrary byte chunks into the `data:` payloads of
//! complete events. `FrameParser` sits on top of it and produces
//! [`StreamFrame`]s. Neither ever fails as a whole: a bad event comes out as
//! an `Err` item next to the good ones, and the caller decides whether to log
//! it.

use crate::models::stream::StreamFrame;
use log::debug;
use thiserror::Error;

const EVENT_TERMINATOR: &[u8] = b"\n\n";
const CRLF_EVENT_TERMINATOR: &[u8] = b"\r\n\r\n";
const DATA_PREFIX: &str = "data: ";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("event without data prefix: {0:?}")]
    MissingDataPrefix(String),
    #[error("malformed JSON in event ({reason}): {payload:?}")]
    MalformedJson {
        payload: String,
        reason: String,
    },
    #[error("{0}")]
    UnknownShape(String),
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    // Bytes before this offset hold no terminator start.
    scanned: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet part of a complete event.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<String, FrameError>> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some((pos, len)) = find_terminator(&self.buffer, self.scanned) {
            let fragment: Vec<u8> = self.buffer.drain(..pos + len).collect();
            self.scanned = 0;
            if let Some(item) = decode_fragment(&fragment[..pos]) {
                out.push(item);
            }
        }
        // A terminator may still be completed by the next chunk.
        self.scanned = self.buffer.len().saturating_sub(CRLF_EVENT_TERMINATOR.len() - 1);
        out
    }

    /// Called once the byte stream has ended. A trailing fragment whose last
    /// line was terminated is still an event; anything else is dropped.
    pub fn finish(&mut self) -> Vec<Result<String, FrameError>> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        if rest.is_empty() {
            return Vec::new();
        }
        if rest.ends_with(b"\n") {
            return decode_fragment(&rest).into_iter().collect();
        }
        debug!("Dropping {} bytes of incomplete SSE data at end of stream", rest.len());
        Vec::new()
    }
}

/// Position and length of the first blank-line terminator at or after `from`.
fn find_terminator(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    (from..buf.len()).find_map(|i| {
        let rest = &buf[i..];
        if rest.starts_with(EVENT_TERMINATOR) {
            Some((i, EVENT_TERMINATOR.len()))
        } else if rest.starts_with(CRLF_EVENT_TERMINATOR) {
            Some((i, CRLF_EVENT_TERMINATOR.len()))
        } else {
            None
        }
    })
}

fn decode_fragment(bytes: &[u8]) -> Option<Result<String, FrameError>> {
    let text = String::from_utf8_lossy(bytes);
    if text.trim().is_empty() {
        return None;
    }
    let first_line = text.lines().next().unwrap_or_default().trim_end_matches('\r');
    if first_line.starts_with(':') {
        // SSE comment, typically a keep-alive.
        return None;
    }
    match first_line.strip_prefix(DATA_PREFIX) {
        Some(data) => Some(Ok(data.trim().to_string())),
        None => Some(Err(FrameError::MissingDataPrefix(first_line.to_string()))),
    }
}

/// Decodes a relayed chat stream into frames.
#[derive(Debug, Default)]
pub struct FrameParser {
    decoder: SseDecoder,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<StreamFrame, FrameError>> {
        let payloads = self.decoder.feed(chunk);
        to_frames(payloads)
    }

    pub fn finish(&mut self) -> Vec<Result<StreamFrame, FrameError>> {
        let payloads = self.decoder.finish();
        to_frames(payloads)
    }
}

fn to_frames(payloads: Vec<Result<String, FrameError>>) -> Vec<Result<StreamFrame, FrameError>> {
    let mut out = Vec::new();
    for payload in payloads {
        let data = match payload {
            Ok(data) => data,
            Err(e) => {
                out.push(Err(e));
                continue;
            }
        };
        let value = match serde_json::from_str::<serde_json::Value>(&data) {
            Ok(v) => v,
            Err(e) => {
                out.push(Err(FrameError::MalformedJson { payload: data, reason: e.to_string() }));
                continue;
            }
        };
        match StreamFrame::from_payload(&value) {
            Ok(frames) => out.extend(frames.into_iter().map(Ok)),
            Err(e) => out.push(Err(FrameError::UnknownShape(e.to_string()))),
        }
    }
    out
}
