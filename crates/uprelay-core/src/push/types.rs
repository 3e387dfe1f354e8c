//! Wire types and framing shared by the push server and its client.
//!
//! Two streaming framings exist:
//!
//! - single id (`/client/id/{id}`): raw payload bytes followed by `\n\n`
//! - multi id (`/client/multi_id/{a}&{b}`): one JSON object per line,
//!   `{"<id>": ["<base64>", ...], ...}`, terminated by `\r\n`

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::ids::ServerId;

/// Separator between ids in a multi-id path segment.
pub const ID_SEPARATOR: char = '&';

/// Terminator written after each single-id message.
pub const SINGLE_DELIMITER: &[u8] = b"\n\n";

/// Terminator written after each multi-id batch line.
pub const BATCH_DELIMITER: &[u8] = b"\r\n";

/// Most messages the server packs into one batch line. At the payload cap
/// this keeps a line well under [`MAX_LINE_BYTES`].
pub const MAX_BATCH_MESSAGES: usize = 256;

/// UnifiedPush protocol version advertised by discovery.
pub const UNIFIEDPUSH_VERSION: u32 = 1;

/// `GET /client/register` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: ServerId,
}

/// `GET /push/id/{id}` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub unifiedpush: UnifiedPushInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedPushInfo {
    pub version: u32,
}

impl DiscoveryResponse {
    pub fn current() -> Self {
        Self {
            unifiedpush: UnifiedPushInfo {
                version: UNIFIEDPUSH_VERSION,
            },
        }
    }
}

/// Error body returned by the push server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Unknown ids, for multi-id delivery requests.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<ServerId>,
}

/// A message received for one server id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub server_id: ServerId,
    pub payload: Vec<u8>,
}

/// Errors decoding a multi-id batch line.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed batch JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base64 payload for id {id}: {source}")]
    Base64 {
        id: ServerId,
        source: base64::DecodeError,
    },

    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
}

/// Split a multi-id path segment into ids, skipping empty entries.
pub fn parse_id_list(segment: &str) -> Vec<ServerId> {
    segment
        .split(ID_SEPARATOR)
        .filter(|s| !s.is_empty())
        .map(ServerId::from)
        .collect()
}

/// Join ids into a multi-id path segment.
pub fn join_id_list<'a>(ids: impl IntoIterator<Item = &'a ServerId>) -> String {
    ids.into_iter()
        .map(ServerId::as_str)
        .collect::<Vec<_>>()
        .join("&")
}

/// Frame one message for the single-id stream.
pub fn encode_single(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + SINGLE_DELIMITER.len());
    out.extend_from_slice(payload);
    out.extend_from_slice(SINGLE_DELIMITER);
    out
}

/// Frame one multi-id batch as a JSON line.
pub fn encode_batch<P: AsRef<[u8]>>(batch: &BTreeMap<ServerId, Vec<P>>) -> Vec<u8> {
    let encoded: BTreeMap<&str, Vec<String>> = batch
        .iter()
        .map(|(id, payloads)| {
            (
                id.as_str(),
                payloads.iter().map(|p| BASE64.encode(p.as_ref())).collect(),
            )
        })
        .collect();
    // A map of strings to string lists always serializes.
    let mut line = serde_json::to_vec(&encoded).unwrap_or_default();
    line.extend_from_slice(BATCH_DELIMITER);
    line
}

/// Decode one multi-id batch line into messages, preserving per-id order.
///
/// Whitespace inside base64 strings is ignored, which accepts line-wrapped
/// encoder output.
pub fn decode_batch_line(line: &[u8]) -> Result<Vec<PushMessage>, FrameError> {
    let batch: BTreeMap<ServerId, Vec<String>> = serde_json::from_slice(line)?;
    let mut messages = Vec::new();
    for (server_id, encoded) in batch {
        for b64 in encoded {
            let compact: String = b64.chars().filter(|c| !c.is_ascii_whitespace()).collect();
            let payload = BASE64
                .decode(compact.as_bytes())
                .map_err(|source| FrameError::Base64 {
                    id: server_id.clone(),
                    source,
                })?;
            messages.push(PushMessage {
                server_id: server_id.clone(),
                payload,
            });
        }
    }
    Ok(messages)
}

/// Longest unterminated line [`LineBuffer`] holds before dropping it.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Reassembles newline-terminated lines from arbitrarily split chunks.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Start of the unread region.
    start: usize,
    /// Bytes before this offset hold no `\n` past `start`.
    scanned: usize,
    limit: usize,
    /// Dropping input up to the next `\n` after an overlong line.
    discarding: bool,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            start: 0,
            scanned: 0,
            limit,
            discarding: false,
        }
    }

    /// Append a chunk. If the unterminated tail grows past the limit it is
    /// dropped along with everything up to its terminating `\n`; complete
    /// lines already buffered are kept.
    pub fn extend(&mut self, chunk: &[u8]) -> Result<(), FrameError> {
        if self.start > 0 && self.start * 2 >= self.buf.len() {
            self.buf.drain(..self.start);
            self.scanned -= self.start;
            self.start = 0;
        }

        let chunk = if self.discarding {
            match chunk.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.discarding = false;
                    &chunk[pos + 1..]
                }
                None => return Ok(()),
            }
        } else {
            chunk
        };
        self.buf.extend_from_slice(chunk);

        let tail_start = self.buf[self.start..]
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(self.start, |pos| self.start + pos + 1);
        if self.buf.len() - tail_start > self.limit {
            self.buf.truncate(tail_start);
            self.scanned = self.scanned.min(tail_start);
            self.discarding = true;
            return Err(FrameError::LineTooLong { limit: self.limit });
        }
        Ok(())
    }

    /// Next complete line with its `\n` / `\r\n` terminator stripped.
    /// Blank keepalive lines are skipped.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        loop {
            let Some(pos) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') else {
                self.scanned = self.buf.len();
                return None;
            };
            let end = self.scanned + pos;
            let mut line = self.buf[self.start..end].to_vec();
            self.start = end + 1;
            self.scanned = self.start;
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                return Some(line);
            }
        }
    }

    /// Bytes received after the last complete line.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.start
    }
}
