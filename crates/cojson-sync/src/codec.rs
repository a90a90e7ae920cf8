//! Wire framing.
//!
//! A frame is one or more JSON messages joined by `\n`. A line of the form
//! `{"type":"ping",...}` is a keepalive and carries no message. Lines that
//! do not decode are logged and skipped; the rest of the frame still
//! applies.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::messages::SyncMessage;

/// Keepalive line.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    time: i64,
}

/// One decoded line of a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(SyncMessage),
    Ping,
}

/// Encode one message as a single line.
pub fn encode_message(message: &SyncMessage) -> Result<Bytes> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(|e| SyncError::Encode(e.to_string()))
}

/// A keepalive line stamped with `time`.
pub fn ping_line(time: i64) -> Bytes {
    let ping = Ping {
        kind: "ping".into(),
        time,
    };
    serde_json::to_vec(&ping)
        .map(Bytes::from)
        .unwrap_or_else(|_| Bytes::from_static(br#"{"type":"ping"}"#))
}

/// Join encoded lines into one frame.
pub fn join_lines<'a>(lines: impl IntoIterator<Item = &'a Bytes>) -> Bytes {
    let mut frame = BytesMut::new();
    for line in lines {
        if !frame.is_empty() {
            frame.put_u8(b'\n');
        }
        frame.extend_from_slice(line);
    }
    frame.freeze()
}

/// Split a frame into messages and keepalives.
pub fn decode_frame(frame: &[u8]) -> Vec<Frame> {
    frame
        .split(|&b| b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .filter_map(decode_line)
        .collect()
}

fn decode_line(line: &[u8]) -> Option<Frame> {
    match serde_json::from_slice::<SyncMessage>(line) {
        Ok(message) => Some(Frame::Message(message)),
        Err(e) => {
            if let Ok(ping) = serde_json::from_slice::<Ping>(line) {
                if ping.kind == "ping" {
                    return Some(Frame::Ping);
                }
            }
            warn!(
                error = %e,
                line = %String::from_utf8_lossy(&line[..line.len().min(200)]),
                "skipping undecodable message"
            );
            None
        }
    }
}
