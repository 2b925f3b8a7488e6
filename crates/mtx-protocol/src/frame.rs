//! Binary frame model and codec.
//!
//! A media frame travels as one WebSocket binary message:
//!
//! ```text
//! byte 0   stream kind (0 = RTP, 1 = RTCP)
//! byte 1   track id
//! byte 2.. payload, verbatim
//! ```
//!
//! The payload is never inspected by the relay.  It is held as [`Bytes`] so
//! fan-out to N readers clones a reference, not the data.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Whether a frame carries media (RTP) or control (RTCP) data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Rtp,
    Rtcp,
}

impl StreamKind {
    fn to_byte(self) -> u8 {
        match self {
            StreamKind::Rtp => 0,
            StreamKind::Rtcp => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(StreamKind::Rtp),
            1 => Some(StreamKind::Rtcp),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("unknown stream kind byte {0}")]
    UnknownKind(u8),
}

/// One media frame, as produced by a source and delivered to readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub track_id: u8,
    pub kind: StreamKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(track_id: u8, kind: StreamKind, payload: impl Into<Bytes>) -> Self {
        Frame {
            track_id,
            kind,
            payload: payload.into(),
        }
    }

    /// Wire form: 2-byte header followed by the payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(2 + self.payload.len());
        buf.push(self.kind.to_byte());
        buf.push(self.track_id);
        buf.extend_from_slice(&self.payload);
        Bytes::from(buf)
    }

    pub fn decode(buf: &Bytes) -> Result<Frame, FrameError> {
        if buf.len() < 2 {
            return Err(FrameError::TooShort(buf.len()));
        }
        let kind = StreamKind::from_byte(buf[0]).ok_or(FrameError::UnknownKind(buf[0]))?;
        Ok(Frame {
            track_id: buf[1],
            kind,
            payload: buf.slice(2..),
        })
    }
}
