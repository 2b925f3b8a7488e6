// mtx-protocol: Relay wire protocol types and serialization.
//
// All control messages use a top-level `kind` field for discriminated
// deserialization and travel as WebSocket text frames.  Media frames travel
// as WebSocket binary frames with a fixed 2-byte header (see `frame`).

use serde::{Deserialize, Serialize};

pub mod frame;
pub mod path_name;

pub use frame::{Frame, FrameError, StreamKind};
pub use path_name::{PathNameError, validate_path_name};

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// Media description of a single track within a stream.
///
/// Published by the source during announce and handed verbatim to readers in
/// `describe_ok` / `setup_ok`.  Track ids are dense, starting at 0, in the
/// order the publisher announced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: u8,
    /// `"video"` or `"audio"`.
    pub media: String,
    /// Codec name as announced, e.g. `"H264"` or `"OPUS"`.
    pub codec: String,
    pub clock_rate: u32,
    /// Codec-specific parameter string; passed through, never interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<String>,
}

// ---------------------------------------------------------------------------
// Client -> Server messages
// ---------------------------------------------------------------------------

/// A reader asks what the stream at `path` looks like.
///
/// Does not attach the session to the path.  Credentials are optional on the
/// first attempt; on an `unauthorized` reply with `retryable = true` the
/// client re-sends the same operation with credentials and a fresh
/// `request_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Describe {
    pub request_id: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
}

/// A publisher announces its media description for `path`.
///
/// On success the session enters the pre-record state; frames are accepted
/// only after a subsequent `record`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    pub request_id: String,
    pub path: String,
    pub tracks: Vec<TrackInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
}

/// A reader subscribes to a subset of the path's tracks.
///
/// An empty `track_ids` list subscribes to every track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPlay {
    pub request_id: String,
    pub path: String,
    #[serde(default)]
    pub track_ids: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
}

/// Transition the session from pre-play to play (readers) — frames start
/// flowing to this session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Play {
    pub request_id: String,
}

/// Transition the session from pre-record to record (publishers) — binary
/// frames are accepted from this session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub request_id: String,
}

/// Reverse of `play` / `record`; the session stays attached to its path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pause {
    pub request_id: String,
}

/// Detach from the path.  The connection stays open and may issue new
/// requests afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Teardown {
    pub request_id: String,
}

// ---------------------------------------------------------------------------
// Server -> Client messages
// ---------------------------------------------------------------------------

/// First message on every connection; carries the server-assigned session id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub session_id: String,
}

/// Successful reply to `describe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescribeOk {
    pub request_id: String,
    pub tracks: Vec<TrackInfo>,
}

/// Reply to `describe` when the path designates another location
/// (`source = redirect`, or a fallback while no one is publishing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub request_id: String,
    pub location: String,
}

/// Successful reply to `announce`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceOk {
    pub request_id: String,
}

/// Successful reply to `setup_play`; echoes the resolved track set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupOk {
    pub request_id: String,
    pub tracks: Vec<TrackInfo>,
}

/// Generic success reply (`play`, `record`, `pause`, `teardown`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ok_ {
    pub request_id: String,
}

/// Error reply.  `retryable = true` invites the client to repeat the
/// operation (e.g. with credentials); `false` means the request is
/// definitively rejected and, for `code = "unauthorized"`, that the
/// connection is about to be closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Empty when the error is not tied to a single request
    /// (e.g. a forced close while playing).
    #[serde(default)]
    pub request_id: String,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    /// Protocol-appropriate response hint (e.g. an auth challenge).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Discriminated union of every control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireMessage {
    // client -> server
    Describe(Describe),
    Announce(Announce),
    SetupPlay(SetupPlay),
    Play(Play),
    Record(Record),
    Pause(Pause),
    Teardown(Teardown),
    // server -> client
    Hello(Hello),
    DescribeOk(DescribeOk),
    Redirect(Redirect),
    AnnounceOk(AnnounceOk),
    SetupOk(SetupOk),
    Ok(Ok_),
    Error(ErrorMessage),
}

/// Stable wire error codes.
pub mod error_codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const NOT_FOUND: &str = "not_found";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const TERMINATED: &str = "terminated";
}
