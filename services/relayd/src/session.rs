//! Protocol-agnostic session contract.
//!
//! A session is owned by its ingress listener's task.  Paths and the path
//! manager never own sessions; they hold a [`SessionHandle`] — enough to
//! identify the session and to ask its owner to close it.  The concrete
//! WebSocket ingress lives in [`crate::ingress`]; any other protocol adapter
//! implements the same contract by constructing these types.

use std::fmt;
use std::net::SocketAddr;

use tokio::sync::mpsc;
use uuid::Uuid;

pub type SessionId = Uuid;

/// Why a session is being force-closed by its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The path is tearing down (terminate, config removal, idle close).
    PathTerminated,
    /// A new publisher displaced this one (publisher override).
    PublisherDisplaced,
    /// The source dropped to not-ready, removing every reader.
    SourceNotReady,
    /// The reader's frame queue overflowed.
    ReaderTooSlow,
}

/// Commands a path (or reader set) may send to a session's owner task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    Close(CloseReason),
}

/// Back-reference from a path to an attached session.
///
/// Cheap to clone; sending is non-blocking so the path actor never waits on
/// a session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub remote_addr: SocketAddr,
    ctrl_tx: mpsc::UnboundedSender<SessionControl>,
}

impl SessionHandle {
    pub fn new(
        id: SessionId,
        remote_addr: SocketAddr,
    ) -> (Self, mpsc::UnboundedReceiver<SessionControl>) {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        (
            SessionHandle {
                id,
                remote_addr,
                ctrl_tx,
            },
            ctrl_rx,
        )
    }

    /// Ask the owning task to close the session.  Best-effort: the session
    /// may already be gone.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.ctrl_tx.send(SessionControl::Close(reason));
    }
}

/// Identity of a requesting session for operations that do not attach it
/// (describe).
#[derive(Debug, Clone)]
pub struct SessionDesc {
    pub id: SessionId,
    pub remote_addr: SocketAddr,
    /// The URL the peer used to reach this path, when the protocol knows it.
    /// Required to resolve relative fallbacks.
    pub requestor_url: Option<String>,
}

/// Credentials extracted from the protocol, plus how many validations this
/// session has already failed (drives the retryable/critical escalation).
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: Option<String>,
    pub pass: Option<String>,
    pub prior_failures: u32,
}

impl fmt::Display for Credentials {
    // user only; the password never reaches the logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user {
            Some(user) => write!(f, "user {user}"),
            None => write!(f, "anonymous"),
        }
    }
}
