//! Error taxonomy for path and registry operations.
//!
//! Every variant maps to a stable wire code; the session layer converts the
//! variant into an `error` reply and decides whether the connection survives.

use mtx_protocol::error_codes;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("invalid path name: {0}")]
    NameInvalid(String),
    #[error("no path configuration matches '{0}'")]
    NotFound(String),
    #[error("no one is publishing to path '{0}'")]
    NoOnePublishing(String),
    #[error("authentication failed")]
    AuthNotCritical { hint: String },
    #[error("authentication failed")]
    AuthCritical { hint: String },
    #[error("session is already subscribed to this path")]
    AlreadySubscribed,
    #[error("another source is already attached to this path")]
    AlreadyPublishing,
    #[error("unknown track id {0}")]
    InvalidTrack(u8),
    #[error("operation is not valid in the session's current state")]
    InvalidState,
    #[error("cannot resolve relative fallback without a requestor URL")]
    FallbackUnresolvable,
    #[error("source of path '{0}' did not become ready in time")]
    PublisherTimeout(String),
    #[error("terminated")]
    Terminated,
}

impl RelayError {
    pub fn wire_code(&self) -> &'static str {
        match self {
            RelayError::NameInvalid(_)
            | RelayError::AlreadySubscribed
            | RelayError::AlreadyPublishing
            | RelayError::InvalidTrack(_)
            | RelayError::InvalidState
            | RelayError::FallbackUnresolvable => error_codes::BAD_REQUEST,
            RelayError::NotFound(_)
            | RelayError::NoOnePublishing(_)
            | RelayError::PublisherTimeout(_) => error_codes::NOT_FOUND,
            RelayError::AuthNotCritical { .. } | RelayError::AuthCritical { .. } => {
                error_codes::UNAUTHORIZED
            }
            RelayError::Terminated => error_codes::TERMINATED,
        }
    }

    /// Whether the client may usefully repeat the operation on the same
    /// connection (only non-critical auth failures qualify).
    pub fn retryable(&self) -> bool {
        matches!(self, RelayError::AuthNotCritical { .. })
    }

    pub fn hint(&self) -> Option<&str> {
        match self {
            RelayError::AuthNotCritical { hint } | RelayError::AuthCritical { hint } => {
                Some(hint.as_str())
            }
            _ => None,
        }
    }
}
