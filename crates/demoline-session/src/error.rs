//! Error types for the session layer.

use demoline_ledger::{LedgerError, SessionStatus};
use demoline_protocol::SessionId;

/// Errors that can occur while admitting, attaching to, or releasing a
/// session.
///
/// None of these leave partial state behind: the ledger write either
/// committed and the call succeeded, or nothing changed.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The API key is unknown, or it does not own the session it named.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The key already owns an OPEN or STREAMING session.
    #[error("an active session already exists for this key")]
    Conflict,

    /// No session has this id.
    #[error("session {0} not found")]
    NotFound(SessionId),

    /// The key has no OPEN session to release.
    #[error("no open session for this key")]
    NoOpenSession,

    /// The session exists but is not in a state that allows the request
    /// (attaching to a session that already streamed, fetching one that
    /// is still live).
    #[error("session {session_id} is {status}")]
    InvalidState {
        session_id: SessionId,
        status: SessionStatus,
    },

    /// The key is valid but lacks the analyst role.
    #[error("analyst access required")]
    Forbidden,

    /// A freshly generated session id was already taken. Not retried.
    #[error("session id collision on {0}")]
    IdCollision(SessionId),

    /// The ledger could not be read or written.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl SessionError {
    /// Status code sent to clients in an error reply.
    pub fn code(&self) -> u16 {
        match self {
            Self::AuthFailed(_) => 401,
            Self::Forbidden => 403,
            Self::NotFound(_) | Self::NoOpenSession => 404,
            Self::Conflict => 409,
            Self::InvalidState { .. } => 412,
            Self::IdCollision(_) | Self::Ledger(_) => 503,
        }
    }
}
