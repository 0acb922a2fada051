//! Error types for the ledger layer.

use demoline_protocol::SessionId;

use crate::SessionStatus;

/// Errors that can occur while reading or writing session records.
///
/// Any of these means the operation had no effect: every write is a
/// single statement, so it either commits entirely or not at all.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The database could not be reached or rejected the statement.
    #[error("ledger unavailable: {0}")]
    Database(#[from] sqlx::Error),

    /// The database file's directory could not be created.
    #[error("ledger i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// Applying the embedded schema migrations failed.
    #[error("ledger migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A stored row could not be decoded (unknown status, bad timestamp).
    #[error("corrupt session row: {0}")]
    Corrupt(String),

    /// A session with this id already exists.
    #[error("session id {0} already exists")]
    DuplicateSessionId(SessionId),

    /// The key already owns an OPEN or STREAMING session.
    #[error("api key already owns an active session")]
    ActiveSessionExists,

    /// The requested status change is not an edge of the lifecycle.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
}
