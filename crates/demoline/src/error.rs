//! Unified error type for the Demoline server.

use demoline_ingest::IngestError;
use demoline_ledger::LedgerError;
use demoline_protocol::ProtocolError;
use demoline_session::SessionError;
use demoline_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant lets `?` convert sub-crate
/// errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum DemolineError {
    /// A transport-level error (bind, accept, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A malformed or unexpected control message.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Admission or ownership failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The ledger could not be opened or queried.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Streaming, storage or archive failure.
    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// The server settings contradict each other.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DemolineError {
    /// Status code sent to the client in an error reply.
    pub fn code(&self) -> u16 {
        match self {
            Self::Transport(_) => 500,
            Self::Protocol(_) => 400,
            Self::Session(e) => e.code(),
            Self::Ledger(_) => 503,
            Self::Ingest(e) => e.code(),
            Self::Config(_) => 500,
        }
    }
}
