//! Error types for the ingest layer.

use demoline_session::SessionError;

use crate::BlobLocator;

/// Errors raised by a [`BlobSink`](crate::BlobSink) or its writers.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// The underlying storage failed.
    #[error("blob i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// A writer is already open for this locator, or its blob was
    /// already finalized.
    #[error("blob {0} already has a writer")]
    WriterExists(BlobLocator),

    /// The blob was sealed away from this writer.
    #[error("blob {0} was sealed while its writer was open")]
    Sealed(BlobLocator),

    /// No finalized blob exists at this locator.
    #[error("blob {0} does not exist")]
    Missing(BlobLocator),
}

/// Errors that can occur while streaming into or reading from the
/// archive.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Admission, ownership or ledger failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The blob sink failed. A stream that hits this is abandoned.
    #[error("storage failure: {0}")]
    Storage(#[from] BlobError),

    /// Late bytes were not 16 bytes of valid hex.
    #[error("invalid late bytes: {0}")]
    InvalidLateBytes(String),

    /// The key has no CLOSED session to attach late bytes to.
    #[error("no finished demo to patch")]
    NothingToPatch,

    /// The session ended without recording a demo.
    #[error("session has no recorded demo")]
    NoDemo,
}

impl IngestError {
    /// Status code sent to clients in an error reply.
    pub fn code(&self) -> u16 {
        match self {
            Self::Session(e) => e.code(),
            Self::Storage(BlobError::Missing(_)) | Self::NothingToPatch | Self::NoDemo => 404,
            Self::Storage(_) => 503,
            Self::InvalidLateBytes(_) => 400,
        }
    }
}

impl From<demoline_ledger::LedgerError> for IngestError {
    fn from(e: demoline_ledger::LedgerError) -> Self {
        Self::Session(SessionError::Ledger(e))
    }
}
