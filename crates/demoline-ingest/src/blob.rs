//! The blob sink seam: where streamed demo bytes end up.
//!
//! A blob is append-only while its session streams and immutable after
//! [`BlobWriter::finalize`]. The sink itself refuses a second writer for
//! the same locator, so a bug above it cannot interleave two streams into
//! one demo.

use std::fmt;
use std::future::Future;

use demoline_protocol::SessionId;
use tokio::io::AsyncRead;

use crate::BlobError;

/// Storage address of one session's demo.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobLocator(String);

impl BlobLocator {
    /// The locator for a session's demo: `<session_id>.dem`.
    pub fn for_session(session_id: &SessionId) -> Self {
        Self(format!("{session_id}.dem"))
    }

    /// Wraps a locator read back from the ledger.
    pub fn from_stored(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a finalized blob looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobReceipt {
    /// Committed length in bytes.
    pub size: u64,
}

/// An object store with append/finalize semantics.
pub trait BlobSink: Send + Sync + 'static {
    type Writer: BlobWriter;
    type Reader: AsyncRead + Unpin + Send + 'static;

    /// Opens the single writer for `locator`.
    ///
    /// # Errors
    /// [`BlobError::WriterExists`] if a writer was already opened for
    /// this locator, whether or not it has been finalized.
    fn open_writer(
        &self,
        locator: &BlobLocator,
    ) -> impl Future<Output = Result<Self::Writer, BlobError>> + Send;

    /// Reads a finalized blob in full.
    ///
    /// # Errors
    /// [`BlobError::Missing`] if nothing was finalized at `locator`.
    fn read(&self, locator: &BlobLocator)
    -> impl Future<Output = Result<Vec<u8>, BlobError>> + Send;

    /// Opens a finalized blob for sequential reading, with its length.
    ///
    /// # Errors
    /// [`BlobError::Missing`] if nothing was finalized at `locator`.
    fn open_reader(
        &self,
        locator: &BlobLocator,
    ) -> impl Future<Output = Result<(Self::Reader, u64), BlobError>> + Send;

    /// Finalizes a blob on behalf of a writer that stopped reporting.
    ///
    /// If that writer is still alive it is revoked: every later `append`
    /// or `finalize` on it fails with [`BlobError::Sealed`], so the sealed
    /// blob never changes. Returns the sealed size, or `None` if there
    /// was nothing to seal.
    fn seal(
        &self,
        locator: &BlobLocator,
    ) -> impl Future<Output = Result<Option<u64>, BlobError>> + Send;
}

/// The exclusive append handle for one blob.
pub trait BlobWriter: Send + 'static {
    /// Appends `bytes` after everything appended before. Suspends until
    /// the sink has accepted them.
    fn append(&mut self, bytes: &[u8]) -> impl Future<Output = Result<(), BlobError>> + Send;

    /// Flushes and makes the blob immutable.
    fn finalize(self) -> impl Future<Output = Result<BlobReceipt, BlobError>> + Send;
}
