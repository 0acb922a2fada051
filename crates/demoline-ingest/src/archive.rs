//! Access to finished demos: late header bytes, listing and download.

use std::ops::Range;
use std::sync::Arc;

use demoline_ledger::{Ledger, SessionRecord, SessionStatus, Transition};
use demoline_protocol::{DemoListing, SessionId, UserId};
use demoline_session::{Admission, CredentialStore, SessionError};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{BlobError, BlobLocator, BlobSink, IngestError};

/// Header region the game client fills in only after recording ends.
pub const LATE_BYTES_RANGE: Range<usize> = 0x420..0x430;

/// Number of late bytes a client must submit.
pub const LATE_BYTES_LEN: usize = LATE_BYTES_RANGE.end - LATE_BYTES_RANGE.start;

/// Largest page a listing returns, and the size used when none is given.
pub const MAX_PAGE_SIZE: u32 = 50;

/// A finished demo read out in chunks, late bytes applied.
///
/// Only the header up to the end of [`LATE_BYTES_RANGE`] is held in
/// memory; the rest comes straight from the blob.
#[derive(Debug)]
pub struct DemoStream<R> {
    pub session_id: SessionId,
    size: u64,
    head: Vec<u8>,
    body: R,
}

impl<R: AsyncRead + Unpin> DemoStream<R> {
    async fn open(
        session_id: SessionId,
        mut body: R,
        blob_size: u64,
        late_bytes: Option<&[u8]>,
    ) -> Result<Self, IngestError> {
        let mut head = Vec::with_capacity(LATE_BYTES_RANGE.end);
        (&mut body)
            .take(LATE_BYTES_RANGE.end as u64)
            .read_to_end(&mut head)
            .await
            .map_err(BlobError::from)?;

        let rest = blob_size.saturating_sub(head.len() as u64);
        if let Some(late) = late_bytes {
            head = splice_late_bytes(&head, late);
        }
        Ok(Self {
            session_id,
            size: head.len() as u64 + rest,
            head,
            body,
        })
    }

    /// Length of the demo as served, late bytes included.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The next chunk of at most `max` bytes, or `None` at the end.
    pub async fn next_chunk(&mut self, max: usize) -> Result<Option<Vec<u8>>, IngestError> {
        let max = max.max(1);
        if !self.head.is_empty() {
            let take = max.min(self.head.len());
            return Ok(Some(self.head.drain(..take).collect()));
        }

        let mut chunk = vec![0; max];
        let read = self.body.read(&mut chunk).await.map_err(BlobError::from)?;
        if read == 0 {
            return Ok(None);
        }
        chunk.truncate(read);
        Ok(Some(chunk))
    }
}

/// Read side of the demo store, plus the late-bytes patch.
pub struct Archive<C, L, B> {
    admission: Admission<C, L>,
    blobs: Arc<B>,
}

impl<C, L, B> Clone for Archive<C, L, B> {
    fn clone(&self) -> Self {
        Self {
            admission: self.admission.clone(),
            blobs: Arc::clone(&self.blobs),
        }
    }
}

impl<C: CredentialStore, L: Ledger, B: BlobSink> Archive<C, L, B> {
    pub fn new(admission: Admission<C, L>, blobs: Arc<B>) -> Self {
        Self { admission, blobs }
    }

    /// Stores the hex-encoded late bytes on the key's most recently
    /// closed session. The blob itself is not modified.
    ///
    /// # Errors
    /// - `InvalidLateBytes` unless `late_bytes_hex` is exactly
    ///   [`LATE_BYTES_LEN`] bytes of hex.
    /// - `Conflict` while the key has an active session.
    /// - `NothingToPatch` if the key never closed a session.
    pub async fn submit_late_bytes(
        &self,
        api_key: &str,
        late_bytes_hex: &str,
    ) -> Result<SessionId, IngestError> {
        self.admission.credentials().lookup(api_key).await?;

        let late_bytes = hex::decode(late_bytes_hex.trim())
            .map_err(|e| IngestError::InvalidLateBytes(e.to_string()))?;
        if late_bytes.len() != LATE_BYTES_LEN {
            return Err(IngestError::InvalidLateBytes(format!(
                "expected {LATE_BYTES_LEN} bytes, got {}",
                late_bytes.len()
            )));
        }

        let ledger = self.admission.ledger();
        if ledger.find_active(api_key).await?.is_some() {
            return Err(SessionError::Conflict.into());
        }

        let record = ledger
            .latest_terminal(api_key, SessionStatus::Closed)
            .await?
            .ok_or(IngestError::NothingToPatch)?;

        let stored = ledger
            .compare_and_transition(
                &record.session_id,
                SessionStatus::Closed,
                SessionStatus::Closed,
                Transition::new().late_bytes(late_bytes),
            )
            .await?;
        if !stored {
            return Err(self.admission.current_state(&record.session_id).await?.into());
        }

        tracing::info!(session_id = %record.session_id, "late bytes stored");
        Ok(record.session_id)
    }

    /// One page of finished sessions, oldest first, with owners
    /// anonymised for the requesting analyst.
    ///
    /// A `page_size` outside `1..=50` means 50; a `page_number` below 1
    /// means 1.
    pub async fn list_demos(
        &self,
        api_key: &str,
        page_size: Option<u32>,
        page_number: Option<u32>,
    ) -> Result<Vec<DemoListing>, IngestError> {
        let analyst = self.admission.require_analyst(api_key).await?;
        let (limit, offset) = page_bounds(page_size, page_number);

        let records = self.admission.ledger().list_terminal(limit, offset).await?;
        tracing::debug!(user_id = %analyst.user_id, limit, offset, found = records.len(), "demos listed");

        Ok(records
            .iter()
            .map(|record| listing(record, &analyst.user_id))
            .collect())
    }

    /// Opens a finished demo for download, late bytes spliced in.
    ///
    /// # Errors
    /// - `Forbidden` for non-analysts.
    /// - `NotFound` for an unknown session.
    /// - `InvalidState` while the session is OPEN or STREAMING.
    /// - `NoDemo` if the session ended before a stream attached.
    pub async fn fetch_demo(
        &self,
        api_key: &str,
        session_id: &SessionId,
    ) -> Result<DemoStream<B::Reader>, IngestError> {
        let analyst = self.admission.require_analyst(api_key).await?;

        let record = self
            .admission
            .ledger()
            .get(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

        if !record.status.is_terminal() {
            return Err(SessionError::InvalidState {
                session_id: record.session_id,
                status: record.status,
            }
            .into());
        }

        let locator = record.blob_locator.ok_or(IngestError::NoDemo)?;
        let (reader, blob_size) = self
            .blobs
            .open_reader(&BlobLocator::from_stored(locator))
            .await?;
        let demo = DemoStream::open(
            record.session_id,
            reader,
            blob_size,
            record.late_bytes.as_deref(),
        )
        .await?;

        tracing::info!(%session_id, user_id = %analyst.user_id, size = demo.size(), "demo fetched");
        Ok(demo)
    }
}

/// Stable pseudonym for `owner` as seen by `requester`.
pub fn anonymous_id(owner: &UserId, requester: &UserId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(owner.as_str().as_bytes());
    hasher.update(requester.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Replaces [`LATE_BYTES_RANGE`] of `blob` with `late`. A blob shorter
/// than the range keeps what it has before the range start and gets the
/// late bytes appended there.
pub fn splice_late_bytes(blob: &[u8], late: &[u8]) -> Vec<u8> {
    let head = &blob[..blob.len().min(LATE_BYTES_RANGE.start)];
    let tail = blob.get(LATE_BYTES_RANGE.end..).unwrap_or(&[]);

    let mut out = Vec::with_capacity(head.len() + late.len() + tail.len());
    out.extend_from_slice(head);
    out.extend_from_slice(late);
    out.extend_from_slice(tail);
    out
}

fn page_bounds(page_size: Option<u32>, page_number: Option<u32>) -> (u32, u64) {
    let size = match page_size {
        Some(size @ 1..=MAX_PAGE_SIZE) => size,
        _ => MAX_PAGE_SIZE,
    };
    let number = page_number.unwrap_or(1).max(1);
    (size, u64::from(number - 1) * u64::from(size))
}

fn listing(record: &SessionRecord, requester: &UserId) -> DemoListing {
    DemoListing {
        session_id: record.session_id.clone(),
        anonymous_id: anonymous_id(&record.user_id, requester),
        demo_name: record.demo_name.clone(),
        map: record.map.clone(),
        status: record.status.to_string(),
        start_time: record.created_at,
        end_time: record.closed_at,
        demo_size: record.bytes_written,
    }
}
