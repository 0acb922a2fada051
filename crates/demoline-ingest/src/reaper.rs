//! Background recovery of sessions nobody is going to finish.
//!
//! Two kinds of session get stuck without help:
//!
//! - OPEN sessions no stream ever attached to (the client went away after
//!   admission). These are abandoned after the admission open timeout.
//! - STREAMING sessions whose worker died without dropping its handle
//!   (process crash) or stalled. Their progress heartbeat stops, and once
//!   it is older than [`ReaperConfig::stale_stream_after`] the session is
//!   abandoned and its partial blob sealed. Sealing revokes a writer that
//!   is still alive, so a stalled worker that wakes up later gets
//!   `InvalidState` instead of growing the sealed blob.

use std::sync::Arc;

use chrono::Utc;
use demoline_ledger::{Ledger, SessionStatus, Transition};
use demoline_protocol::SessionId;
use demoline_session::{Admission, CredentialStore, stale_cutoff};
use tokio::time::{self, MissedTickBehavior};

use crate::{BlobLocator, BlobSink, IngestError, ReaperConfig};

/// What one sweep reclaimed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub expired_open: Vec<SessionId>,
    pub abandoned_streams: Vec<SessionId>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.expired_open.is_empty() && self.abandoned_streams.is_empty()
    }
}

/// Periodic sweeper over the ledger.
pub struct Reaper<C, L, B> {
    admission: Admission<C, L>,
    blobs: Arc<B>,
    config: ReaperConfig,
}

impl<C: CredentialStore, L: Ledger, B: BlobSink> Reaper<C, L, B> {
    pub fn new(admission: Admission<C, L>, blobs: Arc<B>, config: ReaperConfig) -> Self {
        Self {
            admission,
            blobs,
            config,
        }
    }

    /// Runs one pass over OPEN and STREAMING sessions.
    pub async fn sweep(&self) -> Result<ReapReport, IngestError> {
        let expired_open = self.admission.expire_stale().await?;

        let ledger = self.admission.ledger();
        let now = Utc::now();
        let cutoff = stale_cutoff(now, self.config.stale_stream_after);
        let mut abandoned_streams = Vec::new();

        for record in ledger.find_stale(SessionStatus::Streaming, cutoff).await? {
            let abandoned = ledger
                .compare_and_transition(
                    &record.session_id,
                    SessionStatus::Streaming,
                    SessionStatus::Abandoned,
                    Transition::new().closed_at(now),
                )
                .await?;
            if !abandoned {
                continue;
            }

            tracing::warn!(
                session_id = %record.session_id,
                last_activity = %record.last_activity,
                "stale stream abandoned"
            );

            if let Some(locator) = record.blob_locator {
                let locator = BlobLocator::from_stored(locator);
                // The row keeps the byte count of the last heartbeat; the
                // sealed blob may hold a little more.
                match self.blobs.seal(&locator).await {
                    Ok(Some(size)) => {
                        tracing::debug!(session_id = %record.session_id, size, "partial blob sealed");
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(session_id = %record.session_id, error = %e, "could not seal orphaned blob");
                    }
                }
            }
            abandoned_streams.push(record.session_id);
        }

        let report = ReapReport {
            expired_open,
            abandoned_streams,
        };
        if !report.is_empty() {
            tracing::info!(
                expired_open = report.expired_open.len(),
                abandoned_streams = report.abandoned_streams.len(),
                "reaper sweep"
            );
        }
        Ok(report)
    }

    /// Sweeps every [`ReaperConfig::interval`] until the task is dropped.
    /// Sweep failures are logged and retried on the next tick.
    pub async fn run(self) {
        let mut ticker = time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep().await {
                tracing::error!(error = %e, "reaper sweep failed");
            }
        }
    }
}
