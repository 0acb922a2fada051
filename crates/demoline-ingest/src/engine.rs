//! The stream ingest engine: binding a live connection to an OPEN session
//! and relaying its bytes into the session's blob.
//!
//! ## Lifecycle
//!
//! ```text
//! attach() ──→ StreamHandle ──write()*──→ close()   ──→ [Closed]
//!                   │                 └──→ abandon() ──→ [Abandoned]
//!                   │
//!                   └──(dropped unfinished)──────────→ [Abandoned]
//! ```
//!
//! Every status change is a compare-and-transition from `Streaming`, so a
//! handle whose session was already ended elsewhere (by the reaper) finds
//! out on its next ledger write and stops.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use demoline_ledger::{Ledger, LedgerError, SessionStatus, Transition};
use demoline_protocol::SessionId;
use demoline_session::{Admission, CredentialStore, SessionError};
use tokio::time::Instant;

use crate::{
    BlobError, BlobLocator, BlobSink, BlobWriter, IngestConfig, IngestError, StreamStats,
};

/// Attaches streams to sessions.
pub struct IngestEngine<C, L, B> {
    admission: Admission<C, L>,
    blobs: Arc<B>,
    config: IngestConfig,
}

impl<C, L, B> Clone for IngestEngine<C, L, B> {
    fn clone(&self) -> Self {
        Self {
            admission: self.admission.clone(),
            blobs: Arc::clone(&self.blobs),
            config: self.config.clone(),
        }
    }
}

impl<C: CredentialStore, L: Ledger, B: BlobSink> IngestEngine<C, L, B> {
    pub fn new(admission: Admission<C, L>, blobs: Arc<B>, config: IngestConfig) -> Self {
        Self {
            admission,
            blobs,
            config,
        }
    }

    pub fn admission(&self) -> &Admission<C, L> {
        &self.admission
    }

    pub fn blobs(&self) -> &Arc<B> {
        &self.blobs
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Binds a stream to `session_id`, moving it OPEN → STREAMING and
    /// opening its blob writer.
    ///
    /// Of any number of concurrent attaches to one session, exactly one
    /// wins the compare-and-transition; the rest get `InvalidState` and
    /// never touch the blob sink.
    ///
    /// # Errors
    /// - `AuthFailed` for an unknown key or one that does not own the
    ///   session. The session is left untouched.
    /// - `NotFound` for an unknown session id.
    /// - `InvalidState` unless the session is OPEN.
    /// - `Storage` if the writer cannot be opened; the session is then
    ///   ABANDONED.
    pub async fn attach(
        &self,
        api_key: &str,
        session_id: &SessionId,
    ) -> Result<StreamHandle<L, B::Writer>, IngestError> {
        let (identity, record) = self.admission.authorize_owner(api_key, session_id).await?;

        if record.status != SessionStatus::Open {
            return Err(SessionError::InvalidState {
                session_id: record.session_id,
                status: record.status,
            }
            .into());
        }

        let ledger = self.admission.ledger();
        let locator = BlobLocator::for_session(session_id);
        let attached = ledger
            .compare_and_transition(
                session_id,
                SessionStatus::Open,
                SessionStatus::Streaming,
                Transition::new()
                    .blob_locator(locator.as_str())
                    .last_activity(Utc::now()),
            )
            .await?;

        if !attached {
            tracing::debug!(%session_id, "attach lost the race for the session");
            return Err(self.admission.current_state(session_id).await?.into());
        }

        let writer = match self.blobs.open_writer(&locator).await {
            Ok(writer) => writer,
            Err(e) => {
                tracing::error!(%session_id, %locator, error = %e, "blob writer could not be opened");
                let now = Utc::now();
                ledger
                    .compare_and_transition(
                        session_id,
                        SessionStatus::Streaming,
                        SessionStatus::Abandoned,
                        Transition::new().closed_at(now).last_activity(now),
                    )
                    .await?;
                return Err(e.into());
            }
        };

        tracing::info!(%session_id, user_id = %identity.user_id, %locator, "stream attached");
        Ok(StreamHandle {
            session_id: session_id.clone(),
            ledger: Arc::clone(ledger),
            writer: Some(writer),
            stats: StreamStats::new(),
            status: SessionStatus::Streaming,
            progress_interval: self.config.progress_interval,
            last_progress: Instant::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// StreamHandle
// ---------------------------------------------------------------------------

/// The exclusive byte sink of one STREAMING session.
///
/// Owned by the single worker that attached it. Dropping a handle that
/// was neither closed nor abandoned abandons the session in the
/// background, so a worker that disappears mid-stream (panic, cancelled
/// task, lost connection) never leaves its session STREAMING.
pub struct StreamHandle<L: Ledger, W: BlobWriter> {
    session_id: SessionId,
    ledger: Arc<L>,
    writer: Option<W>,
    stats: StreamStats,
    /// `Streaming` until this handle ends the session or learns that
    /// something else did.
    status: SessionStatus,
    progress_interval: Duration,
    last_progress: Instant,
}

impl<L: Ledger, W: BlobWriter> StreamHandle<L, W> {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Appends `chunk` to the blob, after every chunk written before it.
    ///
    /// Suspends until the blob sink has taken the bytes. When a progress
    /// heartbeat is due it is written first, so a session that was ended
    /// elsewhere never receives the chunk.
    ///
    /// # Errors
    /// - `Storage` if the append fails; the session is abandoned.
    /// - `InvalidState` if the session was ended elsewhere; the blob keeps
    ///   what was written before.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), IngestError> {
        self.keep_alive().await?;
        let Some(writer) = self.writer.as_mut() else {
            return Err(self.ended());
        };

        match writer.append(chunk).await {
            Ok(()) => {}
            Err(BlobError::Sealed(_)) => {
                // The reaper sealed the blob between heartbeats.
                self.writer = None;
                return Err(self.lose_session().await);
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "blob append failed, abandoning stream");
                self.abandon_in_place().await;
                return Err(e.into());
            }
        }
        self.stats.record(chunk);
        Ok(())
    }

    /// Writes a progress heartbeat if one is due. Called by [`write`] and
    /// by a worker that is waiting for bytes.
    ///
    /// # Errors
    /// `InvalidState` once the session has ended, here or elsewhere.
    ///
    /// [`write`]: Self::write
    pub async fn keep_alive(&mut self) -> Result<(), IngestError> {
        if self.writer.is_none() {
            return Err(self.ended());
        }
        if self.last_progress.elapsed() >= self.progress_interval {
            self.heartbeat().await?;
        }
        Ok(())
    }

    /// Graceful end: finalizes the blob and moves the session to CLOSED.
    /// The only way a session becomes CLOSED.
    ///
    /// # Errors
    /// - `Storage` if finalizing fails; the session is abandoned instead.
    /// - `InvalidState` if the session was ended elsewhere first.
    pub async fn close(mut self) -> Result<StreamStats, IngestError> {
        let Some(writer) = self.writer.take() else {
            return Err(self.ended());
        };

        match writer.finalize().await {
            Ok(receipt) => {
                self.end(SessionStatus::Closed).await?;
                tracing::info!(
                    session_id = %self.session_id,
                    bytes = receipt.size,
                    chunks = self.stats.chunks(),
                    anomalous = self.stats.anomalous(),
                    "stream closed"
                );
                Ok(self.stats)
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "blob finalize failed, abandoning stream");
                self.end(SessionStatus::Abandoned).await?;
                Err(e.into())
            }
        }
    }

    /// Ungraceful end: keeps whatever bytes were written and moves the
    /// session to ABANDONED. A handle that already ended is left as is.
    pub async fn abandon(mut self) -> Result<StreamStats, IngestError> {
        if self.status != SessionStatus::Streaming {
            return Ok(self.stats);
        }
        if let Some(writer) = self.writer.take() {
            finalize_quietly(&self.session_id, writer).await;
        }
        self.end(SessionStatus::Abandoned).await?;
        tracing::warn!(
            session_id = %self.session_id,
            bytes = self.stats.len(),
            "stream abandoned"
        );
        Ok(self.stats)
    }

    async fn heartbeat(&mut self) -> Result<(), IngestError> {
        let kept = self
            .ledger
            .compare_and_transition(
                &self.session_id,
                SessionStatus::Streaming,
                SessionStatus::Streaming,
                progress(&self.stats).last_activity(Utc::now()),
            )
            .await?;
        self.last_progress = Instant::now();

        if !kept {
            return Err(self.lose_session().await);
        }
        tracing::trace!(session_id = %self.session_id, bytes = self.stats.len(), "progress recorded");
        Ok(())
    }

    /// The session was ended elsewhere: stop writing and keep what the
    /// blob already holds.
    async fn lose_session(&mut self) -> IngestError {
        if let Some(writer) = self.writer.take() {
            finalize_quietly(&self.session_id, writer).await;
        }
        match self.ledger.get(&self.session_id).await {
            Ok(record) => {
                self.status = record.map_or(SessionStatus::Abandoned, |record| record.status);
            }
            Err(e) => return e.into(),
        }
        tracing::warn!(session_id = %self.session_id, status = %self.status, "stream lost its session");
        self.ended()
    }

    async fn abandon_in_place(&mut self) {
        if let Some(writer) = self.writer.take() {
            finalize_quietly(&self.session_id, writer).await;
        }
        if let Err(e) = self.end(SessionStatus::Abandoned).await {
            tracing::error!(session_id = %self.session_id, error = %e, "could not abandon stream");
        }
    }

    /// Moves the session from STREAMING to `target`, recording the final
    /// statistics.
    async fn end(&mut self, target: SessionStatus) -> Result<(), IngestError> {
        let ended = end_stream(&*self.ledger, &self.session_id, target, &self.stats).await?;
        if ended {
            self.status = target;
            return Ok(());
        }

        self.status = self
            .ledger
            .get(&self.session_id)
            .await?
            .map_or(SessionStatus::Abandoned, |record| record.status);
        Err(self.ended())
    }

    fn ended(&self) -> IngestError {
        SessionError::InvalidState {
            session_id: self.session_id.clone(),
            status: self.status,
        }
        .into()
    }
}

impl<L: Ledger, W: BlobWriter> Drop for StreamHandle<L, W> {
    fn drop(&mut self) {
        if self.status != SessionStatus::Streaming {
            return;
        }

        let session_id = self.session_id.clone();
        let ledger = Arc::clone(&self.ledger);
        let writer = self.writer.take();
        let stats = self.stats;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Some(writer) = writer {
                        finalize_quietly(&session_id, writer).await;
                    }
                    match end_stream(&*ledger, &session_id, SessionStatus::Abandoned, &stats).await {
                        Ok(true) => tracing::warn!(%session_id, bytes = stats.len(), "dropped stream abandoned"),
                        Ok(false) => {}
                        Err(e) => tracing::error!(%session_id, error = %e, "could not abandon dropped stream"),
                    }
                });
            }
            Err(_) => {
                tracing::warn!(%session_id, "stream dropped outside a runtime, leaving it to the reaper");
            }
        }
    }
}

fn progress(stats: &StreamStats) -> Transition {
    Transition::new()
        .bytes_written(stats.len())
        .longest_zero_run(stats.longest_zero_run())
}

async fn end_stream<L: Ledger>(
    ledger: &L,
    session_id: &SessionId,
    target: SessionStatus,
    stats: &StreamStats,
) -> Result<bool, LedgerError> {
    let now = Utc::now();
    ledger
        .compare_and_transition(
            session_id,
            SessionStatus::Streaming,
            target,
            progress(stats).closed_at(now).last_activity(now),
        )
        .await
}

async fn finalize_quietly<W: BlobWriter>(session_id: &SessionId, writer: W) {
    match writer.finalize().await {
        Ok(_) => {}
        Err(BlobError::Sealed(locator)) => {
            tracing::debug!(%session_id, %locator, "blob already sealed by the reaper");
        }
        Err(e) => tracing::warn!(%session_id, error = %e, "could not finalize partial blob"),
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for `IngestEngine` and `StreamHandle` with an in-memory
    //! ledger and a temporary blob directory.

    use demoline_ledger::SqliteLedger;
    use demoline_session::{SessionConfig, SessionMetadata, StaticCredentials};
    use tempfile::TempDir;

    use super::*;
    use crate::FsBlobSink;

    type Engine = IngestEngine<StaticCredentials, SqliteLedger, FsBlobSink>;

    /// The engine plus the scratch directory its blobs live in, which is
    /// removed when the guard drops.
    async fn engine_with(config: IngestConfig) -> (Engine, TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let credentials = StaticCredentials::new().with_key("k1", "100").with_key("k2", "200");
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let admission = Admission::new(Arc::new(credentials), Arc::new(ledger), SessionConfig::default());
        let blobs = FsBlobSink::new(dir.path().join("blobs")).await.unwrap();
        (IngestEngine::new(admission, Arc::new(blobs), config), dir)
    }

    async fn engine() -> (Engine, TempDir) {
        engine_with(IngestConfig::default()).await
    }

    async fn open(engine: &Engine, key: &str) -> SessionId {
        engine
            .admission()
            .open_session(
                key,
                SessionMetadata {
                    demo_name: "demo".into(),
                    source_address: "169.254.0.1:27015".into(),
                    map: "pl_swiftwater_final1".into(),
                },
            )
            .await
            .unwrap()
            .session_id
    }

    async fn status(engine: &Engine, id: &SessionId) -> SessionStatus {
        engine.admission().ledger().get(id).await.unwrap().unwrap().status
    }

    // =====================================================================
    // attach()
    // =====================================================================

    #[tokio::test]
    async fn test_attach_open_session_moves_to_streaming() {
        let (engine, _dir) = engine().await;
        let id = open(&engine, "k1").await;

        let handle = engine.attach("k1", &id).await.expect("should attach");

        assert_eq!(handle.session_id(), &id);
        let row = engine.admission().ledger().get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Streaming);
        assert_eq!(row.blob_locator.as_deref(), Some(format!("{id}.dem").as_str()));
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_twice_second_returns_invalid_state() {
        let (engine, _dir) = engine().await;
        let id = open(&engine, "k1").await;
        let handle = engine.attach("k1", &id).await.unwrap();

        let second = engine.attach("k1", &id).await;

        assert!(matches!(
            second,
            Err(IngestError::Session(SessionError::InvalidState {
                status: SessionStatus::Streaming,
                ..
            }))
        ));
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_wrong_key_returns_auth_failed_and_keeps_open() {
        let (engine, _dir) = engine().await;
        let id = open(&engine, "k1").await;

        let result = engine.attach("k2", &id).await;

        assert!(matches!(result, Err(IngestError::Session(SessionError::AuthFailed(_)))));
        assert_eq!(status(&engine, &id).await, SessionStatus::Open);
    }

    #[tokio::test]
    async fn test_attach_unknown_session_returns_not_found() {
        let (engine, _dir) = engine().await;
        let result = engine.attach("k1", &SessionId::new("nope")).await;
        assert!(matches!(result, Err(IngestError::Session(SessionError::NotFound(_)))));
    }

    #[tokio::test]
    async fn test_attach_when_blob_already_exists_abandons_session() {
        let (engine, _dir) = engine().await;
        let id = open(&engine, "k1").await;
        // Something already holds this session's blob.
        let _squatter = engine
            .blobs()
            .open_writer(&BlobLocator::for_session(&id))
            .await
            .unwrap();

        let result = engine.attach("k1", &id).await;

        assert!(matches!(result, Err(IngestError::Storage(_))));
        assert_eq!(status(&engine, &id).await, SessionStatus::Abandoned);
    }

    // =====================================================================
    // write() / close() / abandon()
    // =====================================================================

    #[tokio::test]
    async fn test_close_after_writes_commits_bytes_in_order() {
        let (engine, _dir) = engine().await;
        let id = open(&engine, "k1").await;
        let mut handle = engine.attach("k1", &id).await.unwrap();

        handle.write(b"abc").await.unwrap();
        handle.write(b"def").await.unwrap();
        let stats = handle.close().await.unwrap();

        assert_eq!(stats.len(), 6);
        let row = engine.admission().ledger().get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Closed);
        assert_eq!(row.bytes_written, 6);
        assert!(row.closed_at.is_some());
        let blob = engine.blobs().read(&BlobLocator::for_session(&id)).await.unwrap();
        assert_eq!(blob, b"abcdef");
    }

    #[tokio::test]
    async fn test_abandon_keeps_written_bytes() {
        let (engine, _dir) = engine().await;
        let id = open(&engine, "k1").await;
        let mut handle = engine.attach("k1", &id).await.unwrap();
        handle.write(b"partial").await.unwrap();

        handle.abandon().await.unwrap();

        assert_eq!(status(&engine, &id).await, SessionStatus::Abandoned);
        let blob = engine.blobs().read(&BlobLocator::for_session(&id)).await.unwrap();
        assert_eq!(blob, b"partial");
    }

    #[tokio::test]
    async fn test_drop_unfinished_handle_abandons_session() {
        let (engine, _dir) = engine().await;
        let id = open(&engine, "k1").await;
        let mut handle = engine.attach("k1", &id).await.unwrap();
        handle.write(b"abc").await.unwrap();

        drop(handle);

        let mut abandoned = false;
        for _ in 0..100 {
            if status(&engine, &id).await == SessionStatus::Abandoned {
                abandoned = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(abandoned, "dropped stream should end ABANDONED");
    }

    #[tokio::test]
    async fn test_attach_after_close_returns_invalid_state() {
        let (engine, _dir) = engine().await;
        let id = open(&engine, "k1").await;
        engine.attach("k1", &id).await.unwrap().close().await.unwrap();

        let result = engine.attach("k1", &id).await;

        assert!(matches!(
            result,
            Err(IngestError::Session(SessionError::InvalidState {
                status: SessionStatus::Closed,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_write_heartbeat_records_progress() {
        let (engine, _dir) = engine_with(IngestConfig {
            progress_interval: Duration::ZERO,
            ..IngestConfig::default()
        })
        .await;
        let id = open(&engine, "k1").await;
        let mut handle = engine.attach("k1", &id).await.unwrap();

        handle.write(&[0, 0, 0, 7]).await.unwrap();
        handle.keep_alive().await.unwrap();

        let row = engine.admission().ledger().get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Streaming);
        assert_eq!(row.bytes_written, 4);
        assert_eq!(row.longest_zero_run, 3);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_after_session_ended_elsewhere_returns_invalid_state() {
        let (engine, _dir) = engine_with(IngestConfig {
            progress_interval: Duration::ZERO,
            ..IngestConfig::default()
        })
        .await;
        let id = open(&engine, "k1").await;
        let mut handle = engine.attach("k1", &id).await.unwrap();
        // The reaper decides the stream is dead.
        engine
            .admission()
            .ledger()
            .compare_and_transition(
                &id,
                SessionStatus::Streaming,
                SessionStatus::Abandoned,
                Transition::new(),
            )
            .await
            .unwrap();

        let result = handle.write(b"late").await;

        assert!(matches!(
            result,
            Err(IngestError::Session(SessionError::InvalidState {
                status: SessionStatus::Abandoned,
                ..
            }))
        ));
        assert!(handle.write(b"more").await.is_err());
        let blob = engine.blobs().read(&BlobLocator::for_session(&id)).await.unwrap();
        assert!(blob.is_empty(), "a chunk arriving after the session ended must not land");
    }

    #[tokio::test]
    async fn test_write_after_blob_sealed_returns_invalid_state() {
        let (engine, _dir) = engine().await;
        let id = open(&engine, "k1").await;
        let mut handle = engine.attach("k1", &id).await.unwrap();
        handle.write(b"before").await.unwrap();
        // The reaper abandons the row and seals the blob while the worker
        // is between heartbeats.
        engine
            .admission()
            .ledger()
            .compare_and_transition(
                &id,
                SessionStatus::Streaming,
                SessionStatus::Abandoned,
                Transition::new(),
            )
            .await
            .unwrap();
        engine.blobs().seal(&BlobLocator::for_session(&id)).await.unwrap();

        let result = handle.write(b"AFTER").await;

        assert!(matches!(
            result,
            Err(IngestError::Session(SessionError::InvalidState {
                status: SessionStatus::Abandoned,
                ..
            }))
        ));
        let blob = engine.blobs().read(&BlobLocator::for_session(&id)).await.unwrap();
        assert_eq!(blob, b"before");
    }

    #[tokio::test]
    async fn test_keep_alive_without_writes_refreshes_activity() {
        let (engine, _dir) = engine_with(IngestConfig {
            progress_interval: Duration::ZERO,
            ..IngestConfig::default()
        })
        .await;
        let id = open(&engine, "k1").await;
        let mut handle = engine.attach("k1", &id).await.unwrap();
        let attached = engine.admission().ledger().get(&id).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.keep_alive().await.unwrap();

        let row = engine.admission().ledger().get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Streaming);
        assert!(row.last_activity > attached.last_activity);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_keep_alive_after_session_ended_returns_invalid_state() {
        let (engine, _dir) = engine_with(IngestConfig {
            progress_interval: Duration::ZERO,
            ..IngestConfig::default()
        })
        .await;
        let id = open(&engine, "k1").await;
        let mut handle = engine.attach("k1", &id).await.unwrap();
        engine
            .admission()
            .ledger()
            .compare_and_transition(
                &id,
                SessionStatus::Streaming,
                SessionStatus::Abandoned,
                Transition::new(),
            )
            .await
            .unwrap();

        assert!(handle.keep_alive().await.is_err());
        assert!(handle.keep_alive().await.is_err());
    }
}
