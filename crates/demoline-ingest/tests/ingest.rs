//! End-to-end behaviour of admission, ingest, reaper and archive over a
//! shared SQLite ledger and an on-disk blob directory.

use std::sync::Arc;
use std::time::Duration;

use demoline_ingest::{
    Archive, BlobLocator, BlobSink, FsBlobSink, IngestConfig, IngestEngine, IngestError,
    LATE_BYTES_RANGE, Reaper, ReaperConfig,
};
use demoline_ledger::{Ledger, SessionStatus, SqliteLedger};
use demoline_protocol::SessionId;
use demoline_session::{
    Admission, SessionConfig, SessionError, SessionMetadata, StaticCredentials,
};
use tempfile::TempDir;

// =========================================================================
// Fixture
// =========================================================================

struct Fixture {
    admission: Admission<StaticCredentials, SqliteLedger>,
    engine: IngestEngine<StaticCredentials, SqliteLedger, FsBlobSink>,
    archive: Archive<StaticCredentials, SqliteLedger, FsBlobSink>,
    blobs: Arc<FsBlobSink>,
    /// Removes the ledger and blob directory when the test ends.
    _dir: TempDir,
}

async fn fixture_with(session: SessionConfig) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = Arc::new(SqliteLedger::open(&dir.path().join("ledger.db")).await.unwrap());
    let blobs = Arc::new(FsBlobSink::new(dir.path().join("demos")).await.unwrap());
    let credentials = Arc::new(
        StaticCredentials::new()
            .with_key("K1", "76561198000000001")
            .with_key("K2", "76561198000000002")
            .with_analyst("ANALYST", "76561198000000009"),
    );

    let admission = Admission::new(credentials, ledger, session);
    Fixture {
        engine: IngestEngine::new(admission.clone(), Arc::clone(&blobs), IngestConfig::default()),
        archive: Archive::new(admission.clone(), Arc::clone(&blobs)),
        admission,
        blobs,
        _dir: dir,
    }
}

async fn fixture() -> Fixture {
    fixture_with(SessionConfig::default()).await
}

fn stale_now() -> ReaperConfig {
    ReaperConfig {
        stale_stream_after: Duration::ZERO,
        ..ReaperConfig::default()
    }
}

fn metadata() -> SessionMetadata {
    SessionMetadata {
        demo_name: "2024-05-01_pl_upward.dem".into(),
        source_address: "169.254.10.10:27015".into(),
        map: "pl_upward".into(),
    }
}

impl Fixture {
    async fn status(&self, id: &SessionId) -> SessionStatus {
        self.admission.ledger().get(id).await.unwrap().unwrap().status
    }

    async fn fetch_all(&self, id: &SessionId) -> (u64, Vec<u8>) {
        let mut demo = self.archive.fetch_demo("ANALYST", id).await.unwrap();
        let mut bytes = Vec::new();
        while let Some(chunk) = demo.next_chunk(100).await.unwrap() {
            assert!(chunk.len() <= 100);
            bytes.extend_from_slice(&chunk);
        }
        (demo.size(), bytes)
    }

    async fn stream_and_close(&self, key: &str, bytes: &[u8]) -> SessionId {
        let id = self.admission.open_session(key, metadata()).await.unwrap().session_id;
        let mut handle = self.engine.attach(key, &id).await.unwrap();
        handle.write(bytes).await.unwrap();
        handle.close().await.unwrap();
        id
    }
}

// =========================================================================
// The basic scenario
// =========================================================================

#[tokio::test]
async fn test_scenario_admit_conflict_attach_write_close() {
    let fx = fixture().await;

    let s1 = fx.admission.open_session("K1", metadata()).await.unwrap().session_id;
    assert!(matches!(
        fx.admission.open_session("K1", metadata()).await,
        Err(SessionError::Conflict)
    ));

    let mut handle = fx.engine.attach("K1", &s1).await.unwrap();
    assert_eq!(fx.status(&s1).await, SessionStatus::Streaming);
    handle.write(b"abc").await.unwrap();
    handle.write(b"def").await.unwrap();
    handle.close().await.unwrap();

    assert_eq!(fx.status(&s1).await, SessionStatus::Closed);
    let blob = fx.blobs.read(&BlobLocator::for_session(&s1)).await.unwrap();
    assert_eq!(blob, b"abcdef");
}

#[tokio::test]
async fn test_round_trip_many_chunks_byte_identical() {
    let fx = fixture().await;
    let id = fx.admission.open_session("K1", metadata()).await.unwrap().session_id;
    let mut handle = fx.engine.attach("K1", &id).await.unwrap();

    let mut sent = Vec::new();
    for i in 0..200u32 {
        let chunk: Vec<u8> = (0..(i % 37 + 1)).map(|j| (i * 31 + j) as u8).collect();
        handle.write(&chunk).await.unwrap();
        sent.extend_from_slice(&chunk);
    }
    let stats = handle.close().await.unwrap();

    assert_eq!(stats.len(), sent.len() as u64);
    assert_eq!(fx.blobs.read(&BlobLocator::for_session(&id)).await.unwrap(), sent);
}

// =========================================================================
// Concurrency
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_attach_concurrent_exactly_one_streams() {
    let fx = fixture().await;
    let id = fx.admission.open_session("K1", metadata()).await.unwrap().session_id;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let engine = fx.engine.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move { engine.attach("K1", &id).await }));
    }

    let mut handles = Vec::new();
    let mut refused = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(handle) => handles.push(handle),
            Err(IngestError::Session(SessionError::InvalidState { .. })) => refused += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(handles.len(), 1);
    assert_eq!(refused, 9);
    let handle = handles.pop().unwrap();
    handle.close().await.unwrap();
    assert_eq!(fx.status(&id).await, SessionStatus::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_mid_stream_ends_abandoned() {
    let fx = fixture().await;
    let id = fx.admission.open_session("K1", metadata()).await.unwrap().session_id;
    let engine = fx.engine.clone();
    let worker_id = id.clone();

    // The worker task dies mid-stream, taking its handle with it.
    let worker = tokio::spawn(async move {
        let mut handle = engine.attach("K1", &worker_id).await.unwrap();
        handle.write(b"first half").await.unwrap();
        std::future::pending::<()>().await;
    });
    while fx.status(&id).await != SessionStatus::Streaming {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    worker.abort();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while fx.status(&id).await == SessionStatus::Streaming {
        assert!(tokio::time::Instant::now() < deadline, "still STREAMING");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(fx.status(&id).await, SessionStatus::Abandoned);
    assert_eq!(
        fx.blobs.read(&BlobLocator::for_session(&id)).await.unwrap(),
        b"first half"
    );
}

// =========================================================================
// Attach refusals
// =========================================================================

#[tokio::test]
async fn test_attach_other_users_session_is_auth_error_and_no_change() {
    let fx = fixture().await;
    let id = fx.admission.open_session("K1", metadata()).await.unwrap().session_id;

    let result = fx.engine.attach("K2", &id).await;

    assert!(matches!(result, Err(IngestError::Session(SessionError::AuthFailed(_)))));
    assert_eq!(fx.status(&id).await, SessionStatus::Open);
}

#[tokio::test]
async fn test_attach_terminal_sessions_is_invalid_state_without_writes() {
    let fx = fixture().await;
    let closed = fx.stream_and_close("K1", b"done").await;
    let released = fx.admission.open_session("K2", metadata()).await.unwrap().session_id;
    fx.admission.release("K2").await.unwrap();

    for (key, id) in [("K1", &closed), ("K2", &released)] {
        let result = fx.engine.attach(key, id).await;
        assert!(
            matches!(result, Err(IngestError::Session(SessionError::InvalidState { .. }))),
            "attach to {id} should be refused"
        );
    }
    assert_eq!(
        fx.blobs.read(&BlobLocator::for_session(&closed)).await.unwrap(),
        b"done"
    );
    assert!(fx.blobs.read(&BlobLocator::for_session(&released)).await.is_err());
}

// =========================================================================
// Reaper
// =========================================================================

#[tokio::test]
async fn test_reaper_expires_unattached_and_spares_streaming() {
    let fx = fixture_with(SessionConfig {
        open_timeout: Duration::ZERO,
    })
    .await;
    let idle = fx.admission.open_session("K1", metadata()).await.unwrap().session_id;
    let live = fx.admission.open_session("K2", metadata()).await.unwrap().session_id;
    let handle = fx.engine.attach("K2", &live).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let reaper = Reaper::new(fx.admission.clone(), Arc::clone(&fx.blobs), ReaperConfig::default());
    let report = reaper.sweep().await.unwrap();

    assert_eq!(report.expired_open, vec![idle.clone()]);
    assert!(report.abandoned_streams.is_empty());
    assert_eq!(fx.status(&idle).await, SessionStatus::Abandoned);
    assert_eq!(fx.status(&live).await, SessionStatus::Streaming);
    handle.close().await.unwrap();
}

#[tokio::test]
async fn test_reaper_abandons_stale_stream_and_seals_blob() {
    let fx = fixture().await;
    let id = fx.admission.open_session("K1", metadata()).await.unwrap().session_id;
    let mut handle = fx.engine.attach("K1", &id).await.unwrap();
    handle.write(b"orphan").await.unwrap();
    // A hung worker: the handle is leaked, so nothing abandons the session
    // and the `.part` file is never finalized.
    std::mem::forget(handle);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let reaper = Reaper::new(fx.admission.clone(), Arc::clone(&fx.blobs), stale_now());
    let report = reaper.sweep().await.unwrap();

    assert_eq!(report.abandoned_streams, vec![id.clone()]);
    assert_eq!(fx.status(&id).await, SessionStatus::Abandoned);
    assert_eq!(
        fx.blobs.read(&BlobLocator::for_session(&id)).await.unwrap(),
        b"orphan"
    );
    assert!(reaper.sweep().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reaper_sealed_blob_refuses_writes_from_stalled_worker() {
    let fx = fixture().await;
    let id = fx.admission.open_session("K1", metadata()).await.unwrap().session_id;
    let mut handle = fx.engine.attach("K1", &id).await.unwrap();
    handle.write(b"before").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let reaper = Reaper::new(fx.admission.clone(), Arc::clone(&fx.blobs), stale_now());
    assert_eq!(reaper.sweep().await.unwrap().abandoned_streams, vec![id.clone()]);

    // The worker wakes up and carries on.
    let late = handle.write(b"AFTER").await;

    assert!(matches!(
        late,
        Err(IngestError::Session(SessionError::InvalidState {
            status: SessionStatus::Abandoned,
            ..
        }))
    ));
    assert!(handle.close().await.is_err());
    assert_eq!(fx.status(&id).await, SessionStatus::Abandoned);
    assert_eq!(
        fx.blobs.read(&BlobLocator::for_session(&id)).await.unwrap(),
        b"before"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reaper_racing_live_writer_keeps_only_acknowledged_bytes() {
    let fx = fixture().await;
    let id = fx.admission.open_session("K1", metadata()).await.unwrap().session_id;
    let mut handle = fx.engine.attach("K1", &id).await.unwrap();

    // Writes until the session is taken away, remembering every chunk the
    // engine accepted.
    let worker = tokio::spawn(async move {
        let mut acknowledged = Vec::new();
        let mut n = 0u32;
        loop {
            let chunk = n.to_le_bytes();
            if let Err(e) = handle.write(&chunk).await {
                return (acknowledged, e);
            }
            acknowledged.extend_from_slice(&chunk);
            n = n.wrapping_add(1);
            tokio::task::yield_now().await;
        }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let reaper = Reaper::new(fx.admission.clone(), Arc::clone(&fx.blobs), stale_now());
    let report = reaper.sweep().await.unwrap();
    let (acknowledged, error) = tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker should notice the sealed blob")
        .unwrap();

    assert_eq!(report.abandoned_streams, vec![id.clone()]);
    assert!(matches!(
        error,
        IngestError::Session(SessionError::InvalidState {
            status: SessionStatus::Abandoned,
            ..
        })
    ));
    assert_eq!(fx.status(&id).await, SessionStatus::Abandoned);
    assert_eq!(
        fx.blobs.read(&BlobLocator::for_session(&id)).await.unwrap(),
        acknowledged
    );
}

// =========================================================================
// Archive
// =========================================================================

#[tokio::test]
async fn test_late_bytes_are_spliced_into_fetched_demo() {
    let fx = fixture().await;
    let id = fx.stream_and_close("K1", &vec![0xEE; 0x500]).await;

    let patched = fx
        .archive
        .submit_late_bytes("K1", &"ab".repeat(16))
        .await
        .unwrap();
    let (size, demo) = fx.fetch_all(&id).await;

    assert_eq!(patched, id);
    assert_eq!(size, 0x500);
    assert_eq!(demo.len(), 0x500);
    assert!(demo[LATE_BYTES_RANGE].iter().all(|&b| b == 0xAB));
    assert_eq!(demo[0], 0xEE);
    assert_eq!(demo[LATE_BYTES_RANGE.end], 0xEE);
    // The stored blob is untouched.
    let raw = fx.blobs.read(&BlobLocator::for_session(&id)).await.unwrap();
    assert!(raw.iter().all(|&b| b == 0xEE));
}

#[tokio::test]
async fn test_late_bytes_wrong_length_or_no_closed_session_rejected() {
    let fx = fixture().await;

    assert!(matches!(
        fx.archive.submit_late_bytes("K1", "abcd").await,
        Err(IngestError::InvalidLateBytes(_))
    ));
    assert!(matches!(
        fx.archive.submit_late_bytes("K1", &"zz".repeat(16)).await,
        Err(IngestError::InvalidLateBytes(_))
    ));
    assert!(matches!(
        fx.archive.submit_late_bytes("K1", &"00".repeat(16)).await,
        Err(IngestError::NothingToPatch)
    ));
}

#[tokio::test]
async fn test_list_demos_analyst_only_and_anonymised() {
    let fx = fixture().await;
    fx.stream_and_close("K1", b"one").await;
    fx.stream_and_close("K2", b"two").await;
    fx.admission.open_session("K1", metadata()).await.unwrap();

    assert!(matches!(
        fx.archive.list_demos("K1", None, None).await,
        Err(IngestError::Session(SessionError::Forbidden))
    ));

    let all = fx.archive.list_demos("ANALYST", None, None).await.unwrap();
    assert_eq!(all.len(), 2, "the open session is not listed");
    assert_ne!(all[0].anonymous_id, all[1].anonymous_id);
    assert!(all.iter().all(|d| d.status == "closed" && d.demo_size == 3));

    let second_page = fx.archive.list_demos("ANALYST", Some(1), Some(2)).await.unwrap();
    assert_eq!(second_page.len(), 1);
    assert_eq!(second_page[0].session_id, all[1].session_id);
}

#[tokio::test]
async fn test_fetch_demo_refuses_live_and_unknown_sessions() {
    let fx = fixture().await;
    let open = fx.admission.open_session("K1", metadata()).await.unwrap().session_id;

    assert!(matches!(
        fx.archive.fetch_demo("ANALYST", &open).await,
        Err(IngestError::Session(SessionError::InvalidState { status: SessionStatus::Open, .. }))
    ));
    assert!(matches!(
        fx.archive.fetch_demo("ANALYST", &SessionId::new("missing")).await,
        Err(IngestError::Session(SessionError::NotFound(_)))
    ));
    assert!(matches!(
        fx.archive.fetch_demo("K1", &open).await,
        Err(IngestError::Session(SessionError::Forbidden))
    ));

    fx.admission.release("K1").await.unwrap();
    assert!(matches!(
        fx.archive.fetch_demo("ANALYST", &open).await,
        Err(IngestError::NoDemo)
    ));
}
