//! Per-connection handler: one request, its reply, and for `Attach` the
//! demo stream that follows.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Receive one text frame → decode a `Request`
//!   2. Dispatch it to admission, ingest or the archive
//!   3. Send the reply (or an `Error` reply) and close

use std::sync::Arc;
use std::time::Duration;

use demoline_ingest::{BlobSink, BlobWriter, StreamHandle};
use demoline_ledger::Ledger;
use demoline_protocol::{Codec, ProtocolError, Reply, Request, SessionId};
use demoline_session::{CredentialStore, SessionMetadata};
use demoline_transport::{Connection, Frame, WebSocketConnection};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::DemolineError;
use crate::server::ServerState;

/// How long a new connection has to send its request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Size of the binary frames a fetched demo is sent in.
const FETCH_CHUNK_SIZE: usize = 64 * 1024;

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<C, L, B, K>(
    conn: WebSocketConnection,
    state: Arc<ServerState<C, L, B, K>>,
) -> Result<(), DemolineError>
where
    C: CredentialStore,
    L: Ledger,
    B: BlobSink,
    K: Codec,
{
    let conn_id = conn.id();
    tracing::debug!(%conn_id, peer = %conn.peer_addr(), "handling new connection");

    let result = match read_request(&conn, &state.codec).await {
        Ok(request) => {
            tracing::debug!(%conn_id, kind = request.kind(), "request received");
            dispatch(&conn, &state, request).await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = &result {
        if !matches!(e, DemolineError::Transport(_)) {
            let reply = Reply::Error {
                code: e.code(),
                message: e.to_string(),
            };
            if let Err(send_err) = send_reply(&conn, &state.codec, &reply).await {
                tracing::debug!(%conn_id, error = %send_err, "could not send error reply");
            }
        }
    }

    let _ = conn.close().await;
    result
}

/// Receives the opening request.
async fn read_request(
    conn: &WebSocketConnection,
    codec: &impl Codec,
) -> Result<Request, DemolineError> {
    let frame = match time::timeout(REQUEST_TIMEOUT, conn.recv()).await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => {
            return Err(ProtocolError::InvalidMessage(
                "connection closed before a request".into(),
            )
            .into());
        }
        Ok(Err(e)) => return Err(DemolineError::Transport(e)),
        Err(_) => {
            return Err(ProtocolError::InvalidMessage("request timed out".into()).into());
        }
    };

    match frame {
        Frame::Text(text) => Ok(codec.decode(text.as_bytes())?),
        Frame::Binary(_) => Err(ProtocolError::InvalidMessage(
            "first frame must be a text request".into(),
        )
        .into()),
    }
}

async fn dispatch<C, L, B, K>(
    conn: &WebSocketConnection,
    state: &ServerState<C, L, B, K>,
    request: Request,
) -> Result<(), DemolineError>
where
    C: CredentialStore,
    L: Ledger,
    B: BlobSink,
    K: Codec,
{
    match request {
        Request::OpenSession {
            api_key,
            demo_name,
            source_address,
            map,
        } => {
            let metadata = SessionMetadata {
                demo_name,
                source_address: source_address.unwrap_or_else(|| conn.peer_addr().to_string()),
                map,
            };
            let record = state.admission.open_session(&api_key, metadata).await?;
            send_reply(
                conn,
                &state.codec,
                &Reply::SessionOpened {
                    session_id: record.session_id,
                },
            )
            .await
        }

        Request::Release { api_key } => {
            let session_id = state.admission.release(&api_key).await?;
            send_reply(conn, &state.codec, &Reply::Released { session_id }).await
        }

        Request::Attach {
            api_key,
            session_id,
        } => stream(conn, state, &api_key, &session_id).await,

        Request::Finish => Err(ProtocolError::InvalidMessage(
            "Finish is only valid on an attached stream".into(),
        )
        .into()),

        Request::LateBytes {
            api_key,
            late_bytes,
        } => {
            let session_id = state.archive.submit_late_bytes(&api_key, &late_bytes).await?;
            send_reply(conn, &state.codec, &Reply::LateBytesAccepted { session_id }).await
        }

        Request::ListDemos {
            api_key,
            page_size,
            page_number,
        } => {
            let demos = state
                .archive
                .list_demos(&api_key, page_size, page_number)
                .await?;
            send_reply(conn, &state.codec, &Reply::DemoList { demos }).await
        }

        Request::FetchDemo {
            api_key,
            session_id,
        } => {
            let mut demo = state.archive.fetch_demo(&api_key, &session_id).await?;
            send_reply(
                conn,
                &state.codec,
                &Reply::DemoHeader {
                    session_id: demo.session_id.clone(),
                    size: demo.size(),
                },
            )
            .await?;
            while let Some(chunk) = demo.next_chunk(FETCH_CHUNK_SIZE).await? {
                conn.send(&chunk).await?;
            }
            send_reply(
                conn,
                &state.codec,
                &Reply::DemoEnd {
                    session_id: demo.session_id,
                },
            )
            .await
        }
    }
}

/// Attaches to `session_id` and relays binary frames into its blob until
/// the client sends `Finish` (CLOSED) or the stream is lost (ABANDONED).
async fn stream<C, L, B, K>(
    conn: &WebSocketConnection,
    state: &ServerState<C, L, B, K>,
    api_key: &str,
    session_id: &SessionId,
) -> Result<(), DemolineError>
where
    C: CredentialStore,
    L: Ledger,
    B: BlobSink,
    K: Codec,
{
    let mut handle = state.engine.attach(api_key, session_id).await?;

    let attached = Reply::Attached {
        session_id: session_id.clone(),
    };
    if let Err(e) = send_reply(conn, &state.codec, &attached).await {
        abandon(handle).await;
        return Err(e);
    }

    let idle_timeout = state.engine.config().idle_timeout;
    let mut heartbeat = time::interval(state.engine.config().progress_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.reset();
    let idle = time::sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        let received = tokio::select! {
            received = conn.recv() => received,
            _ = heartbeat.tick() => {
                // A slow sender still shows it is alive between chunks.
                if let Err(e) = handle.keep_alive().await {
                    tracing::info!(%session_id, error = %e, "stream lost its session while waiting");
                    return Err(e.into());
                }
                continue;
            }
            () = &mut idle => {
                tracing::info!(%session_id, ?idle_timeout, "stream idle, treating as disconnected");
                abandon(handle).await;
                return Ok(());
            }
        };
        idle.as_mut().reset(Instant::now() + idle_timeout);

        let frame = match received {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::info!(%session_id, "peer closed the stream without finishing");
                abandon(handle).await;
                return Ok(());
            }
            Err(e) => {
                tracing::info!(%session_id, error = %e, "stream connection lost");
                abandon(handle).await;
                return Err(e.into());
            }
        };

        match frame {
            Frame::Binary(chunk) => handle.write(&chunk).await?,
            Frame::Text(text) => match state.codec.decode::<Request>(text.as_bytes()) {
                Ok(Request::Finish) => {
                    let stats = handle.close().await?;
                    let closed = Reply::Closed {
                        session_id: session_id.clone(),
                        bytes: stats.len(),
                    };
                    return send_reply(conn, &state.codec, &closed).await;
                }
                Ok(other) => {
                    abandon(handle).await;
                    return Err(ProtocolError::InvalidMessage(format!(
                        "unexpected {} on an attached stream",
                        other.kind()
                    ))
                    .into());
                }
                Err(e) => {
                    abandon(handle).await;
                    return Err(e.into());
                }
            },
        }
    }
}

async fn abandon<L: Ledger, W: BlobWriter>(handle: StreamHandle<L, W>) {
    let session_id = handle.session_id().clone();
    if let Err(e) = handle.abandon().await {
        tracing::error!(%session_id, error = %e, "could not abandon stream");
    }
}

/// Encodes `reply` and sends it as a text frame.
async fn send_reply(
    conn: &WebSocketConnection,
    codec: &impl Codec,
    reply: &Reply,
) -> Result<(), DemolineError> {
    let text = codec.encode_text(reply)?;
    conn.send_text(&text).await?;
    Ok(())
}
