//! `DemolineServer` builder and server loop.
//!
//! Ties the layers together: transport → protocol → session → ingest.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use demoline_ingest::{
    Archive, BlobSink, IngestConfig, IngestEngine, Reaper, ReaperConfig,
};
use demoline_ledger::Ledger;
use demoline_protocol::{Codec, JsonCodec};
use demoline_session::{Admission, CredentialStore, SessionConfig};
use demoline_transport::{DEFAULT_HANDSHAKE_TIMEOUT, Transport, WebSocketTransport};

use crate::DemolineError;
use crate::handler::handle_connection;

/// Shared server state passed to each connection handler task.
///
/// Holds no session table: every piece of session state lives in the
/// ledger, so this is read-only after startup.
pub(crate) struct ServerState<C, L, B, K: Codec> {
    pub(crate) admission: Admission<C, L>,
    pub(crate) engine: IngestEngine<C, L, B>,
    pub(crate) archive: Archive<C, L, B>,
    pub(crate) codec: K,
}

/// Builder for configuring and starting a Demoline server.
///
/// # Example
///
/// ```rust,ignore
/// use demoline::prelude::*;
///
/// let ledger = SqliteLedger::open("demoline.db".as_ref()).await?;
/// let credentials = SqliteCredentials::new(ledger.pool().clone());
/// let blobs = FsBlobSink::new("demos").await?;
///
/// let server = DemolineServerBuilder::new()
///     .bind("0.0.0.0:8080")
///     .build(credentials, ledger, blobs)
///     .await?;
/// server.run().await
/// ```
pub struct DemolineServerBuilder {
    bind_addr: String,
    handshake_timeout: Duration,
    session_config: SessionConfig,
    ingest_config: IngestConfig,
    reaper_config: ReaperConfig,
}

impl DemolineServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            session_config: SessionConfig::default(),
            ingest_config: IngestConfig::default(),
            reaper_config: ReaperConfig::default(),
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Sets how long a new peer has to complete the WebSocket upgrade.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the admission configuration.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Sets the stream configuration.
    pub fn ingest_config(mut self, config: IngestConfig) -> Self {
        self.ingest_config = config;
        self
    }

    /// Sets the reaper configuration.
    pub fn reaper_config(mut self, config: ReaperConfig) -> Self {
        self.reaper_config = config;
        self
    }

    /// Binds the listener and wires the layers together.
    ///
    /// Uses `JsonCodec` for control messages and `WebSocketTransport`.
    ///
    /// # Errors
    /// `Config` if the stream and reaper timings contradict each other,
    /// checked before anything is bound.
    pub async fn build<C, L, B>(
        self,
        credentials: C,
        ledger: L,
        blobs: B,
    ) -> Result<DemolineServer<C, L, B, JsonCodec>, DemolineError>
    where
        C: CredentialStore,
        L: Ledger,
        B: BlobSink,
    {
        check_timing(&self.ingest_config, &self.reaper_config)?;
        let transport =
            WebSocketTransport::bind_with(&self.bind_addr, self.handshake_timeout).await?;

        let blobs = Arc::new(blobs);
        let admission = Admission::new(Arc::new(credentials), Arc::new(ledger), self.session_config);
        let reaper = Reaper::new(admission.clone(), Arc::clone(&blobs), self.reaper_config);

        let state = Arc::new(ServerState {
            engine: IngestEngine::new(admission.clone(), Arc::clone(&blobs), self.ingest_config),
            archive: Archive::new(admission.clone(), blobs),
            admission,
            codec: JsonCodec,
        });

        Ok(DemolineServer {
            transport,
            state,
            reaper,
        })
    }
}

/// The reaper must never take a stream that is merely idle, or one that
/// heartbeats on schedule, for a dead one.
fn check_timing(ingest: &IngestConfig, reaper: &ReaperConfig) -> Result<(), DemolineError> {
    if ingest.idle_timeout.is_zero()
        || ingest.progress_interval.is_zero()
        || reaper.interval.is_zero()
    {
        return Err(DemolineError::Config(
            "idle timeout, progress interval and reaper interval must be non-zero".into(),
        ));
    }
    let stale = reaper.stale_stream_after;
    if stale <= ingest.idle_timeout || stale <= ingest.progress_interval {
        return Err(DemolineError::Config(format!(
            "stale stream threshold ({stale:?}) must exceed the idle timeout ({:?}) and the progress interval ({:?})",
            ingest.idle_timeout, ingest.progress_interval,
        )));
    }
    Ok(())
}

impl Default for DemolineServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound Demoline server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct DemolineServer<C, L, B, K: Codec> {
    transport: WebSocketTransport,
    state: Arc<ServerState<C, L, B, K>>,
    reaper: Reaper<C, L, B>,
}

impl<C, L, B, K> DemolineServer<C, L, B, K>
where
    C: CredentialStore,
    L: Ledger,
    B: BlobSink,
    K: Codec,
{
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// Runs the server until the process is terminated.
    pub async fn run(self) -> Result<(), DemolineError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the accept loop and the reaper until `shutdown` resolves.
    ///
    /// Each accepted connection gets its own task. Connections still
    /// streaming at shutdown are dropped with the runtime; their sessions
    /// are picked up by the reaper of the next run.
    pub async fn run_until(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), DemolineError> {
        let Self {
            mut transport,
            state,
            reaper,
        } = self;

        let reaper = tokio::spawn(reaper.run());
        tracing::info!("Demoline server running");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = transport.accept() => match accepted {
                    Ok(conn) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(conn, state).await {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "listener stopped");
                        reaper.abort();
                        return Err(e.into());
                    }
                },
            }
        }

        reaper.abort();
        Ok(())
    }
}
