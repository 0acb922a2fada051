//! # Demoline
//!
//! Demo recording ingest server.
//!
//! A game client asks for a session with its API key, then streams the
//! demo it is recording over a WebSocket. Demoline guarantees that a key
//! holds at most one live session, that the bytes land in the session's
//! blob in order, and that a stream which vanishes mid-recording ends up
//! ABANDONED rather than stuck.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use demoline::prelude::*;
//!
//! # async fn start() -> Result<(), DemolineError> {
//! let ledger = SqliteLedger::in_memory().await?;
//! let credentials = StaticCredentials::new().with_key("secret", "76561198000000001");
//! let blobs = FsBlobSink::new("demos").await.map_err(IngestError::from)?;
//!
//! let server = DemolineServerBuilder::new()
//!     .bind("0.0.0.0:8080")
//!     .build(credentials, ledger, blobs)
//!     .await?;
//! server.run().await
//! # }
//! ```

mod error;
mod handler;
mod server;

pub use error::DemolineError;
pub use server::{DemolineServer, DemolineServerBuilder};

pub mod prelude {
    //! Everything needed to configure and run a server.

    pub use crate::{DemolineError, DemolineServer, DemolineServerBuilder};
    pub use demoline_ingest::{
        BlobSink, BlobWriter, FsBlobSink, IngestConfig, IngestError, ReaperConfig,
    };
    pub use demoline_ledger::{Ledger, SessionStatus, SqliteLedger};
    pub use demoline_protocol::{DemoListing, Reply, Request, SessionId, UserId};
    pub use demoline_session::{
        CredentialStore, SessionConfig, SessionError, SqliteCredentials, StaticCredentials,
        UserIdentity,
    };
}
