//! Demo stream ingest for Demoline.
//!
//! Once admission has created an OPEN session, this crate takes over:
//!
//! - [`IngestEngine::attach`] binds one live stream to the session and
//!   hands back the exclusive [`StreamHandle`] its bytes go through.
//! - [`BlobSink`] is where those bytes land ([`FsBlobSink`] on disk).
//! - [`Reaper`] reclaims sessions whose client or worker disappeared.
//! - [`Archive`] serves finished demos to analysts and accepts late
//!   header bytes.
//!
//! # How it fits in the stack
//!
//! ```text
//! Server (above)  ← one task per connection drives a StreamHandle
//!     ↕
//! Ingest (this crate)  ← attach / write / close / abandon, blob storage
//!     ↕
//! Session + Ledger (below)  ← ownership checks, compare-and-transition
//! ```

mod archive;
mod blob;
mod config;
mod engine;
mod error;
mod fs;
mod reaper;
mod stats;

pub use archive::{
    Archive, DemoStream, LATE_BYTES_LEN, LATE_BYTES_RANGE, MAX_PAGE_SIZE, anonymous_id,
    splice_late_bytes,
};
pub use blob::{BlobLocator, BlobReceipt, BlobSink, BlobWriter};
pub use config::{IngestConfig, ReaperConfig};
pub use engine::{IngestEngine, StreamHandle};
pub use error::{BlobError, IngestError};
pub use fs::{FsBlobSink, FsBlobWriter};
pub use reaper::{ReapReport, Reaper};
pub use stats::{ANOMALOUS_ZERO_RUN, StreamStats};
