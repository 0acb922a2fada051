//! Stream and reaper settings.

use std::time::Duration;

/// Configuration for attached streams.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// A stream that delivers nothing for this long is treated as
    /// disconnected and abandoned.
    ///
    /// Default: 30 seconds.
    pub idle_timeout: Duration,

    /// Minimum time between progress heartbeats written to the ledger.
    ///
    /// Default: 5 seconds.
    pub progress_interval: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            progress_interval: Duration::from_secs(5),
        }
    }
}

/// Configuration for the background reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Time between sweeps.
    ///
    /// Default: 30 seconds.
    pub interval: Duration,

    /// A STREAMING session whose last heartbeat is older than this is
    /// assumed to have lost its worker. Must comfortably exceed
    /// [`IngestConfig::idle_timeout`].
    ///
    /// Default: 2 minutes.
    pub stale_stream_after: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_stream_after: Duration::from_secs(120),
        }
    }
}
