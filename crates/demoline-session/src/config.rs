//! Admission settings and session id generation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use demoline_protocol::SessionId;
use rand::Rng;

/// Configuration for session admission.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a session may sit OPEN without a stream attaching before
    /// it is abandoned.
    ///
    /// Default: 10 minutes.
    pub open_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(600),
        }
    }
}

/// Generates a random 32-character hex session id (128 bits).
///
/// The id also names the session's blob, so it must be unguessable and
/// safe to use as a file name.
pub fn generate_session_id() -> SessionId {
    let bytes: [u8; 16] = rand::rng().random();
    SessionId::new(bytes.iter().map(|b| format!("{b:02x}")).collect::<String>())
}

/// The instant `age` before `now`. Rows whose last activity is older
/// than this are stale. An age too large to represent yields the earliest
/// instant, so nothing is stale.
pub fn stale_cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
