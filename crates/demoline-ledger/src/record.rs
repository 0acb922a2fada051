//! Session records and the lifecycle they move through.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use demoline_protocol::{SessionId, UserId};

use crate::LedgerError;

// ---------------------------------------------------------------------------
// SessionStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a session row.
///
/// ```text
///   Open ──(attach)──→ Streaming ──(finish)──→ Closed
///     │                    │
///     │ (release/timeout)  │ (disconnect/error/stale)
///     ▼                    ▼
///  Abandoned ◄─────────────┘
/// ```
///
/// `Streaming → Streaming` is the progress heartbeat and
/// `Closed → Closed` attaches late bytes; both keep the status but still
/// go through compare-and-transition so they cannot race a terminal
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Open,
    Streaming,
    Closed,
    Abandoned,
}

impl SessionStatus {
    /// Returns `true` for the states that count against the one-per-key rule.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Open | Self::Streaming)
    }

    /// Returns `true` once the session can never change status again.
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Returns `true` if `self → target` is an edge of the lifecycle.
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Open, Self::Streaming)
                | (Self::Open, Self::Abandoned)
                | (Self::Streaming, Self::Streaming)
                | (Self::Streaming, Self::Closed)
                | (Self::Streaming, Self::Abandoned)
                | (Self::Closed, Self::Closed)
        )
    }

    /// The value stored in the `status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Streaming => "streaming",
            Self::Closed => "closed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "streaming" => Ok(Self::Streaming),
            "closed" => Ok(Self::Closed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(LedgerError::Corrupt(format!("unknown status {other:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionRecord
// ---------------------------------------------------------------------------

/// One row of the session ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: SessionId,
    /// The API key that owns this session.
    pub api_key: String,
    pub user_id: UserId,
    pub status: SessionStatus,
    pub demo_name: String,
    pub source_address: String,
    pub map: String,
    pub created_at: DateTime<Utc>,
    /// Set by the terminal transition.
    pub closed_at: Option<DateTime<Utc>>,
    /// Creation time, then the attach time, then each progress heartbeat.
    pub last_activity: DateTime<Utc>,
    /// Set when a stream attaches.
    pub blob_locator: Option<String>,
    pub bytes_written: u64,
    pub longest_zero_run: u64,
    pub late_bytes: Option<Vec<u8>>,
}

impl SessionRecord {
    /// Returns `true` if `api_key` owns this session.
    pub fn is_owned_by(&self, api_key: &str) -> bool {
        self.api_key == api_key
    }
}

/// The fields supplied at admission.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_id: SessionId,
    pub api_key: String,
    pub user_id: UserId,
    pub demo_name: String,
    pub source_address: String,
    pub map: String,
}

impl NewSession {
    /// Builds the OPEN record this admission produces at time `now`.
    pub fn into_record(self, now: DateTime<Utc>) -> SessionRecord {
        let now = now.trunc_subsecs(6);
        SessionRecord {
            session_id: self.session_id,
            api_key: self.api_key,
            user_id: self.user_id,
            status: SessionStatus::Open,
            demo_name: self.demo_name,
            source_address: self.source_address,
            map: self.map,
            created_at: now,
            closed_at: None,
            last_activity: now,
            blob_locator: None,
            bytes_written: 0,
            longest_zero_run: 0,
            late_bytes: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// Extra columns written together with a status change.
///
/// `None` leaves the stored value untouched.
///
/// ```rust
/// use chrono::Utc;
/// use demoline_ledger::Transition;
///
/// let change = Transition::new().closed_at(Utc::now()).bytes_written(6);
/// assert_eq!(change.bytes_written, Some(6));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    pub closed_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub blob_locator: Option<String>,
    pub bytes_written: Option<u64>,
    pub longest_zero_run: Option<u64>,
    pub late_bytes: Option<Vec<u8>>,
}

impl Transition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn closed_at(mut self, at: DateTime<Utc>) -> Self {
        self.closed_at = Some(at);
        self
    }

    pub fn last_activity(mut self, at: DateTime<Utc>) -> Self {
        self.last_activity = Some(at);
        self
    }

    pub fn blob_locator(mut self, locator: impl Into<String>) -> Self {
        self.blob_locator = Some(locator.into());
        self
    }

    pub fn bytes_written(mut self, bytes: u64) -> Self {
        self.bytes_written = Some(bytes);
        self
    }

    pub fn longest_zero_run(mut self, run: u64) -> Self {
        self.longest_zero_run = Some(run);
        self
    }

    pub fn late_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.late_bytes = Some(bytes);
        self
    }
}
