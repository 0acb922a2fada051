//! Core protocol types for Demoline's control channel.
//!
//! Every connection opens with exactly one [`Request`] sent as a text
//! frame. The server answers with one or more [`Reply`] frames. Only an
//! `Attach` request keeps the connection open for demo bytes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Identifier of one demo-streaming session.
///
/// Opaque to clients. The server generates it at admission and it also
/// determines where the session's blob lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wraps an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the user an API key belongs to (a Steam ID in practice).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wraps an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

/// One finished demo as shown to analysts.
///
/// The owner is never exposed directly; `anonymous_id` is stable for a
/// given (owner, requester) pair so an analyst can group demos by player
/// without learning who the player is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoListing {
    pub session_id: SessionId,
    pub anonymous_id: String,
    pub demo_name: String,
    pub map: String,
    /// `"closed"` or `"abandoned"`.
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub demo_size: u64,
}

// ---------------------------------------------------------------------------
// Request: client → server
// ---------------------------------------------------------------------------

/// Control messages sent by clients.
///
/// Internally tagged, so `Finish` is `{"type":"Finish"}` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Ask for a new session. Fails if the key already holds one.
    OpenSession {
        api_key: String,
        demo_name: String,
        /// Address of the game server being recorded. Defaults to the
        /// peer address of the connection when absent.
        #[serde(default)]
        source_address: Option<String>,
        map: String,
    },

    /// Bind this connection to an open session. Every binary frame after
    /// the `Attached` reply is appended to the session's demo.
    Attach {
        api_key: String,
        session_id: SessionId,
    },

    /// Graceful end of an attached stream.
    Finish,

    /// Give up the key's open session without streaming anything.
    Release { api_key: String },

    /// Hex-encoded header patch for the key's most recent finished demo.
    LateBytes { api_key: String, late_bytes: String },

    /// Page through finished demos (analysts only).
    ListDemos {
        api_key: String,
        #[serde(default)]
        page_size: Option<u32>,
        #[serde(default)]
        page_number: Option<u32>,
    },

    /// Download one finished demo (analysts only).
    FetchDemo {
        api_key: String,
        session_id: SessionId,
    },
}

impl Request {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OpenSession { .. } => "OpenSession",
            Self::Attach { .. } => "Attach",
            Self::Finish => "Finish",
            Self::Release { .. } => "Release",
            Self::LateBytes { .. } => "LateBytes",
            Self::ListDemos { .. } => "ListDemos",
            Self::FetchDemo { .. } => "FetchDemo",
        }
    }
}

// ---------------------------------------------------------------------------
// Reply: server → client
// ---------------------------------------------------------------------------

/// Control messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Reply {
    SessionOpened { session_id: SessionId },
    Attached { session_id: SessionId },
    /// The stream was finalized; `bytes` is the committed blob length.
    Closed { session_id: SessionId, bytes: u64 },
    Released { session_id: SessionId },
    LateBytesAccepted { session_id: SessionId },
    DemoList { demos: Vec<DemoListing> },
    /// Precedes the binary frames of a fetched demo.
    DemoHeader { session_id: SessionId, size: u64 },
    /// Follows the last binary frame of a fetched demo.
    DemoEnd { session_id: SessionId },
    /// The request failed. `code` follows HTTP conventions
    /// (401 unknown key, 409 conflict, 412 wrong session state, ...).
    Error { code: u16, message: String },
}
