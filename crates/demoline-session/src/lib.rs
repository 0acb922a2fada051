//! Credential lookup and session admission for Demoline.
//!
//! This crate decides who may hold a session:
//!
//! 1. **Credentials**: resolving an API key to a user ([`CredentialStore`])
//! 2. **Admission**: creating at most one active session per key
//!    ([`Admission::open_session`]) and giving unused ones back
//!    ([`Admission::release`], [`Admission::expire_stale`])
//!
//! # How it fits in the stack
//!
//! ```text
//! Stream ingest (above)  ← re-validates ownership before attaching
//!     ↕
//! Session layer (this crate)  ← key lookup + admission rules
//!     ↕
//! Ledger (below)  ← durable rows, compare-and-transition
//! ```

mod admission;
mod config;
mod credentials;
mod error;

pub use admission::{Admission, SessionMetadata};
pub use config::{SessionConfig, generate_session_id, stale_cutoff};
pub use credentials::{CredentialStore, SqliteCredentials, StaticCredentials, UserIdentity};
pub use error::SessionError;
