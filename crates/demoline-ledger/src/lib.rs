//! Session ledger for Demoline.
//!
//! The ledger is the record of truth for every session: who owns it,
//! where it is in its lifecycle, and where its demo blob lives. Rows are
//! never deleted; a session ends with a status change.
//!
//! # How it fits in the stack
//!
//! ```text
//! Session admission / stream ingest (above)  ← all writes go through here
//!     ↕
//! Ledger (this crate)  ← insert + compare-and-transition on SQLite
//! ```

mod error;
mod ledger;
mod record;
mod sqlite;

pub use error::LedgerError;
pub use ledger::Ledger;
pub use record::{NewSession, SessionRecord, SessionStatus, Transition};
pub use sqlite::SqliteLedger;
