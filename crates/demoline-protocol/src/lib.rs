//! Wire protocol for Demoline.
//!
//! This crate defines what clients and the server say to each other:
//!
//! - **Types** ([`Request`], [`Reply`], [`SessionId`], [`UserId`], etc.):
//!   the control messages that travel as text frames.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how those messages
//!   are converted to/from bytes.
//! - **Errors** ([`ProtocolError`]): what can go wrong during
//!   encoding/decoding.
//!
//! Demo bytes themselves never pass through this crate: once a stream is
//! attached, binary frames are relayed untouched.
//!
//! ```text
//! Transport (frames) → Protocol (Request/Reply) → Session / Ingest
//! ```

mod codec;
mod error;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use types::{DemoListing, Reply, Request, SessionId, UserId};
