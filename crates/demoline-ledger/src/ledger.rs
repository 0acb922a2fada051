//! The data-access contract over session records.

use std::future::Future;

use chrono::{DateTime, Utc};
use demoline_protocol::SessionId;

use crate::{LedgerError, NewSession, SessionRecord, SessionStatus, Transition};

/// Durable store of session records.
///
/// Implementations must make [`compare_and_transition`](Self::compare_and_transition)
/// a single conditional update and must reject an [`insert`](Self::insert)
/// for a key that already owns an active session. Those two guarantees are
/// the only concurrency control in the system: there is no lock around the
/// ledger, and several server processes may share one.
pub trait Ledger: Send + Sync + 'static {
    /// Inserts a new OPEN session.
    ///
    /// # Errors
    /// - [`LedgerError::ActiveSessionExists`] if the key already owns an
    ///   OPEN or STREAMING session (checked by the store, not the caller).
    /// - [`LedgerError::DuplicateSessionId`] if the id is taken.
    fn insert(
        &self,
        session: NewSession,
    ) -> impl Future<Output = Result<SessionRecord, LedgerError>> + Send;

    /// Reads one session.
    fn get(
        &self,
        session_id: &SessionId,
    ) -> impl Future<Output = Result<Option<SessionRecord>, LedgerError>> + Send;

    /// Atomically moves `session_id` from `expected` to `new`, writing the
    /// non-`None` fields of `change` in the same statement.
    ///
    /// Returns `Ok(false)` if the row does not exist or its status is not
    /// `expected`; nothing is written in that case. Never retries.
    ///
    /// # Errors
    /// [`LedgerError::IllegalTransition`] if `expected → new` is not a
    /// lifecycle edge.
    fn compare_and_transition(
        &self,
        session_id: &SessionId,
        expected: SessionStatus,
        new: SessionStatus,
        change: Transition,
    ) -> impl Future<Output = Result<bool, LedgerError>> + Send;

    /// Returns the key's OPEN or STREAMING session, if any.
    fn find_active(
        &self,
        api_key: &str,
    ) -> impl Future<Output = Result<Option<SessionRecord>, LedgerError>> + Send;

    /// Returns sessions in `status` whose `last_activity` is before `cutoff`.
    fn find_stale(
        &self,
        status: SessionStatus,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<SessionRecord>, LedgerError>> + Send;

    /// Returns the key's most recently closed session in `status`.
    fn latest_terminal(
        &self,
        api_key: &str,
        status: SessionStatus,
    ) -> impl Future<Output = Result<Option<SessionRecord>, LedgerError>> + Send;

    /// Pages through CLOSED and ABANDONED sessions, oldest first.
    fn list_terminal(
        &self,
        limit: u32,
        offset: u64,
    ) -> impl Future<Output = Result<Vec<SessionRecord>, LedgerError>> + Send;
}

/// Checks that `expected → new` is a lifecycle edge.
pub(crate) fn check_edge(
    expected: SessionStatus,
    new: SessionStatus,
) -> Result<(), LedgerError> {
    if expected.can_transition_to(new) {
        Ok(())
    } else {
        Err(LedgerError::IllegalTransition {
            from: expected,
            to: new,
        })
    }
}
