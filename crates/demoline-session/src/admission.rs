//! Session admission: the only way a session comes into existence.
//!
//! Admission holds no session table of its own. Everything it knows it
//! reads from the [`Ledger`], and every change it makes is a single
//! ledger write, so several admission workers (or several server
//! processes sharing one database) can run side by side.
//!
//! ## Lifecycle
//!
//! ```text
//! open_session() ──→ [Open] ──(attach, ingest layer)──→ [Streaming]
//!                      │
//!                      ├──(release)──────→ [Abandoned]
//!                      └──(expire_stale)─→ [Abandoned]
//! ```

use std::sync::Arc;

use chrono::Utc;
use demoline_ledger::{Ledger, LedgerError, NewSession, SessionRecord, SessionStatus, Transition};
use demoline_protocol::SessionId;

use crate::config::stale_cutoff;
use crate::{CredentialStore, SessionConfig, SessionError, UserIdentity, generate_session_id};

/// Descriptive fields a client supplies when it asks for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetadata {
    pub demo_name: String,
    /// Address of the game server being recorded.
    pub source_address: String,
    pub map: String,
}

/// Admits new sessions and releases unattached ones.
pub struct Admission<C, L> {
    credentials: Arc<C>,
    ledger: Arc<L>,
    config: SessionConfig,
}

impl<C, L> Clone for Admission<C, L> {
    fn clone(&self) -> Self {
        Self {
            credentials: Arc::clone(&self.credentials),
            ledger: Arc::clone(&self.ledger),
            config: self.config.clone(),
        }
    }
}

impl<C: CredentialStore, L: Ledger> Admission<C, L> {
    pub fn new(credentials: Arc<C>, ledger: Arc<L>, config: SessionConfig) -> Self {
        Self {
            credentials,
            ledger,
            config,
        }
    }

    pub fn credentials(&self) -> &Arc<C> {
        &self.credentials
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Creates an OPEN session for `api_key`.
    ///
    /// No blob is allocated here; that waits for a stream to attach.
    ///
    /// # Errors
    /// - [`SessionError::AuthFailed`] for an unknown key.
    /// - [`SessionError::Conflict`] if the key already owns an OPEN or
    ///   STREAMING session, including one admitted concurrently.
    /// - [`SessionError::IdCollision`] if the generated id is taken.
    pub async fn open_session(
        &self,
        api_key: &str,
        metadata: SessionMetadata,
    ) -> Result<SessionRecord, SessionError> {
        let identity = self.credentials.lookup(api_key).await?;

        if let Some(existing) = self.ledger.find_active(api_key).await? {
            tracing::debug!(
                session_id = %existing.session_id,
                status = %existing.status,
                "admission refused, key already has an active session"
            );
            return Err(SessionError::Conflict);
        }

        let session = NewSession {
            session_id: generate_session_id(),
            api_key: api_key.to_owned(),
            user_id: identity.user_id,
            demo_name: metadata.demo_name,
            source_address: metadata.source_address,
            map: metadata.map,
        };

        // The pre-check above is only a fast path: two admissions can both
        // pass it, and the ledger's uniqueness rule picks the winner.
        let record = match self.ledger.insert(session).await {
            Ok(record) => record,
            Err(LedgerError::ActiveSessionExists) => return Err(SessionError::Conflict),
            Err(LedgerError::DuplicateSessionId(id)) => {
                tracing::error!(session_id = %id, "generated session id already exists");
                return Err(SessionError::IdCollision(id));
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            session_id = %record.session_id,
            user_id = %record.user_id,
            map = %record.map,
            "session opened"
        );
        Ok(record)
    }

    /// Abandons the key's OPEN session without a demo.
    ///
    /// A STREAMING session belongs to its stream worker and cannot be
    /// released from outside.
    ///
    /// # Errors
    /// - [`SessionError::AuthFailed`] for an unknown key.
    /// - [`SessionError::NoOpenSession`] if the key has no active session.
    /// - [`SessionError::InvalidState`] if the session is streaming, or
    ///   left OPEN between the read and the write.
    pub async fn release(&self, api_key: &str) -> Result<SessionId, SessionError> {
        self.credentials.lookup(api_key).await?;

        let record = self
            .ledger
            .find_active(api_key)
            .await?
            .ok_or(SessionError::NoOpenSession)?;

        if record.status != SessionStatus::Open {
            return Err(SessionError::InvalidState {
                session_id: record.session_id,
                status: record.status,
            });
        }

        let released = self
            .ledger
            .compare_and_transition(
                &record.session_id,
                SessionStatus::Open,
                SessionStatus::Abandoned,
                Transition::new().closed_at(Utc::now()),
            )
            .await?;

        if !released {
            return Err(self.current_state(&record.session_id).await?);
        }

        tracing::info!(session_id = %record.session_id, "session released without a demo");
        Ok(record.session_id)
    }

    /// Validates that `api_key` exists and owns `session_id`, returning
    /// the caller's identity and the session as currently stored.
    ///
    /// # Errors
    /// - [`SessionError::AuthFailed`] for an unknown key, or a key that
    ///   does not own the session.
    /// - [`SessionError::NotFound`] for an unknown session id.
    pub async fn authorize_owner(
        &self,
        api_key: &str,
        session_id: &SessionId,
    ) -> Result<(UserIdentity, SessionRecord), SessionError> {
        let identity = self.credentials.lookup(api_key).await?;

        let record = self
            .ledger
            .get(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

        if !record.is_owned_by(api_key) {
            tracing::warn!(%session_id, user_id = %identity.user_id, "key does not own session");
            return Err(SessionError::AuthFailed(
                "api key does not own this session".into(),
            ));
        }

        Ok((identity, record))
    }

    /// Returns the caller's identity if it holds the analyst role.
    ///
    /// # Errors
    /// [`SessionError::AuthFailed`] for an unknown key,
    /// [`SessionError::Forbidden`] for a non-analyst.
    pub async fn require_analyst(&self, api_key: &str) -> Result<UserIdentity, SessionError> {
        let identity = self.credentials.lookup(api_key).await?;
        if identity.analyst {
            Ok(identity)
        } else {
            Err(SessionError::Forbidden)
        }
    }

    /// Abandons every OPEN session that no stream attached to within
    /// [`SessionConfig::open_timeout`]. Returns the ids it abandoned.
    ///
    /// A session that attaches between the scan and the write is left
    /// alone: the compare-and-transition simply loses.
    pub async fn expire_stale(&self) -> Result<Vec<SessionId>, SessionError> {
        let now = Utc::now();
        let cutoff = stale_cutoff(now, self.config.open_timeout);
        let mut expired = Vec::new();

        for record in self.ledger.find_stale(SessionStatus::Open, cutoff).await? {
            let abandoned = self
                .ledger
                .compare_and_transition(
                    &record.session_id,
                    SessionStatus::Open,
                    SessionStatus::Abandoned,
                    Transition::new().closed_at(now),
                )
                .await?;

            if abandoned {
                tracing::warn!(
                    session_id = %record.session_id,
                    opened = %record.created_at,
                    "open session expired without a stream"
                );
                expired.push(record.session_id);
            }
        }

        Ok(expired)
    }

    /// Re-reads a session after a lost compare-and-transition and reports
    /// the state that beat us.
    pub async fn current_state(&self, session_id: &SessionId) -> Result<SessionError, SessionError> {
        let record = self
            .ledger
            .get(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
        Ok(SessionError::InvalidState {
            session_id: record.session_id,
            status: record.status,
        })
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    //! Unit tests for `Admission`, run against an in-memory ledger.
    //!
    //! Naming: `test_{function}_{scenario}_{expected}`.

    use std::time::Duration;

    use demoline_ledger::SqliteLedger;

    use super::*;
    use crate::StaticCredentials;

    // -- Helpers ----------------------------------------------------------

    async fn admission_with(config: SessionConfig) -> Admission<StaticCredentials, SqliteLedger> {
        let credentials = StaticCredentials::new()
            .with_key("k1", "100")
            .with_key("k2", "200")
            .with_analyst("analyst", "900");
        let ledger = SqliteLedger::in_memory().await.expect("ledger");
        Admission::new(Arc::new(credentials), Arc::new(ledger), config)
    }

    async fn admission() -> Admission<StaticCredentials, SqliteLedger> {
        admission_with(SessionConfig::default()).await
    }

    fn metadata() -> SessionMetadata {
        SessionMetadata {
            demo_name: "match.dem".into(),
            source_address: "169.254.0.1:27015".into(),
            map: "koth_product".into(),
        }
    }

    // =====================================================================
    // open_session()
    // =====================================================================

    #[tokio::test]
    async fn test_open_session_valid_key_returns_open_record() {
        let adm = admission().await;

        let record = adm.open_session("k1", metadata()).await.expect("should open");

        assert_eq!(record.status, SessionStatus::Open);
        assert_eq!(record.user_id.as_str(), "100");
        assert_eq!(record.map, "koth_product");
        assert!(record.blob_locator.is_none(), "no blob before attach");
        let stored = adm.ledger().get(&record.session_id).await.unwrap();
        assert_eq!(stored, Some(record));
    }

    #[tokio::test]
    async fn test_open_session_unknown_key_returns_auth_failed() {
        let adm = admission().await;

        let result = adm.open_session("stranger", metadata()).await;

        assert!(matches!(result, Err(SessionError::AuthFailed(_))));
        assert!(adm.ledger().find_active("stranger").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_session_second_for_same_key_returns_conflict() {
        let adm = admission().await;
        adm.open_session("k1", metadata()).await.unwrap();

        let result = adm.open_session("k1", metadata()).await;

        assert!(matches!(result, Err(SessionError::Conflict)));
    }

    #[tokio::test]
    async fn test_open_session_other_key_is_independent() {
        let adm = admission().await;
        let a = adm.open_session("k1", metadata()).await.unwrap();
        let b = adm.open_session("k2", metadata()).await.unwrap();
        assert_ne!(a.session_id, b.session_id);
    }

    // =====================================================================
    // release()
    // =====================================================================

    #[tokio::test]
    async fn test_release_open_session_abandons_and_frees_key() {
        let adm = admission().await;
        let opened = adm.open_session("k1", metadata()).await.unwrap();

        let released = adm.release("k1").await.expect("should release");

        assert_eq!(released, opened.session_id);
        let row = adm.ledger().get(&released).await.unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Abandoned);
        assert!(row.closed_at.is_some());
        adm.open_session("k1", metadata())
            .await
            .expect("key is admissible again");
    }

    #[tokio::test]
    async fn test_release_without_session_returns_no_open_session() {
        let adm = admission().await;
        let result = adm.release("k1").await;
        assert!(matches!(result, Err(SessionError::NoOpenSession)));
    }

    #[tokio::test]
    async fn test_release_streaming_session_returns_invalid_state() {
        let adm = admission().await;
        let opened = adm.open_session("k1", metadata()).await.unwrap();
        adm.ledger()
            .compare_and_transition(
                &opened.session_id,
                SessionStatus::Open,
                SessionStatus::Streaming,
                Transition::new(),
            )
            .await
            .unwrap();

        let result = adm.release("k1").await;

        assert!(matches!(
            result,
            Err(SessionError::InvalidState { status: SessionStatus::Streaming, .. })
        ));
    }

    // =====================================================================
    // authorize_owner() / require_analyst()
    // =====================================================================

    #[tokio::test]
    async fn test_authorize_owner_wrong_key_returns_auth_failed() {
        let adm = admission().await;
        let opened = adm.open_session("k1", metadata()).await.unwrap();

        let result = adm.authorize_owner("k2", &opened.session_id).await;

        assert!(matches!(result, Err(SessionError::AuthFailed(_))));
    }

    #[tokio::test]
    async fn test_authorize_owner_unknown_session_returns_not_found() {
        let adm = admission().await;
        let missing = SessionId::new("missing");

        let result = adm.authorize_owner("k1", &missing).await;

        assert!(matches!(result, Err(SessionError::NotFound(id)) if id == missing));
    }

    #[tokio::test]
    async fn test_require_analyst_regular_user_returns_forbidden() {
        let adm = admission().await;
        assert!(matches!(adm.require_analyst("k1").await, Err(SessionError::Forbidden)));
        assert!(adm.require_analyst("analyst").await.unwrap().analyst);
    }

    // =====================================================================
    // expire_stale()
    // =====================================================================

    #[tokio::test]
    async fn test_expire_stale_zero_timeout_abandons_open_sessions() {
        let adm = admission_with(SessionConfig {
            open_timeout: Duration::ZERO,
        })
        .await;
        let opened = adm.open_session("k1", metadata()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let expired = adm.expire_stale().await.unwrap();

        assert_eq!(expired, vec![opened.session_id.clone()]);
        let row = adm.ledger().get(&opened.session_id).await.unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Abandoned);
    }

    #[tokio::test]
    async fn test_expire_stale_long_timeout_keeps_fresh_sessions() {
        let adm = admission().await;
        adm.open_session("k1", metadata()).await.unwrap();

        let expired = adm.expire_stale().await.unwrap();

        assert!(expired.is_empty());
        assert!(adm.ledger().find_active("k1").await.unwrap().is_some());
    }
}
