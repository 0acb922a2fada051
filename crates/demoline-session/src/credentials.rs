//! Credential lookup: turning an opaque API key into a user identity.
//!
//! Demoline does not issue keys itself. Keys are provisioned out of band
//! (see [`SqliteCredentials::provision`]) and the server only ever reads
//! them. The [`CredentialStore`] trait is the seam: production uses the
//! `api_keys` table next to the ledger, tests use [`StaticCredentials`].

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use demoline_protocol::UserId;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::SessionError;

/// Who an API key belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: UserId,
    /// Analysts may list and download other users' demos.
    pub analyst: bool,
}

/// Resolves API keys to identities.
///
/// `Send + Sync + 'static` so one store can be shared by every connection
/// task for the lifetime of the server.
///
/// # Example
///
/// ```rust
/// use demoline_protocol::UserId;
/// use demoline_session::{CredentialStore, SessionError, UserIdentity};
///
/// /// Every key is its own user. Development only.
/// struct OpenDoor;
///
/// impl CredentialStore for OpenDoor {
///     async fn lookup(&self, api_key: &str) -> Result<UserIdentity, SessionError> {
///         Ok(UserIdentity { user_id: UserId::new(api_key), analyst: false })
///     }
/// }
/// ```
pub trait CredentialStore: Send + Sync + 'static {
    /// Returns the identity behind `api_key`.
    ///
    /// # Errors
    /// - [`SessionError::AuthFailed`] if the key is unknown.
    /// - [`SessionError::Ledger`] if the backing store is unreachable.
    fn lookup(
        &self,
        api_key: &str,
    ) -> impl std::future::Future<Output = Result<UserIdentity, SessionError>> + Send;
}

// ---------------------------------------------------------------------------
// StaticCredentials
// ---------------------------------------------------------------------------

/// A fixed in-memory key table.
///
/// ```rust
/// use demoline_session::StaticCredentials;
///
/// let creds = StaticCredentials::new()
///     .with_key("k1", "76561198000000001")
///     .with_analyst("k2", "76561198000000002");
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    keys: HashMap<String, UserIdentity>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a regular user's key.
    pub fn with_key(mut self, api_key: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.keys.insert(
            api_key.into(),
            UserIdentity {
                user_id: UserId::new(user_id),
                analyst: false,
            },
        );
        self
    }

    /// Adds an analyst's key.
    pub fn with_analyst(
        mut self,
        api_key: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        self.keys.insert(
            api_key.into(),
            UserIdentity {
                user_id: UserId::new(user_id),
                analyst: true,
            },
        );
        self
    }
}

impl CredentialStore for StaticCredentials {
    async fn lookup(&self, api_key: &str) -> Result<UserIdentity, SessionError> {
        self.keys
            .get(api_key)
            .cloned()
            .ok_or_else(|| SessionError::AuthFailed("unknown api key".into()))
    }
}

// ---------------------------------------------------------------------------
// SqliteCredentials
// ---------------------------------------------------------------------------

/// Keys stored in the `api_keys` / `analysts` tables of the ledger
/// database. Share the pool with [`SqliteLedger::pool`].
///
/// [`SqliteLedger::pool`]: demoline_ledger::SqliteLedger::pool
#[derive(Debug, Clone)]
pub struct SqliteCredentials {
    pool: SqlitePool,
}

impl SqliteCredentials {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stores `api_key` for `user_id`, replacing any key the user had
    /// before, and grants or revokes the analyst role.
    pub async fn provision(
        &self,
        user_id: &UserId,
        api_key: &str,
        analyst: bool,
    ) -> Result<(), SessionError> {
        let mut tx = self.pool.begin().await.map_err(ledger_error)?;

        sqlx::query("INSERT OR REPLACE INTO api_keys (api_key, user_id, created_at) VALUES (?, ?, ?)")
            .bind(api_key)
            .bind(user_id.as_str())
            .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
            .execute(&mut *tx)
            .await
            .map_err(ledger_error)?;

        let role = if analyst {
            "INSERT OR IGNORE INTO analysts (user_id) VALUES (?)"
        } else {
            "DELETE FROM analysts WHERE user_id = ?"
        };
        sqlx::query(role)
            .bind(user_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(ledger_error)?;

        tx.commit().await.map_err(ledger_error)?;
        tracing::info!(%user_id, analyst, "api key provisioned");
        Ok(())
    }
}

impl CredentialStore for SqliteCredentials {
    async fn lookup(&self, api_key: &str) -> Result<UserIdentity, SessionError> {
        let row = sqlx::query(
            "SELECT k.user_id, \
                    EXISTS (SELECT 1 FROM analysts a WHERE a.user_id = k.user_id) AS analyst \
             FROM api_keys k WHERE k.api_key = ?",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(ledger_error)?
        .ok_or_else(|| SessionError::AuthFailed("unknown api key".into()))?;

        let user_id: String = row.try_get("user_id").map_err(ledger_error)?;
        let analyst: i64 = row.try_get("analyst").map_err(ledger_error)?;
        Ok(UserIdentity {
            user_id: UserId::new(user_id),
            analyst: analyst != 0,
        })
    }
}

fn ledger_error(e: sqlx::Error) -> SessionError {
    SessionError::Ledger(e.into())
}
