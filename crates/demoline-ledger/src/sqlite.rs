//! SQLite-backed [`Ledger`].
//!
//! The one-active-session-per-key rule is a partial unique index
//! (`sessions_one_active_per_key`), and every status change is a single
//! `UPDATE ... WHERE session_id = ? AND status = ?`. Both hold across any
//! number of processes sharing the database file.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use demoline_protocol::{SessionId, UserId};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;

use crate::ledger::check_edge;
use crate::{Ledger, LedgerError, NewSession, SessionRecord, SessionStatus, Transition};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const COLUMNS: &str = "session_id, api_key, user_id, status, demo_name, source_address, \
     map, created_at, closed_at, last_activity, blob_locator, bytes_written, \
     longest_zero_run, late_bytes";

/// A [`Ledger`] stored in a SQLite database.
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Opens (creating if needed) the database at `path` and applies the
    /// schema migrations.
    ///
    /// # Errors
    /// Fails if the directory cannot be created, the database cannot be
    /// opened, or a migration fails.
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(Duration::from_secs(5)),
            )
            .await?;

        Self::from_pool(pool).await
    }

    /// Opens a private in-memory database. Used by tests and development
    /// servers; the data is gone when the ledger is dropped.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        // Every connection to `:memory:` is a separate database, so the
        // pool is pinned to one connection that never gets recycled.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, LedgerError> {
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying pool, shared with the credential tables.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_optional(
        &self,
        sql: &str,
        binds: &[&str],
    ) -> Result<Option<SessionRecord>, LedgerError> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let row = query.fetch_optional(&self.pool).await?;
        row.as_ref().map(decode_record).transpose()
    }
}

impl Ledger for SqliteLedger {
    async fn insert(&self, session: NewSession) -> Result<SessionRecord, LedgerError> {
        let session_id = session.session_id.clone();
        let record = session.into_record(Utc::now());

        let result = sqlx::query(
            "INSERT INTO sessions (session_id, api_key, user_id, status, demo_name, \
             source_address, map, created_at, last_activity) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.session_id.as_str())
        .bind(&record.api_key)
        .bind(record.user_id.as_str())
        .bind(record.status.as_str())
        .bind(&record.demo_name)
        .bind(&record.source_address)
        .bind(&record.map)
        .bind(encode_ts(record.created_at))
        .bind(encode_ts(record.last_activity))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                tracing::debug!(%session_id, "session row inserted");
                Ok(record)
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                if db.message().contains("sessions.session_id") {
                    Err(LedgerError::DuplicateSessionId(session_id))
                } else {
                    Err(LedgerError::ActiveSessionExists)
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, LedgerError> {
        self.fetch_optional(
            &format!("SELECT {COLUMNS} FROM sessions WHERE session_id = ?"),
            &[session_id.as_str()],
        )
        .await
    }

    async fn compare_and_transition(
        &self,
        session_id: &SessionId,
        expected: SessionStatus,
        new: SessionStatus,
        change: Transition,
    ) -> Result<bool, LedgerError> {
        check_edge(expected, new)?;

        let result = sqlx::query(
            "UPDATE sessions SET \
                 status = ?, \
                 closed_at = COALESCE(?, closed_at), \
                 last_activity = COALESCE(?, last_activity), \
                 blob_locator = COALESCE(?, blob_locator), \
                 bytes_written = COALESCE(?, bytes_written), \
                 longest_zero_run = COALESCE(?, longest_zero_run), \
                 late_bytes = COALESCE(?, late_bytes) \
             WHERE session_id = ? AND status = ?",
        )
        .bind(new.as_str())
        .bind(change.closed_at.map(encode_ts))
        .bind(change.last_activity.map(encode_ts))
        .bind(change.blob_locator)
        .bind(change.bytes_written.map(to_i64))
        .bind(change.longest_zero_run.map(to_i64))
        .bind(change.late_bytes)
        .bind(session_id.as_str())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() == 1;
        tracing::trace!(%session_id, %expected, %new, applied, "compare and transition");
        Ok(applied)
    }

    async fn find_active(&self, api_key: &str) -> Result<Option<SessionRecord>, LedgerError> {
        self.fetch_optional(
            &format!(
                "SELECT {COLUMNS} FROM sessions \
                 WHERE api_key = ? AND status IN ('open', 'streaming')"
            ),
            &[api_key],
        )
        .await
    }

    async fn find_stale(
        &self,
        status: SessionStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, LedgerError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM sessions \
             WHERE status = ? AND last_activity < ? ORDER BY last_activity"
        ))
        .bind(status.as_str())
        .bind(encode_ts(cutoff))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_record).collect()
    }

    async fn latest_terminal(
        &self,
        api_key: &str,
        status: SessionStatus,
    ) -> Result<Option<SessionRecord>, LedgerError> {
        self.fetch_optional(
            &format!(
                "SELECT {COLUMNS} FROM sessions WHERE api_key = ? AND status = ? \
                 ORDER BY closed_at DESC LIMIT 1"
            ),
            &[api_key, status.as_str()],
        )
        .await
    }

    async fn list_terminal(
        &self,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<SessionRecord>, LedgerError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM sessions WHERE status IN ('closed', 'abandoned') \
             ORDER BY created_at, session_id LIMIT ? OFFSET ?"
        ))
        .bind(i64::from(limit))
        .bind(to_i64(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_record).collect()
    }
}

// ---------------------------------------------------------------------------
// Row encoding
// ---------------------------------------------------------------------------

/// Fixed-width UTC timestamps, so string order is time order.
fn encode_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(raw: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LedgerError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64, column: &str) -> Result<u64, LedgerError> {
    u64::try_from(value).map_err(|_| LedgerError::Corrupt(format!("negative {column}")))
}

fn decode_record(row: &SqliteRow) -> Result<SessionRecord, LedgerError> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let closed_at: Option<String> = row.try_get("closed_at")?;
    let last_activity: String = row.try_get("last_activity")?;

    Ok(SessionRecord {
        session_id: SessionId::new(row.try_get::<String, _>("session_id")?),
        api_key: row.try_get("api_key")?,
        user_id: UserId::new(row.try_get::<String, _>("user_id")?),
        status: status.parse()?,
        demo_name: row.try_get("demo_name")?,
        source_address: row.try_get("source_address")?,
        map: row.try_get("map")?,
        created_at: decode_ts(&created_at)?,
        closed_at: closed_at.as_deref().map(decode_ts).transpose()?,
        last_activity: decode_ts(&last_activity)?,
        blob_locator: row.try_get("blob_locator")?,
        bytes_written: to_u64(row.try_get("bytes_written")?, "bytes_written")?,
        longest_zero_run: to_u64(row.try_get("longest_zero_run")?, "longest_zero_run")?,
        late_bytes: row.try_get("late_bytes")?,
    })
}
