use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use wayfarer_core::{BookingKind, BookingRecord, ConversationSession, PaymentStatus};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("column `{column}` of table `{table}` holds an unreadable value: {reason}")]
    Decode {
        table: &'static str,
        column: &'static str,
        reason: String,
    },
}

pub trait SessionRepository: Send + Sync {
    async fn load_session(&self, session_id: &str) -> Result<Option<ConversationSession>>;
    async fn upsert_session(&self, session: &ConversationSession) -> Result<()>;
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>>;
}

pub trait BookingRepository: Send + Sync {
    /// Persists a confirmed booking. Returns `false` when a booking with the
    /// same id already exists; the stored record is left untouched.
    async fn save_booking(&self, booking: &BookingRecord) -> Result<bool>;
    async fn past_bookings(&self, user_id: &str) -> Result<Vec<BookingRecord>>;
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    sessions: Arc<RwLock<HashMap<String, ConversationSession>>>,
    bookings: Arc<RwLock<Vec<BookingRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionRepository for MemoryStore {
    async fn load_session(&self, session_id: &str) -> Result<Option<ConversationSession>> {
        Ok(self.sessions.read().get(session_id).cloned())
    }

    async fn upsert_session(&self, session: &ConversationSession) -> Result<()> {
        self.sessions
            .write()
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        self.sessions.write().retain(|session_id, value| {
            let keep = value.expires_at > now;
            if !keep {
                removed.push(session_id.clone());
            }
            keep
        });

        Ok(removed)
    }
}

impl BookingRepository for MemoryStore {
    async fn save_booking(&self, booking: &BookingRecord) -> Result<bool> {
        let mut bookings = self.bookings.write();
        if bookings
            .iter()
            .any(|existing| existing.booking_id == booking.booking_id)
        {
            return Ok(false);
        }
        bookings.push(booking.clone());
        Ok(true)
    }

    async fn past_bookings(&self, user_id: &str) -> Result<Vec<BookingRecord>> {
        let mut bookings: Vec<BookingRecord> = self
            .bookings
            .read()
            .iter()
            .filter(|booking| booking.user_id == user_id)
            .cloned()
            .collect();
        bookings.sort_by(|lhs, rhs| rhs.created_at.cmp(&lhs.created_at));
        Ok(bookings)
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        // every connection to an in-memory database is a fresh database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .with_context(|| format!("failed connecting to sqlite at {}", database_url))?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
              session_id TEXT PRIMARY KEY,
              user_id TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL,
              expires_at TEXT NOT NULL,
              messages_json TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bookings (
              booking_id TEXT PRIMARY KEY,
              user_id TEXT NOT NULL,
              kind TEXT NOT NULL,
              payment_status TEXT NOT NULL,
              total_amount REAL NOT NULL,
              currency TEXT NOT NULL,
              starting_date TEXT NOT NULL,
              ending_date TEXT NOT NULL,
              origin TEXT NOT NULL,
              destination TEXT NOT NULL,
              details_json TEXT NOT NULL,
              created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS bookings_by_user ON bookings (user_id, created_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn parse_timestamp(table: &'static str, column: &'static str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|moment| moment.with_timezone(&Utc))
        .map_err(|error| {
            StorageError::Decode {
                table,
                column,
                reason: error.to_string(),
            }
            .into()
        })
}

fn booking_from_row(row: &SqliteRow) -> Result<BookingRecord> {
    let kind: String = row.get("kind");
    let status: String = row.get("payment_status");
    let details: String = row.get("details_json");
    let created_at: String = row.get("created_at");

    Ok(BookingRecord {
        booking_id: row.get("booking_id"),
        user_id: row.get("user_id"),
        kind: BookingKind::parse(&kind).ok_or_else(|| StorageError::Decode {
            table: "bookings",
            column: "kind",
            reason: format!("unknown booking kind `{kind}`"),
        })?,
        payment_status: PaymentStatus::parse(&status).ok_or_else(|| StorageError::Decode {
            table: "bookings",
            column: "payment_status",
            reason: format!("unknown payment status `{status}`"),
        })?,
        total_amount: row.get("total_amount"),
        currency: row.get("currency"),
        starting_date: row.get("starting_date"),
        ending_date: row.get("ending_date"),
        origin: row.get("origin"),
        destination: row.get("destination"),
        details: serde_json::from_str(&details).context("bookings.details_json is not JSON")?,
        created_at: parse_timestamp("bookings", "created_at", &created_at)?,
    })
}

impl SessionRepository for SqliteStore {
    async fn load_session(&self, session_id: &str) -> Result<Option<ConversationSession>> {
        let row = sqlx::query(
            r#"
            SELECT session_id, user_id, created_at, updated_at, expires_at, messages_json
            FROM sessions
            WHERE session_id = ?1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let messages_json: String = row.get("messages_json");
        let messages = serde_json::from_str(&messages_json)
            .with_context(|| format!("stored messages of session {session_id} are not JSON"))?;

        let session = ConversationSession {
            session_id: row.get("session_id"),
            user_id: row.get("user_id"),
            messages,
            created_at: parse_timestamp("sessions", "created_at", &row.get::<String, _>("created_at"))?,
            updated_at: parse_timestamp("sessions", "updated_at", &row.get::<String, _>("updated_at"))?,
            expires_at: parse_timestamp("sessions", "expires_at", &row.get::<String, _>("expires_at"))?,
        };

        Ok(Some(session))
    }

    async fn upsert_session(&self, session: &ConversationSession) -> Result<()> {
        let messages_json = serde_json::to_string(&session.messages)?;

        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, user_id, created_at, updated_at, expires_at, messages_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(session_id) DO UPDATE SET
              user_id=excluded.user_id,
              updated_at=excluded.updated_at,
              expires_at=excluded.expires_at,
              messages_json=excluded.messages_json
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.user_id)
        .bind(session.created_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(session.updated_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(session.expires_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(messages_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let rows = sqlx::query("DELETE FROM sessions WHERE expires_at < ?1 RETURNING session_id")
            .bind(now.to_rfc3339_opts(SecondsFormat::Micros, true))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(|row| row.get("session_id")).collect())
    }
}

impl BookingRepository for SqliteStore {
    async fn save_booking(&self, booking: &BookingRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO bookings (
              booking_id, user_id, kind, payment_status, total_amount, currency,
              starting_date, ending_date, origin, destination, details_json, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(booking_id) DO NOTHING
            "#,
        )
        .bind(&booking.booking_id)
        .bind(&booking.user_id)
        .bind(booking.kind.as_code())
        .bind(booking.payment_status.as_code())
        .bind(booking.total_amount)
        .bind(&booking.currency)
        .bind(&booking.starting_date)
        .bind(&booking.ending_date)
        .bind(&booking.origin)
        .bind(&booking.destination)
        .bind(serde_json::to_string(&booking.details)?)
        .bind(booking.created_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn past_bookings(&self, user_id: &str) -> Result<Vec<BookingRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT booking_id, user_id, kind, payment_status, total_amount, currency,
                   starting_date, ending_date, origin, destination, details_json, created_at
            FROM bookings
            WHERE user_id = ?1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(booking_from_row).collect()
    }
}

#[derive(Clone)]
pub enum Store {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl Store {
    pub fn memory() -> Self {
        Self::Memory(MemoryStore::new())
    }

    pub async fn sqlite(database_url: &str) -> Result<Self> {
        let sqlite = SqliteStore::connect(database_url).await?;
        Ok(Self::Sqlite(sqlite))
    }
}

impl SessionRepository for Store {
    async fn load_session(&self, session_id: &str) -> Result<Option<ConversationSession>> {
        match self {
            Store::Memory(store) => store.load_session(session_id).await,
            Store::Sqlite(store) => store.load_session(session_id).await,
        }
    }

    async fn upsert_session(&self, session: &ConversationSession) -> Result<()> {
        match self {
            Store::Memory(store) => store.upsert_session(session).await,
            Store::Sqlite(store) => store.upsert_session(session).await,
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        match self {
            Store::Memory(store) => store.purge_expired(now).await,
            Store::Sqlite(store) => store.purge_expired(now).await,
        }
    }
}

impl BookingRepository for Store {
    async fn save_booking(&self, booking: &BookingRecord) -> Result<bool> {
        match self {
            Store::Memory(store) => store.save_booking(booking).await,
            Store::Sqlite(store) => store.save_booking(booking).await,
        }
    }

    async fn past_bookings(&self, user_id: &str) -> Result<Vec<BookingRecord>> {
        match self {
            Store::Memory(store) => store.past_bookings(user_id).await,
            Store::Sqlite(store) => store.past_bookings(user_id).await,
        }
    }
}
