//! SQLite-backed RecordStore implementation.
//! Keeps policies and issuance records across restarts.
//!
//! Enable with the `sqlite` feature flag:
//! ```toml
//! allot-core = { path = "../allot-core", features = ["sqlite"] }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::sync::{Arc, Mutex};

use crate::error::PortError;
use crate::infrastructure::RecordStore;
use crate::types::{IssuanceRecord, IssuanceStatus, ResourcePolicy};

const RECORD_COLUMNS: &str = "record_id, resource_id, requester_id, quantity, status, order_ref,
     created_at, confirmed_at, used_at, canceled_at, updated_at";

/// A durable record store backed by SQLite.
///
/// Uses WAL mode for concurrent read performance. Statements run on the
/// blocking pool; the connection is shared behind a mutex.
#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS policies (
                resource_id TEXT PRIMARY KEY,
                body        TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS records (
                record_id    TEXT PRIMARY KEY,
                resource_id  TEXT NOT NULL,
                requester_id TEXT NOT NULL,
                quantity     INTEGER NOT NULL,
                status       TEXT NOT NULL,
                order_ref    TEXT,
                created_at   INTEGER NOT NULL,
                confirmed_at INTEGER,
                used_at      INTEGER,
                canceled_at  INTEGER,
                updated_at   INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_records_requester ON records(resource_id, requester_id);
            CREATE INDEX IF NOT EXISTS idx_records_status ON records(resource_id, status);",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, PortError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, PortError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&conn)
        })
        .await
        .map_err(|e| PortError::Connection(e.to_string()))?
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<IssuanceRecord> {
        let status: String = row.get(4)?;
        let status = IssuanceStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("unknown status '{status}'").into(),
            )
        })?;

        Ok(IssuanceRecord {
            record_id: row.get(0)?,
            resource_id: row.get(1)?,
            requester_id: row.get(2)?,
            quantity: row.get(3)?,
            status,
            order_ref: row.get(5)?,
            created_at: from_millis(row.get(6)?),
            confirmed_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
            used_at: row.get::<_, Option<i64>>(8)?.map(from_millis),
            canceled_at: row.get::<_, Option<i64>>(9)?.map(from_millis),
            updated_at: from_millis(row.get(10)?),
        })
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn command(e: rusqlite::Error) -> PortError {
    PortError::Command(e.to_string())
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn load_policy(&self, resource_id: &str) -> Result<Option<ResourcePolicy>, PortError> {
        let resource_id = resource_id.to_string();
        let body: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT body FROM policies WHERE resource_id = ?1",
                    params![resource_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(command)
            })
            .await?;

        body.map(|body| serde_json::from_str(&body).map_err(PortError::from))
            .transpose()
    }

    async fn save_policy(&self, policy: &ResourcePolicy) -> Result<(), PortError> {
        let resource_id = policy.resource_id.clone();
        let body = serde_json::to_string(policy)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO policies (resource_id, body) VALUES (?1, ?2)
                 ON CONFLICT(resource_id) DO UPDATE SET body = excluded.body",
                params![resource_id, body],
            )
            .map(|_| ())
            .map_err(command)
        })
        .await
    }

    async fn find_record(
        &self,
        resource_id: &str,
        requester_id: &str,
    ) -> Result<Option<IssuanceRecord>, PortError> {
        let resource_id = resource_id.to_string();
        let requester_id = requester_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records
                     WHERE resource_id = ?1 AND requester_id = ?2
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![resource_id, requester_id],
                Self::row_to_record,
            )
            .optional()
            .map_err(command)
        })
        .await
    }

    async fn find_by_id(&self, record_id: &str) -> Result<Option<IssuanceRecord>, PortError> {
        let record_id = record_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM records WHERE record_id = ?1"),
                params![record_id],
                Self::row_to_record,
            )
            .optional()
            .map_err(command)
        })
        .await
    }

    async fn save(&self, record: IssuanceRecord) -> Result<IssuanceRecord, PortError> {
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO records ({RECORD_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    record.record_id,
                    record.resource_id,
                    record.requester_id,
                    record.quantity,
                    record.status.as_str(),
                    record.order_ref,
                    record.created_at.timestamp_millis(),
                    record.confirmed_at.map(|t| t.timestamp_millis()),
                    record.used_at.map(|t| t.timestamp_millis()),
                    record.canceled_at.map(|t| t.timestamp_millis()),
                    record.updated_at.timestamp_millis(),
                ],
            )
            .map_err(command)?;
            Ok(record)
        })
        .await
    }

    async fn exists_eligible(
        &self,
        resource_id: &str,
        requester_id: &str,
        blocking: &[IssuanceStatus],
    ) -> Result<bool, PortError> {
        if blocking.is_empty() {
            return Ok(false);
        }
        let resource_id = resource_id.to_string();
        let requester_id = requester_id.to_string();
        let statuses: Vec<&'static str> = blocking.iter().map(|s| s.as_str()).collect();

        self.with_conn(move |conn| {
            let placeholders = (0..statuses.len())
                .map(|i| format!("?{}", i + 3))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT EXISTS(SELECT 1 FROM records
                 WHERE resource_id = ?1 AND requester_id = ?2 AND status IN ({placeholders}))"
            );

            let mut args: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(statuses.len() + 2);
            args.push(&resource_id);
            args.push(&requester_id);
            args.extend(statuses.iter().map(|s| s as &dyn rusqlite::ToSql));

            conn.query_row(&sql, args.as_slice(), |row| row.get::<_, bool>(0))
                .map_err(command)
        })
        .await
    }

    async fn held_quantity(&self, resource_id: &str) -> Result<i64, PortError> {
        let resource_id = resource_id.to_string();
        let holding: Vec<&'static str> = IssuanceStatus::HOLDING.iter().map(|s| s.as_str()).collect();

        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(quantity), 0) FROM records
                 WHERE resource_id = ?1 AND status IN (?2, ?3, ?4)",
                params![resource_id, holding[0], holding[1], holding[2]],
                |row| row.get(0),
            )
            .map_err(command)
        })
        .await
    }
}
