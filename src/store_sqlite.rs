//! SQLite implementation of [`RegistrationStore`].
//!
//! Persistent storage that survives process restarts. Synchronous
//! `rusqlite` calls run on the blocking pool so the async workers are
//! never stalled; a single shared connection keeps every operation
//! atomic with respect to the others.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};

use crate::error::{Result, WebhookError};
use crate::store::{RegistrationStore, DUE_CHECK_AGE_MINUTES};
use crate::types::{
    CarrierId, DeliveryLog, DeliveryLogInput, NewRegistration, RegistrationPatch, WebhookId,
    WebhookRegistration,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS webhook_registrations (
    id TEXT PRIMARY KEY,
    carrier_id TEXT NOT NULL,
    tracking_number TEXT NOT NULL,
    callback_url TEXT NOT NULL,
    expiration_time TEXT NOT NULL,
    created_at TEXT NOT NULL,
    active INTEGER NOT NULL,
    last_checksum TEXT,
    last_checked_at TEXT,
    delivery_attempts INTEGER NOT NULL DEFAULT 0,
    last_delivery_at TEXT,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_registrations_subject
    ON webhook_registrations (carrier_id, tracking_number);
CREATE INDEX IF NOT EXISTS idx_registrations_expiration
    ON webhook_registrations (expiration_time);
CREATE INDEX IF NOT EXISTS idx_registrations_active_checked
    ON webhook_registrations (active, last_checked_at);

CREATE TABLE IF NOT EXISTS webhook_delivery_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    webhook_registration_id TEXT NOT NULL,
    attempt_number INTEGER NOT NULL,
    status_code INTEGER,
    success INTEGER NOT NULL,
    error_message TEXT,
    request_body TEXT NOT NULL,
    response_body TEXT,
    delivered_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_delivery_logs_registration
    ON webhook_delivery_logs (webhook_registration_id);
CREATE INDEX IF NOT EXISTS idx_delivery_logs_delivered_at
    ON webhook_delivery_logs (delivered_at);
";

/// File-backed registration store.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(WebhookError::internal)?;
            }
        }
        let conn = Connection::open(path).map_err(WebhookError::internal)?;
        Self::init(conn)
    }

    /// Fully in-memory database; contents die with the process.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(WebhookError::internal)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_millis(5000))
            .map_err(WebhookError::internal)?;
        // Returns the resulting mode as a row, so query rather than execute.
        let _mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(WebhookError::internal)?;
        conn.execute_batch(SCHEMA).map_err(WebhookError::internal)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| WebhookError::Internal("store mutex poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(WebhookError::internal)?
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    // Fixed-width UTC form so lexicographic ORDER BY matches time order.
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| WebhookError::Internal(format!("bad timestamp {raw:?}: {e}")))
}

fn db_err(e: rusqlite::Error) -> WebhookError {
    WebhookError::internal(e)
}

const REGISTRATION_COLUMNS: &str = "id, carrier_id, tracking_number, callback_url, \
     expiration_time, created_at, active, last_checksum, last_checked_at, \
     delivery_attempts, last_delivery_at, last_error";

fn row_to_registration(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegistrationRow> {
    Ok(RegistrationRow {
        id: row.get(0)?,
        carrier_id: row.get(1)?,
        tracking_number: row.get(2)?,
        callback_url: row.get(3)?,
        expiration_time: row.get(4)?,
        created_at: row.get(5)?,
        active: row.get::<_, i64>(6)? != 0,
        last_checksum: row.get(7)?,
        last_checked_at: row.get(8)?,
        delivery_attempts: row.get::<_, i64>(9)? as u32,
        last_delivery_at: row.get(10)?,
        last_error: row.get(11)?,
    })
}

/// Raw row; timestamps still text until converted.
struct RegistrationRow {
    id: String,
    carrier_id: String,
    tracking_number: String,
    callback_url: String,
    expiration_time: String,
    created_at: String,
    active: bool,
    last_checksum: Option<String>,
    last_checked_at: Option<String>,
    delivery_attempts: u32,
    last_delivery_at: Option<String>,
    last_error: Option<String>,
}

impl RegistrationRow {
    fn into_registration(self) -> Result<WebhookRegistration> {
        Ok(WebhookRegistration {
            id: WebhookId(self.id),
            carrier_id: CarrierId(self.carrier_id),
            tracking_number: self.tracking_number,
            callback_url: self.callback_url,
            expiration_time: parse_ts(&self.expiration_time)?,
            created_at: parse_ts(&self.created_at)?,
            active: self.active,
            last_checksum: self.last_checksum,
            last_checked_at: self.last_checked_at.as_deref().map(parse_ts).transpose()?,
            delivery_attempts: self.delivery_attempts,
            last_delivery_at: self.last_delivery_at.as_deref().map(parse_ts).transpose()?,
            last_error: self.last_error,
        })
    }
}

struct LogRow {
    id: i64,
    webhook_registration_id: String,
    attempt_number: u32,
    status_code: Option<u16>,
    success: bool,
    error_message: Option<String>,
    request_body: String,
    response_body: Option<String>,
    delivered_at: String,
}

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogRow> {
    Ok(LogRow {
        id: row.get(0)?,
        webhook_registration_id: row.get(1)?,
        attempt_number: row.get::<_, i64>(2)? as u32,
        status_code: row.get::<_, Option<i64>>(3)?.map(|code| code as u16),
        success: row.get::<_, i64>(4)? != 0,
        error_message: row.get(5)?,
        request_body: row.get(6)?,
        response_body: row.get(7)?,
        delivered_at: row.get(8)?,
    })
}

impl LogRow {
    fn into_log(self) -> Result<DeliveryLog> {
        Ok(DeliveryLog {
            id: self.id,
            webhook_registration_id: WebhookId(self.webhook_registration_id),
            attempt_number: self.attempt_number,
            status_code: self.status_code,
            success: self.success,
            error_message: self.error_message,
            request_body: self.request_body,
            response_body: self.response_body,
            delivered_at: parse_ts(&self.delivered_at)?,
        })
    }
}

fn select_registration(conn: &Connection, id: &str) -> Result<Option<WebhookRegistration>> {
    let sql = format!("SELECT {REGISTRATION_COLUMNS} FROM webhook_registrations WHERE id = ?1");
    let row = conn
        .query_row(&sql, params![id], row_to_registration)
        .optional()
        .map_err(db_err)?;
    row.map(RegistrationRow::into_registration).transpose()
}

#[async_trait]
impl RegistrationStore for SqliteStore {
    async fn create(&self, input: NewRegistration) -> Result<WebhookRegistration> {
        let record = WebhookRegistration {
            id: WebhookId::generate(),
            carrier_id: input.carrier_id,
            tracking_number: input.tracking_number,
            callback_url: input.callback_url,
            expiration_time: input.expiration_time,
            created_at: Utc::now(),
            active: true,
            last_checksum: None,
            last_checked_at: None,
            delivery_attempts: 0,
            last_delivery_at: None,
            last_error: None,
        };
        let row = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO webhook_registrations (
                    id, carrier_id, tracking_number, callback_url, expiration_time,
                    created_at, active, last_checksum, last_checked_at,
                    delivery_attempts, last_delivery_at, last_error
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, NULL, NULL, 0, NULL, NULL)",
                params![
                    row.id.0,
                    row.carrier_id.0,
                    row.tracking_number,
                    row.callback_url,
                    ts(row.expiration_time),
                    ts(row.created_at),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await?;
        Ok(record)
    }

    async fn find_by_id(&self, id: &WebhookId) -> Result<Option<WebhookRegistration>> {
        let id = id.0.clone();
        self.with_conn(move |conn| select_registration(conn, &id))
            .await
    }

    async fn find_active(&self) -> Result<Vec<WebhookRegistration>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {REGISTRATION_COLUMNS} FROM webhook_registrations \
                 WHERE active = 1 ORDER BY last_checked_at ASC"
            );
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map([], row_to_registration)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows.into_iter()
                .map(RegistrationRow::into_registration)
                .collect()
        })
        .await
    }

    async fn find_due_for_check(&self, limit: usize) -> Result<Vec<WebhookRegistration>> {
        let cutoff = ts(Utc::now() - ChronoDuration::minutes(DUE_CHECK_AGE_MINUTES));
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {REGISTRATION_COLUMNS} FROM webhook_registrations \
                 WHERE active = 1 AND (last_checked_at IS NULL OR last_checked_at < ?1) \
                 ORDER BY last_checked_at ASC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map(params![cutoff, limit as i64], row_to_registration)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows.into_iter()
                .map(RegistrationRow::into_registration)
                .collect()
        })
        .await
    }

    async fn update(
        &self,
        id: &WebhookId,
        patch: RegistrationPatch,
    ) -> Result<WebhookRegistration> {
        let id = id.0.clone();
        self.with_conn(move |conn| {
            let mut sets: Vec<String> = Vec::new();
            let mut values: Vec<Box<dyn ToSql + Send>> = Vec::new();

            if let Some(active) = patch.active {
                sets.push(format!("active = ?{}", values.len() + 1));
                values.push(Box::new(active as i64));
            }
            match patch.last_checksum {
                Some(Some(checksum)) => {
                    sets.push(format!("last_checksum = ?{}", values.len() + 1));
                    values.push(Box::new(checksum));
                }
                Some(None) => sets.push("last_checksum = NULL".to_string()),
                None => {}
            }
            if let Some(checked_at) = patch.last_checked_at {
                sets.push(format!("last_checked_at = ?{}", values.len() + 1));
                values.push(Box::new(ts(checked_at)));
            }
            match patch.last_error {
                Some(Some(error)) => {
                    sets.push(format!("last_error = ?{}", values.len() + 1));
                    values.push(Box::new(error));
                }
                Some(None) => sets.push("last_error = NULL".to_string()),
                None => {}
            }

            if !sets.is_empty() {
                let sql = format!(
                    "UPDATE webhook_registrations SET {} WHERE id = ?{}",
                    sets.join(", "),
                    values.len() + 1
                );
                values.push(Box::new(id.clone()));
                let params: Vec<&dyn ToSql> =
                    values.iter().map(|v| -> &dyn ToSql { v.as_ref() }).collect();
                let changed = conn.execute(&sql, &params[..]).map_err(db_err)?;
                if changed == 0 {
                    return Err(WebhookError::NotFound(format!("webhook {id}")));
                }
            }

            select_registration(conn, &id)?
                .ok_or_else(|| WebhookError::NotFound(format!("webhook {id}")))
        })
        .await
    }

    async fn deactivate(&self, id: &WebhookId) -> Result<()> {
        let id = id.0.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE webhook_registrations SET active = 0 WHERE id = ?1",
                params![id],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn deactivate_expired(&self) -> Result<u64> {
        let now = ts(Utc::now());
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE webhook_registrations SET active = 0 \
                     WHERE active = 1 AND expiration_time < ?1",
                    params![now],
                )
                .map_err(db_err)?;
            Ok(changed as u64)
        })
        .await
    }

    async fn log_delivery(&self, input: DeliveryLogInput) -> Result<DeliveryLog> {
        let delivered_at = Utc::now();
        let stored = input.clone();
        let id = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO webhook_delivery_logs (
                        webhook_registration_id, attempt_number, status_code, success,
                        error_message, request_body, response_body, delivered_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        stored.webhook_registration_id.0,
                        stored.attempt_number as i64,
                        stored.status_code.map(|code| code as i64),
                        stored.success as i64,
                        stored.error_message,
                        stored.request_body,
                        stored.response_body,
                        ts(delivered_at),
                    ],
                )
                .map_err(db_err)?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        Ok(DeliveryLog {
            id,
            webhook_registration_id: input.webhook_registration_id,
            attempt_number: input.attempt_number,
            status_code: input.status_code,
            success: input.success,
            error_message: input.error_message,
            request_body: input.request_body,
            response_body: input.response_body,
            delivered_at,
        })
    }

    async fn increment_delivery_attempts(&self, id: &WebhookId) -> Result<WebhookRegistration> {
        let id = id.0.clone();
        let now = ts(Utc::now());
        self.with_conn(move |conn| {
            // Single UPDATE so concurrent increments never lose a count.
            let changed = conn
                .execute(
                    "UPDATE webhook_registrations \
                     SET delivery_attempts = delivery_attempts + 1, last_delivery_at = ?2 \
                     WHERE id = ?1",
                    params![id, now],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(WebhookError::NotFound(format!("webhook {id}")));
            }
            select_registration(conn, &id)?
                .ok_or_else(|| WebhookError::NotFound(format!("webhook {id}")))
        })
        .await
    }

    async fn get_delivery_logs(&self, id: &WebhookId, limit: usize) -> Result<Vec<DeliveryLog>> {
        let id = id.0.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, webhook_registration_id, attempt_number, status_code, success,
                            error_message, request_body, response_body, delivered_at
                     FROM webhook_delivery_logs
                     WHERE webhook_registration_id = ?1
                     ORDER BY delivered_at DESC, id DESC
                     LIMIT ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![id, limit as i64], row_to_log)
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            rows.into_iter().map(LogRow::into_log).collect()
        })
        .await
    }
}
