//! Storage layer for safewatch.
//!
//! A `SQLite` implementation of [`AlertStore`]: alerts, responses in arrival
//! order, per-alert location trails and a small metadata table. All writes are
//! idempotent by record id so the outbox can replay them freely.

pub mod migrations;
pub mod schema;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::alert::{Alert, AlertId, AlertStatus, LocationFix, LocationSample, Response};
use crate::error::{Error, Result};
use crate::services::{AlertStore, StoreResult};

/// Capacity of each per-alert response feed.
const FEED_CAPACITY: usize = 64;

const ALERT_COLUMNS: &str = "id, originator_id, originator_name, message, lat, lng, accuracy, \
     fixed_at, place_name, status, priority, created_at, resolved_at, recipients";

const RESPONSE_COLUMNS: &str =
    "id, alert_id, responder_id, responder_name, kind, message, location, timestamp";

/// `SQLite`-backed alert store.
#[derive(Debug)]
pub struct Storage {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Mutex<Connection>,
    /// Live response feeds keyed by alert.
    feeds: Mutex<HashMap<AlertId, broadcast::Sender<Response>>>,
}

impl Storage {
    /// Open or create a storage database at the given path.
    ///
    /// Creates parent directories as needed and brings the schema up to date.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        migrations::initialize_schema(&conn)?;

        info!("Database opened at {}", path.display());
        Ok(Self::from_connection(path, conn))
    }

    /// Create an in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let path = PathBuf::from(":memory:");
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        migrations::initialize_schema(&conn)?;
        Ok(Self::from_connection(path, conn))
    }

    fn from_connection(path: PathBuf, conn: Connection) -> Self {
        Self {
            path,
            conn: Mutex::new(conn),
            feeds: Mutex::new(HashMap::new()),
        }
    }

    /// Path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an alert, or update its mutable fields if it already exists.
    ///
    /// Responses carried on the alert are inserted too; ones already stored
    /// are left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn write_alert(&self, alert: &Alert) -> StoreResult<()> {
        let recipients = serde_json::to_string(&alert.recipients)?;
        let inserted = {
            let conn = self.conn();
            conn.execute(
                r"
                INSERT INTO alerts (id, originator_id, originator_name, message, lat, lng,
                                    accuracy, fixed_at, place_name, status, priority,
                                    created_at, resolved_at, recipients)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                ON CONFLICT(id) DO UPDATE SET
                    message = excluded.message,
                    place_name = excluded.place_name,
                    status = excluded.status,
                    priority = excluded.priority,
                    resolved_at = excluded.resolved_at,
                    recipients = excluded.recipients,
                    updated_at = datetime('now')
                ",
                params![
                    alert.id.to_string(),
                    alert.originator_id,
                    alert.originator_name,
                    alert.message,
                    alert.location.lat,
                    alert.location.lng,
                    alert.location.accuracy,
                    timestamp(alert.location.timestamp),
                    alert.location.place_name,
                    alert.status.to_string(),
                    alert.priority.to_string(),
                    timestamp(alert.created_at),
                    alert.resolved_at.map(timestamp),
                    recipients,
                ],
            )?;

            let mut inserted = Vec::new();
            for response in &alert.responses {
                if insert_response(&conn, response)? {
                    inserted.push(response.clone());
                }
            }
            inserted
        };

        for response in inserted {
            self.publish(response);
        }
        debug!(alert_id = %alert.id, status = %alert.status, "Saved alert");
        Ok(())
    }

    /// Record a status change.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn write_status(
        &self,
        alert_id: AlertId,
        status: AlertStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let resolved_at = status.is_terminal().then(|| timestamp(at));
        let affected = self.conn().execute(
            r"
            UPDATE alerts
            SET status = ?1,
                resolved_at = COALESCE(?2, resolved_at),
                updated_at = datetime('now')
            WHERE id = ?3
            ",
            params![status.to_string(), resolved_at, alert_id.to_string()],
        )?;

        if affected == 0 {
            debug!(alert_id = %alert_id, %status, "Status update for unknown alert ignored");
        }
        Ok(())
    }

    /// Append a sample to an alert's trail. A sample with the same timestamp
    /// is stored only once.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn write_location(&self, alert_id: AlertId, sample: &LocationSample) -> StoreResult<()> {
        self.conn().execute(
            r"
            INSERT OR IGNORE INTO location_trail
                (alert_id, lat, lng, accuracy, speed, battery, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                alert_id.to_string(),
                sample.lat,
                sample.lng,
                sample.accuracy,
                sample.speed,
                sample.battery,
                timestamp(sample.timestamp),
            ],
        )?;
        Ok(())
    }

    /// Insert a response and push it to subscribers.
    ///
    /// Returns `false` when a response with the same id was already stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn write_response(&self, response: &Response) -> StoreResult<bool> {
        let inserted = insert_response(&self.conn(), response)?;
        if inserted {
            trace!(alert_id = %response.alert_id, response_id = %response.id, "Stored response");
            self.publish(response.clone());
        }
        Ok(inserted)
    }

    /// Responses for an alert in arrival order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn load_responses(&self, alert_id: AlertId) -> StoreResult<Vec<Response>> {
        load_responses(&self.conn(), alert_id)
    }

    /// Load one alert with its responses.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn load_alert(&self, alert_id: AlertId) -> StoreResult<Option<Alert>> {
        let conn = self.conn();
        let alert = conn
            .query_row(
                &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1"),
                [alert_id.to_string()],
                row_to_alert,
            )
            .optional()?;

        match alert {
            Some(mut alert) => {
                alert.responses = load_responses(&conn, alert.id)?;
                Ok(Some(alert))
            }
            None => Ok(None),
        }
    }

    /// The most recent alerts, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn load_recent(&self, limit: usize) -> StoreResult<Vec<Alert>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts ORDER BY created_at DESC LIMIT ?1"
        ))?;

        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut alerts = stmt
            .query_map([limit_i64], row_to_alert)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for alert in &mut alerts {
            alert.responses = load_responses(&conn, alert.id)?;
        }
        Ok(alerts)
    }

    /// An alert's location trail in time order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn trail(&self, alert_id: AlertId) -> StoreResult<Vec<LocationSample>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r"
            SELECT lat, lng, accuracy, speed, battery, timestamp
            FROM location_trail WHERE alert_id = ?1 ORDER BY timestamp ASC
            ",
        )?;

        let samples = stmt
            .query_map([alert_id.to_string()], |row| {
                Ok(LocationSample {
                    lat: row.get(0)?,
                    lng: row.get(1)?,
                    accuracy: row.get(2)?,
                    speed: row.get(3)?,
                    battery: row.get(4)?,
                    timestamp: parse_column(row, 5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(samples)
    }

    /// Read a metadata value.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_metadata(&self, key: &str) -> StoreResult<Option<String>> {
        let value = self
            .conn()
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Write a metadata value.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn put_metadata(&self, key: &str, value: &str) -> StoreResult<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Delete cancelled and resolved alerts created before `now - max_age`,
    /// together with their responses and trails.
    ///
    /// Returns the number of alerts deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn prune_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = timestamp(Utc::now() - max_age);
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let stale = "SELECT id FROM alerts WHERE created_at < ?1 AND status IN ('cancelled', 'resolved')";
        tx.execute(
            &format!("DELETE FROM responses WHERE alert_id IN ({stale})"),
            [&cutoff],
        )?;
        tx.execute(
            &format!("DELETE FROM location_trail WHERE alert_id IN ({stale})"),
            [&cutoff],
        )?;
        let affected = tx.execute(
            "DELETE FROM alerts WHERE created_at < ?1 AND status IN ('cancelled', 'resolved')",
            [&cutoff],
        )?;
        tx.commit()?;

        if affected > 0 {
            info!("Pruned {} old alerts", affected);
        }
        Ok(affected)
    }

    /// Database statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StorageStats> {
        let conn = self.conn();
        let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |row| row.get(0)) };

        let total_alerts = count("SELECT COUNT(*) FROM alerts")?;
        let active_alerts = count("SELECT COUNT(*) FROM alerts WHERE status = 'active'")?;
        let total_responses = count("SELECT COUNT(*) FROM responses")?;
        let trail_points = count("SELECT COUNT(*) FROM location_trail")?;

        let bound = |sql: &str| -> rusqlite::Result<Option<DateTime<Utc>>> {
            let value: Option<String> = conn.query_row(sql, [], |row| row.get(0)).optional()?;
            Ok(value
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)))
        };
        let oldest_alert = bound("SELECT created_at FROM alerts ORDER BY created_at ASC LIMIT 1")?;
        let newest_alert = bound("SELECT created_at FROM alerts ORDER BY created_at DESC LIMIT 1")?;

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StorageStats {
            total_alerts,
            active_alerts,
            total_responses,
            trail_points,
            oldest_alert,
            newest_alert,
            db_size_bytes,
        })
    }

    fn feed(&self, alert_id: AlertId) -> broadcast::Receiver<Response> {
        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        feeds.retain(|_, tx| tx.receiver_count() > 0);
        feeds
            .entry(alert_id)
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .subscribe()
    }

    fn publish(&self, response: Response) {
        let feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = feeds.get(&response.alert_id) {
            // No receivers left is fine; the entry is pruned on next subscribe.
            let _ = tx.send(response);
        }
    }
}

#[async_trait::async_trait]
impl AlertStore for Storage {
    async fn save_alert(&self, alert: &Alert) -> StoreResult<()> {
        self.write_alert(alert)
    }

    async fn update_status(
        &self,
        alert_id: AlertId,
        status: AlertStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.write_status(alert_id, status, at)
    }

    async fn append_location(&self, alert_id: AlertId, sample: &LocationSample) -> StoreResult<()> {
        self.write_location(alert_id, sample)
    }

    async fn save_response(&self, response: &Response) -> StoreResult<()> {
        self.write_response(response).map(|_| ())
    }

    async fn responses(&self, alert_id: AlertId) -> StoreResult<Vec<Response>> {
        self.load_responses(alert_id)
    }

    async fn alert(&self, alert_id: AlertId) -> StoreResult<Option<Alert>> {
        self.load_alert(alert_id)
    }

    async fn recent_alerts(&self, limit: usize) -> StoreResult<Vec<Alert>> {
        self.load_recent(limit)
    }

    async fn metadata(&self, key: &str) -> StoreResult<Option<String>> {
        self.get_metadata(key)
    }

    async fn set_metadata(&self, key: &str, value: &str) -> StoreResult<()> {
        self.put_metadata(key, value)
    }

    fn subscribe(&self, alert_id: AlertId) -> broadcast::Receiver<Response> {
        self.feed(alert_id)
    }
}

/// Statistics about the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    /// Total number of alerts stored.
    pub total_alerts: i64,
    /// Alerts currently marked active.
    pub active_alerts: i64,
    /// Total number of responses stored.
    pub total_responses: i64,
    /// Total number of trail samples stored.
    pub trail_points: i64,
    /// Creation time of the oldest alert.
    pub oldest_alert: Option<DateTime<Utc>>,
    /// Creation time of the newest alert.
    pub newest_alert: Option<DateTime<Utc>>,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn insert_response(conn: &Connection, response: &Response) -> StoreResult<bool> {
    let location = response
        .location
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let affected = conn.execute(
        r"
        INSERT OR IGNORE INTO responses
            (id, alert_id, responder_id, responder_name, kind, message, location, timestamp)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ",
        params![
            response.id.to_string(),
            response.alert_id.to_string(),
            response.responder_id,
            response.responder_name,
            response.kind.to_string(),
            response.message,
            location,
            timestamp(response.timestamp),
        ],
    )?;
    Ok(affected > 0)
}

fn load_responses(conn: &Connection, alert_id: AlertId) -> StoreResult<Vec<Response>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RESPONSE_COLUMNS} FROM responses WHERE alert_id = ?1 ORDER BY seq ASC"
    ))?;

    let responses = stmt
        .query_map([alert_id.to_string()], row_to_response)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(responses)
}

/// Parse a text column through `FromStr`, reporting failures as conversion
/// errors on that column.
fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|text| {
        serde_json::from_str(&text)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn row_to_alert(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let resolved_at: Option<String> = row.get(12)?;
    let resolved_at = resolved_at
        .map(|s| {
            s.parse::<DateTime<Utc>>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(12, Type::Text, Box::new(e))
            })
        })
        .transpose()?;

    Ok(Alert {
        id: parse_column(row, 0)?,
        originator_id: row.get(1)?,
        originator_name: row.get(2)?,
        message: row.get(3)?,
        location: LocationFix {
            lat: row.get(4)?,
            lng: row.get(5)?,
            accuracy: row.get(6)?,
            timestamp: parse_column(row, 7)?,
            place_name: row.get(8)?,
        },
        status: parse_column(row, 9)?,
        priority: parse_column(row, 10)?,
        created_at: parse_column(row, 11)?,
        resolved_at,
        recipients: json_column(row, 13)?.unwrap_or_default(),
        responses: Vec::new(),
    })
}

fn row_to_response(row: &Row<'_>) -> rusqlite::Result<Response> {
    Ok(Response {
        id: parse_column(row, 0)?,
        alert_id: parse_column(row, 1)?,
        responder_id: row.get(2)?,
        responder_name: row.get(3)?,
        kind: parse_column(row, 4)?,
        message: row.get(5)?,
        location: json_column(row, 6)?,
        timestamp: parse_column(row, 7)?,
    })
}
