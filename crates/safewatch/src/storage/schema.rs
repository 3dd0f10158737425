//! `SQLite` schema definitions for safewatch.
//!
//! The base statements create the version 1 layout. Later additions live in
//! their own statement lists and are applied by the matching migration.

/// Alerts, one row per dispatched alert.
pub const CREATE_ALERTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS alerts (
    id TEXT PRIMARY KEY,
    originator_id TEXT NOT NULL,
    originator_name TEXT NOT NULL,
    message TEXT NOT NULL,
    lat REAL NOT NULL,
    lng REAL NOT NULL,
    accuracy REAL NOT NULL,
    fixed_at TEXT NOT NULL,
    place_name TEXT,
    status TEXT NOT NULL,
    priority TEXT NOT NULL,
    created_at TEXT NOT NULL,
    resolved_at TEXT,
    recipients TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
)
";

/// Index for newest-first listings.
pub const CREATE_ALERTS_CREATED_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at DESC)
";

/// Index for per-originator status lookups.
pub const CREATE_ALERTS_ORIGINATOR_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_alerts_originator ON alerts(originator_id, status)
";

/// Responses. `seq` records arrival order; `id` is the merge key.
pub const CREATE_RESPONSES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS responses (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    alert_id TEXT NOT NULL,
    responder_id TEXT NOT NULL,
    responder_name TEXT NOT NULL,
    kind TEXT NOT NULL,
    message TEXT,
    location TEXT,
    timestamp TEXT NOT NULL
)
";

/// Index for loading an alert's responses in arrival order.
pub const CREATE_RESPONSES_ALERT_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_responses_alert ON responses(alert_id, seq)
";

/// Key/value settings such as the schema version and the cancellation
/// credential digest.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// Relay samples per alert (added in version 2).
pub const CREATE_LOCATION_TRAIL_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS location_trail (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    alert_id TEXT NOT NULL,
    lat REAL NOT NULL,
    lng REAL NOT NULL,
    accuracy REAL NOT NULL,
    speed REAL,
    battery INTEGER,
    timestamp TEXT NOT NULL,
    UNIQUE (alert_id, timestamp)
)
";

/// Index for loading a trail in time order.
pub const CREATE_LOCATION_TRAIL_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_location_trail_alert ON location_trail(alert_id, timestamp)
";

/// Version 1 schema statements, in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_ALERTS_TABLE,
    CREATE_ALERTS_CREATED_INDEX,
    CREATE_ALERTS_ORIGINATOR_INDEX,
    CREATE_RESPONSES_TABLE,
    CREATE_RESPONSES_ALERT_INDEX,
    CREATE_METADATA_TABLE,
];

/// Statements applied by the version 2 migration.
pub const LOCATION_TRAIL_STATEMENTS: &[&str] =
    &[CREATE_LOCATION_TRAIL_TABLE, CREATE_LOCATION_TRAIL_INDEX];
