use rusqlite::{Connection, Result};

/// Initialise the analytics-family tables. Safe to call on every startup
/// (idempotent). No foreign keys into the conversation store — these rows
/// outlive the conversations they reference.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA busy_timeout=3000;",
    )?;
    create_activities_table(conn)?;
    create_api_calls_table(conn)?;
    create_message_metrics_table(conn)?;
    create_rollups_table(conn)?;
    Ok(())
}

fn create_activities_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS activities (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            subject    TEXT NOT NULL,
            kind       TEXT NOT NULL,
            metadata   TEXT,
            timestamp  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_activities_subject
            ON activities(subject, timestamp DESC);",
    )
}

fn create_api_calls_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS api_calls (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            endpoint    TEXT NOT NULL,
            method      TEXT NOT NULL,
            subject     TEXT,
            status      INTEGER NOT NULL,
            latency_ms  INTEGER NOT NULL,
            timestamp   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_api_calls_time
            ON api_calls(timestamp DESC);",
    )
}

fn create_message_metrics_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS message_metrics (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id       TEXT NOT NULL,
            conversation_id  TEXT NOT NULL,
            subject          TEXT NOT NULL,
            role             TEXT NOT NULL,
            token_count      INTEGER,
            response_time_s  REAL,
            model_name       TEXT,
            timestamp        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_metrics_conversation
            ON message_metrics(conversation_id, timestamp);",
    )
}

fn create_rollups_table(conn: &Connection) -> Result<()> {
    // assistant_count is the weighted-mean divisor; message_count counts all
    // tracked messages and must never be used to divide.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversation_rollups (
            conversation_id      TEXT PRIMARY KEY NOT NULL,
            owner_subject        TEXT NOT NULL,
            message_count        INTEGER NOT NULL DEFAULT 0,
            total_tokens         INTEGER NOT NULL DEFAULT 0,
            avg_response_time_s  REAL NOT NULL DEFAULT 0,
            assistant_count      INTEGER NOT NULL DEFAULT 0,
            updated_at           TEXT NOT NULL
        );",
    )
}
