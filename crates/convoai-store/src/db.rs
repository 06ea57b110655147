use rusqlite::{Connection, Result};

/// Initialise the conversation-family tables. Safe to call on every startup
/// (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA foreign_keys=ON;
         PRAGMA busy_timeout=3000;",
    )?;
    create_conversations_table(conn)?;
    create_messages_table(conn)?;
    create_tool_servers_table(conn)?;
    Ok(())
}

fn create_conversations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id             TEXT PRIMARY KEY NOT NULL,
            owner_subject  TEXT NOT NULL,
            title          TEXT NOT NULL,
            system_prompt  TEXT,
            status         TEXT NOT NULL DEFAULT 'active',
            created_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_owner
            ON conversations(owner_subject, created_at DESC);",
    )
}

fn create_messages_table(conn: &Connection) -> Result<()> {
    // ON DELETE CASCADE gives conversation deletion its cascade semantics
    // at the schema level. Analytics rows live in a different store entirely.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id               TEXT PRIMARY KEY NOT NULL,
            conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            role             TEXT NOT NULL,
            content          TEXT NOT NULL,
            token_count      INTEGER,
            response_time_ms INTEGER,
            model_name       TEXT,
            created_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);",
    )
}

fn create_tool_servers_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tool_servers (
            id             TEXT PRIMARY KEY NOT NULL,
            owner_subject  TEXT NOT NULL,
            name           TEXT NOT NULL,
            description    TEXT NOT NULL DEFAULT '',
            endpoint_url   TEXT NOT NULL,
            enabled        INTEGER NOT NULL DEFAULT 1,
            created_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tool_servers_owner
            ON tool_servers(owner_subject, created_at);",
    )
}
