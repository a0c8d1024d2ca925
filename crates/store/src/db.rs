use std::{str::FromStr, time::Duration};

use {
    sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
    tracing::debug,
};

use crate::Result;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS users (
        id         TEXT PRIMARY KEY,
        name       TEXT,
        email      TEXT,
        updated_at INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS conversations (
        id                TEXT PRIMARY KEY,
        participant_low   TEXT NOT NULL,
        participant_high  TEXT NOT NULL,
        is_group          INTEGER NOT NULL DEFAULT 0,
        last_message_id   TEXT,
        last_message_text TEXT,
        last_message_at   INTEGER,
        message_count     INTEGER NOT NULL DEFAULT 0,
        created_at        INTEGER NOT NULL,
        updated_at        INTEGER NOT NULL,
        CHECK (participant_low < participant_high)
    )"#,
    // At most one private conversation per unordered pair.
    r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_private_pair
        ON conversations (participant_low, participant_high)
        WHERE is_group = 0"#,
    r#"CREATE INDEX IF NOT EXISTS idx_conversations_high
        ON conversations (participant_high, updated_at)"#,
    r#"CREATE TABLE IF NOT EXISTS messages (
        id              TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations(id),
        seq             INTEGER NOT NULL,
        sender_id       TEXT NOT NULL,
        content         TEXT NOT NULL,
        kind            TEXT NOT NULL DEFAULT 'text'
                        CHECK (kind IN ('text', 'image', 'file')),
        created_at      INTEGER NOT NULL,
        UNIQUE (conversation_id, seq)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_messages_timeline
        ON messages (conversation_id, created_at, seq)"#,
];

/// Open (creating if needed) the database at `database_url` and apply the schema.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    if let Some(parent) = options.get_filename().parent()
        && !parent.as_os_str().is_empty()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        tracing::warn!(path = %parent.display(), error = %e, "could not create database directory");
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await?;
    init(&pool).await?;
    debug!(database_url, "storage ready");
    Ok(pool)
}

/// Create tables and indexes if they don't exist.
pub async fn init(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
