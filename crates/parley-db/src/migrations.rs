use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (messages, users)");
        conn.execute_batch(
            "
            -- Timestamps are unix epoch milliseconds (UTC).
            CREATE TABLE messages (
                seq                   INTEGER PRIMARY KEY AUTOINCREMENT,
                id                    TEXT NOT NULL UNIQUE,
                sender_id             TEXT NOT NULL,
                receiver_id           TEXT NOT NULL,
                body                  TEXT NOT NULL,
                created_at            INTEGER NOT NULL,
                is_read               INTEGER NOT NULL DEFAULT 0,
                deleted_for_receiver  INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_messages_pair
                ON messages(sender_id, receiver_id, created_at);

            CREATE TABLE users (
                id           TEXT PRIMARY KEY,
                external_id  TEXT UNIQUE,
                username     TEXT NOT NULL,
                email        TEXT NOT NULL UNIQUE,
                is_verified  INTEGER NOT NULL DEFAULT 0,
                push_token   TEXT,
                last_login   INTEGER,
                created_at   INTEGER NOT NULL
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
