use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id            TEXT PRIMARY KEY,
                display_name  TEXT NOT NULL,
                avatar_ref    TEXT,
                role          TEXT NOT NULL CHECK (role IN ('end_user', 'operator')),
                created_at    TEXT NOT NULL
            );

            -- One conversation per end-user; the UNIQUE constraint is what
            -- makes concurrent find-or-create converge on a single row.
            CREATE TABLE conversations (
                id                     TEXT PRIMARY KEY,
                end_user_id            TEXT NOT NULL UNIQUE REFERENCES users(id),
                operator_id            TEXT REFERENCES users(id),
                last_message_at        TEXT,
                end_user_unread_count  INTEGER NOT NULL DEFAULT 0 CHECK (end_user_unread_count >= 0),
                operator_unread_count  INTEGER NOT NULL DEFAULT 0 CHECK (operator_unread_count >= 0),
                created_at             TEXT NOT NULL,
                updated_at             TEXT NOT NULL
            );

            CREATE TABLE messages (
                id               TEXT PRIMARY KEY,
                conversation_id  TEXT NOT NULL REFERENCES conversations(id),
                sender_id        TEXT NOT NULL REFERENCES users(id),
                body             TEXT NOT NULL,
                is_read          INTEGER NOT NULL DEFAULT 0,
                created_at       TEXT NOT NULL
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, created_at);

            CREATE TABLE clear_markers (
                user_id          TEXT NOT NULL REFERENCES users(id),
                conversation_id  TEXT NOT NULL REFERENCES conversations(id),
                cleared_at       TEXT NOT NULL
            );

            CREATE INDEX idx_clear_markers_viewer
                ON clear_markers(user_id, conversation_id, cleared_at);

            CREATE TABLE postings (
                id          TEXT PRIMARY KEY,
                title       TEXT NOT NULL,
                summary     TEXT,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_postings_created ON postings(created_at);

            CREATE TABLE resources (
                id           TEXT PRIMARY KEY,
                name         TEXT NOT NULL,
                description  TEXT,
                created_at   TEXT NOT NULL
            );

            CREATE INDEX idx_resources_created ON resources(created_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
