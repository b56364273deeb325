use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            role        TEXT NOT NULL DEFAULT 'student'
                        CHECK (role IN ('admin', 'faculty', 'staff', 'student')),
            created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS direct_messages (
            id              TEXT PRIMARY KEY,
            sender_id       TEXT NOT NULL REFERENCES users(id),
            receiver_id     TEXT NOT NULL REFERENCES users(id),
            content         TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            is_read         INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_dm_receiver_unread
            ON direct_messages(receiver_id, is_read);

        CREATE INDEX IF NOT EXISTS idx_dm_pair
            ON direct_messages(sender_id, receiver_id, created_at);

        CREATE TABLE IF NOT EXISTS notifications (
            id          TEXT PRIMARY KEY,
            kind        TEXT NOT NULL,
            title       TEXT NOT NULL,
            message     TEXT NOT NULL,
            created_by  TEXT NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_notifications_created
            ON notifications(created_at);

        CREATE TABLE IF NOT EXISTS notification_reads (
            notification_id TEXT NOT NULL REFERENCES notifications(id),
            user_id         TEXT NOT NULL REFERENCES users(id),
            read_at         TEXT NOT NULL,
            PRIMARY KEY (notification_id, user_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
