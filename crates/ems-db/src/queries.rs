use crate::models::{ConversationRow, MessageRow, NotificationRow, UserRow};
use crate::Database;
use anyhow::Result;
use rusqlite::{Connection, Row};

const MESSAGE_COLUMNS: &str = "m.id, m.sender_id, s.username, m.receiver_id, r.username, m.content, m.created_at, m.is_read";

const MESSAGE_JOINS: &str = "FROM direct_messages m
     JOIN users s ON m.sender_id = s.id
     JOIN users r ON m.receiver_id = r.id";

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str, role: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, role) VALUES (?1, ?2, ?3, ?4)",
                (id, username, password_hash, role),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    // -- Direct messages --

    pub fn insert_direct_message(
        &self,
        id: &str,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO direct_messages (id, sender_id, receiver_id, content, created_at, is_read)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                rusqlite::params![id, sender_id, receiver_id, content, created_at],
            )?;
            Ok(())
        })
    }

    pub fn get_direct_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {MESSAGE_COLUMNS} {MESSAGE_JOINS} WHERE m.id = ?1");
            conn.query_row(&sql, [id], message_from_row).optional()
        })
    }

    /// Flip a message to read. Returns true only if it was unread before.
    pub fn mark_message_read(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE direct_messages SET is_read = 1 WHERE id = ?1 AND is_read = 0",
                [id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Mark every unread message from `sender_id` to `receiver_id` as read.
    /// Returns the ids that were flipped.
    pub fn mark_conversation_read(&self, receiver_id: &str, sender_id: &str) -> Result<Vec<String>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let ids = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM direct_messages
                     WHERE receiver_id = ?1 AND sender_id = ?2 AND is_read = 0
                     ORDER BY created_at",
                )?;
                stmt.query_map([receiver_id, sender_id], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };
            tx.execute(
                "UPDATE direct_messages SET is_read = 1
                 WHERE receiver_id = ?1 AND sender_id = ?2 AND is_read = 0",
                [receiver_id, sender_id],
            )?;
            tx.commit()?;
            Ok(ids)
        })
    }

    /// Messages exchanged between two users, newest first.
    /// `before` is a stored `created_at` used as an exclusive cursor.
    pub fn get_conversation(
        &self,
        user_a: &str,
        user_b: &str,
        limit: u32,
        before: Option<&str>,
        before_id: Option<&str>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} {MESSAGE_JOINS}
                 WHERE ((m.sender_id = ?1 AND m.receiver_id = ?2)
                     OR (m.sender_id = ?2 AND m.receiver_id = ?1))
                   AND (?3 IS NULL OR m.created_at < ?3 OR (m.created_at = ?3 AND m.id < ?5))
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?4"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![user_a, user_b, before, limit, before_id], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// One row per peer the user has exchanged messages with, most recent first.
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.sender_id, s.username, c.receiver_id, r.username,
                        c.content, c.created_at, c.is_read, c.peer_id, p.username,
                        (SELECT COUNT(*) FROM direct_messages u
                          WHERE u.sender_id = c.peer_id AND u.receiver_id = ?1 AND u.is_read = 0)
                 FROM (
                     SELECT m.*,
                            CASE WHEN m.sender_id = ?1 THEN m.receiver_id ELSE m.sender_id END AS peer_id,
                            ROW_NUMBER() OVER (
                                PARTITION BY CASE WHEN m.sender_id = ?1 THEN m.receiver_id ELSE m.sender_id END
                                ORDER BY m.created_at DESC, m.id DESC
                            ) AS rn
                     FROM direct_messages m
                     WHERE m.sender_id = ?1 OR m.receiver_id = ?1
                 ) c
                 JOIN users s ON c.sender_id = s.id
                 JOIN users r ON c.receiver_id = r.id
                 JOIN users p ON c.peer_id = p.id
                 WHERE c.rn = 1
                 ORDER BY c.created_at DESC",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ConversationRow {
                        last_message: message_from_row(row)?,
                        peer_id: row.get(8)?,
                        peer_username: row.get(9)?,
                        unread_count: row.get(10)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn unread_count(&self, user_id: &str) -> Result<u32> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM direct_messages WHERE receiver_id = ?1 AND is_read = 0",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    // -- Notifications --

    pub fn insert_notification(
        &self,
        id: &str,
        kind: &str,
        title: &str,
        message: &str,
        created_by: &str,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notifications (id, kind, title, message, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id, kind, title, message, created_by, created_at],
            )?;
            Ok(())
        })
    }

    pub fn get_notification(&self, id: &str) -> Result<Option<NotificationRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, kind, title, message, created_by, created_at, 0
                 FROM notifications WHERE id = ?1",
                [id],
                notification_from_row,
            )
            .optional()
        })
    }

    /// Newest notifications, each with the given user's read flag.
    pub fn list_notifications_for_user(&self, user_id: &str, limit: u32) -> Result<Vec<NotificationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT n.id, n.kind, n.title, n.message, n.created_by, n.created_at,
                        nr.user_id IS NOT NULL
                 FROM notifications n
                 LEFT JOIN notification_reads nr
                        ON nr.notification_id = n.id AND nr.user_id = ?1
                 ORDER BY n.created_at DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit], notification_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    #[cfg(test)]
    pub fn count_notifications(&self) -> Result<u32> {
        self.with_conn(|conn| {
            let count = conn.query_row("SELECT COUNT(*) FROM notifications", [], |row| row.get(0))?;
            Ok(count)
        })
    }

    /// Record a per-user read flag. Returns false if it was already recorded.
    pub fn mark_notification_read(&self, notification_id: &str, user_id: &str, read_at: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO notification_reads (notification_id, user_id, read_at)
                 VALUES (?1, ?2, ?3)",
                [notification_id, user_id, read_at],
            )?;
            Ok(changed > 0)
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT id, username, password, role, created_at FROM users WHERE {column} = ?1");
    let mut stmt = conn.prepare(&sql)?;

    stmt.query_row([value], |row| {
        Ok(UserRow {
            id: row.get(0)?,
            username: row.get(1)?,
            password: row.get(2)?,
            role: row.get(3)?,
            created_at: row.get(4)?,
        })
    })
    .optional()
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        sender_username: row.get(2)?,
        receiver_id: row.get(3)?,
        receiver_username: row.get(4)?,
        content: row.get(5)?,
        created_at: row.get(6)?,
        is_read: row.get(7)?,
    })
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<NotificationRow> {
    Ok(NotificationRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        title: row.get(2)?,
        message: row.get(3)?,
        created_by: row.get(4)?,
        created_at: row.get(5)?,
        is_read: row.get(6)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::format_timestamp;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn user(db: &Database, name: &str, role: &str) -> String {
        let id = Uuid::new_v4().to_string();
        db.create_user(&id, name, "hash", role).unwrap();
        id
    }

    fn message(db: &Database, from: &str, to: &str, content: &str, offset_ms: i64) -> String {
        let id = Uuid::new_v4().to_string();
        let at = format_timestamp(Utc::now() + Duration::milliseconds(offset_ms));
        db.insert_direct_message(&id, from, to, content, &at).unwrap();
        id
    }

    #[test]
    fn user_lookup_by_name_and_id() {
        let db = Database::open_in_memory().unwrap();
        let id = user(&db, "faculty01", "faculty");

        let by_name = db.get_user_by_username("faculty01").unwrap().unwrap();
        assert_eq!(by_name.id, id);
        assert_eq!(by_name.role, "faculty");
        assert!(db.get_user_by_id(&id).unwrap().is_some());
        assert!(db.get_user_by_username("nobody").unwrap().is_none());
    }

    #[test]
    fn duplicate_username_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        user(&db, "student01", "student");
        let again = db.create_user(&Uuid::new_v4().to_string(), "student01", "hash", "student");
        assert!(crate::is_constraint_violation(&again.unwrap_err()));
    }

    #[test]
    fn other_failures_are_not_constraint_violations() {
        assert!(!crate::is_constraint_violation(&anyhow::anyhow!("DB lock poisoned")));

        let db = Database::open_in_memory().unwrap();
        let err = db
            .with_conn(|conn| {
                conn.execute("INSERT INTO no_such_table VALUES (1)", [])?;
                Ok(())
            })
            .unwrap_err();
        assert!(!crate::is_constraint_violation(&err));
    }

    #[test]
    fn message_requires_existing_users() {
        let db = Database::open_in_memory().unwrap();
        let sender = user(&db, "faculty01", "faculty");
        let ghost = Uuid::new_v4().to_string();
        let res = db.insert_direct_message(&Uuid::new_v4().to_string(), &sender, &ghost, "hi", "2026-01-01T00:00:00Z");
        assert!(res.is_err());
    }

    #[test]
    fn mark_read_reports_transition_once() {
        let db = Database::open_in_memory().unwrap();
        let a = user(&db, "faculty01", "faculty");
        let b = user(&db, "student01", "student");
        let id = message(&db, &a, &b, "hello", 0);

        assert_eq!(db.unread_count(&b).unwrap(), 1);
        assert!(db.mark_message_read(&id).unwrap());
        assert!(!db.mark_message_read(&id).unwrap());
        assert!(db.get_direct_message(&id).unwrap().unwrap().is_read);
        assert_eq!(db.unread_count(&b).unwrap(), 0);
    }

    #[test]
    fn conversation_history_is_newest_first_with_cursor() {
        let db = Database::open_in_memory().unwrap();
        let a = user(&db, "faculty01", "faculty");
        let b = user(&db, "student01", "student");
        let c = user(&db, "student02", "student");
        message(&db, &a, &b, "one", 0);
        message(&db, &b, &a, "two", 10);
        message(&db, &a, &b, "three", 20);
        message(&db, &a, &c, "elsewhere", 30);

        let rows = db.get_conversation(&b, &a, 50, None, None).unwrap();
        let contents: Vec<_> = rows.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, ["three", "two", "one"]);

        let older = db.get_conversation(&a, &b, 50, Some(rows[1].created_at.as_str()), None).unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].content, "one");

        assert_eq!(db.get_conversation(&a, &b, 2, None, None).unwrap().len(), 2);
    }

    #[test]
    fn cursor_with_id_keeps_messages_sharing_a_timestamp() {
        let db = Database::open_in_memory().unwrap();
        let a = user(&db, "faculty01", "faculty");
        let b = user(&db, "student01", "student");
        let at = format_timestamp(Utc::now());
        for content in ["first", "second", "third"] {
            db.insert_direct_message(&Uuid::new_v4().to_string(), &a, &b, content, &at).unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor: Option<(String, String)> = None;
        loop {
            let page = db
                .get_conversation(
                    &a,
                    &b,
                    1,
                    cursor.as_ref().map(|(at, _)| at.as_str()),
                    cursor.as_ref().map(|(_, id)| id.as_str()),
                )
                .unwrap();
            let Some(last) = page.last() else { break };
            cursor = Some((last.created_at.clone(), last.id.clone()));
            seen.extend(page.into_iter().map(|row| row.content));
        }
        seen.sort();
        assert_eq!(seen, ["first", "second", "third"]);

        // Timestamp alone stays exclusive
        assert!(db.get_conversation(&a, &b, 10, Some(at.as_str()), None).unwrap().is_empty());
    }

    #[test]
    fn conversations_show_latest_message_and_unread_per_peer() {
        let db = Database::open_in_memory().unwrap();
        let a = user(&db, "faculty01", "faculty");
        let b = user(&db, "student01", "student");
        let c = user(&db, "student02", "student");
        message(&db, &b, &a, "question", 0);
        message(&db, &b, &a, "another question", 10);
        message(&db, &a, &c, "reminder", 20);

        let convos = db.list_conversations(&a).unwrap();
        assert_eq!(convos.len(), 2);

        assert_eq!(convos[0].peer_username, "student02");
        assert_eq!(convos[0].last_message.content, "reminder");
        assert_eq!(convos[0].unread_count, 0);

        assert_eq!(convos[1].peer_id, b);
        assert_eq!(convos[1].last_message.content, "another question");
        assert_eq!(convos[1].unread_count, 2);
    }

    #[test]
    fn mark_conversation_read_only_touches_that_sender() {
        let db = Database::open_in_memory().unwrap();
        let a = user(&db, "faculty01", "faculty");
        let b = user(&db, "student01", "student");
        let c = user(&db, "student02", "student");
        let m1 = message(&db, &b, &a, "one", 0);
        let m2 = message(&db, &b, &a, "two", 10);
        message(&db, &c, &a, "other", 20);

        let flipped = db.mark_conversation_read(&a, &b).unwrap();
        assert_eq!(flipped, vec![m1, m2]);
        assert_eq!(db.unread_count(&a).unwrap(), 1);
        assert!(db.mark_conversation_read(&a, &b).unwrap().is_empty());
    }

    #[test]
    fn notification_read_flags_are_per_user() {
        let db = Database::open_in_memory().unwrap();
        let admin = user(&db, "admin", "admin");
        let s1 = user(&db, "student01", "student");
        let s2 = user(&db, "student02", "student");
        let id = Uuid::new_v4().to_string();
        let now = format_timestamp(Utc::now());
        db.insert_notification(&id, "academic", "Exams", "Exams start Monday", &admin, &now).unwrap();

        assert!(db.mark_notification_read(&id, &s1, &now).unwrap());
        assert!(!db.mark_notification_read(&id, &s1, &now).unwrap());

        let seen = db.list_notifications_for_user(&s1, 10).unwrap();
        let unseen = db.list_notifications_for_user(&s2, 10).unwrap();
        assert!(seen[0].is_read);
        assert!(!unseen[0].is_read);
        assert_eq!(db.count_notifications().unwrap(), 1);
        assert!(db.get_notification(&id).unwrap().is_some());
    }
}
