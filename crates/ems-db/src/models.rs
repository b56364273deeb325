/// Database row types. These map directly to SQLite rows.
/// Distinct from ems-types models to keep the DB layer independent;
/// `into_model` converts at the boundary.
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use ems_types::models::{DirectMessage, Notification, Role, User};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub role: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub receiver_id: String,
    pub receiver_username: String,
    pub content: String,
    pub created_at: String,
    pub is_read: bool,
}

/// Latest message with one peer, plus how many of the peer's messages are unread.
pub struct ConversationRow {
    pub peer_id: String,
    pub peer_username: String,
    pub last_message: MessageRow,
    pub unread_count: u32,
}

pub struct NotificationRow {
    pub id: String,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub created_by: String,
    pub created_at: String,
    /// Per-user read flag; always false when fetched without a reader.
    pub is_read: bool,
}

/// Timestamps are stored as RFC 3339 UTC text with microseconds so that
/// lexical order in SQL matches chronological order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    // SQLite's datetime('now') has no timezone marker
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .with_context(|| format!("Corrupt timestamp '{}'", raw))
}

pub fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("Corrupt id '{}'", raw))
}

impl UserRow {
    pub fn role(&self) -> Result<Role> {
        self.role
            .parse()
            .map_err(|e: String| anyhow::anyhow!("{} on user '{}'", e, self.id))
    }

    pub fn into_model(self) -> Result<User> {
        Ok(User {
            id: parse_id(&self.id)?,
            role: self.role()?,
            created_at: parse_timestamp(&self.created_at)?,
            username: self.username,
        })
    }
}

impl MessageRow {
    pub fn into_model(self) -> Result<DirectMessage> {
        Ok(DirectMessage {
            id: parse_id(&self.id)?,
            sender_id: parse_id(&self.sender_id)?,
            sender_username: self.sender_username,
            receiver_id: parse_id(&self.receiver_id)?,
            receiver_username: self.receiver_username,
            content: self.content,
            created_at: parse_timestamp(&self.created_at)?,
            is_read: self.is_read,
        })
    }
}

impl NotificationRow {
    pub fn into_model(self) -> Result<Notification> {
        Ok(Notification {
            id: parse_id(&self.id)?,
            kind: self
                .kind
                .parse()
                .map_err(|e: String| anyhow::anyhow!("{} on notification '{}'", e, self.id))?,
            title: self.title,
            message: self.message,
            created_by: parse_id(&self.created_by)?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}
