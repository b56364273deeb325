use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info};
use uuid::Uuid;

use ems_db::Database;
use ems_db::models::{format_timestamp, parse_id, parse_timestamp};
use ems_types::api::{Claims, ConversationSummary, NotificationView};
use ems_types::events::GatewayEvent;
use ems_types::models::{DirectMessage, Notification, NotificationKind, OnlineUser, Role};

use crate::dispatcher::Dispatcher;
use crate::error::HubError;

/// Longest direct message body accepted, in characters.
pub const MAX_CONTENT_CHARS: usize = 4000;

/// History page size cap.
pub const MAX_HISTORY_LIMIT: u32 = 200;

/// The authenticated identity behind a request or live connection.
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: Uuid,
    pub username: String,
    pub role: Role,
}

impl From<&Claims> for Actor {
    fn from(claims: &Claims) -> Self {
        Self {
            user_id: claims.sub,
            username: claims.username.clone(),
            role: claims.role,
        }
    }
}

/// Direct message relay, read receipts, typing signals and notification
/// broadcasts. Every write is persisted before anything is delivered.
#[derive(Clone)]
pub struct Hub {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

impl Hub {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run a database closure off the async runtime.
    async fn blocking<F, T>(&self, f: F) -> Result<T, HubError>
    where
        F: FnOnce(&Database) -> Result<T, HubError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                HubError::Storage(e.into())
            })?
    }

    // -- Direct messages --

    /// Store a message, then deliver it to the recipient if they are online.
    /// The sender's own connection gets a `MessageAck` either way.
    pub async fn send_direct(
        &self,
        sender: &Actor,
        to: &str,
        content: &str,
        client_ref: Option<String>,
    ) -> Result<DirectMessage, HubError> {
        validate_content(content)?;

        let sender_id = sender.user_id;
        let to = to.to_string();
        let content = content.to_string();

        let message = self
            .blocking(move |db| {
                let sender_row = db
                    .get_user_by_id(&sender_id.to_string())?
                    .ok_or(HubError::UnknownSender)?;
                let recipient_row = db
                    .get_user_by_username(&to)?
                    .ok_or_else(|| HubError::UnknownRecipient(to.clone()))?;

                let receiver_id = parse_id(&recipient_row.id)?;
                if receiver_id == sender_id {
                    return Err(HubError::SelfMessage);
                }

                let id = Uuid::new_v4();
                let stamp = format_timestamp(Utc::now());
                db.insert_direct_message(
                    &id.to_string(),
                    &sender_row.id,
                    &recipient_row.id,
                    &content,
                    &stamp,
                )?;

                Ok(DirectMessage {
                    id,
                    sender_id,
                    sender_username: sender_row.username,
                    receiver_id,
                    receiver_username: recipient_row.username,
                    content,
                    created_at: parse_timestamp(&stamp)?,
                    is_read: false,
                })
            })
            .await?;

        let delivered = self
            .dispatcher
            .send_to_user(message.receiver_id, GatewayEvent::DirectMessage(message.clone()))
            .await;

        debug!(
            "{} -> {} message {} (delivered: {})",
            message.sender_username, message.receiver_username, message.id, delivered
        );

        self.dispatcher
            .send_to_user(
                sender_id,
                GatewayEvent::MessageAck {
                    message_id: message.id,
                    client_ref,
                    delivered,
                },
            )
            .await;

        Ok(message)
    }

    /// Mark a message read. Only its recipient may do this. Idempotent: the
    /// sender gets a `ReadReceipt` only on the unread -> read transition.
    pub async fn mark_read(&self, reader: &Actor, message_id: Uuid) -> Result<DirectMessage, HubError> {
        let reader_id = reader.user_id;

        let (mut message, flipped) = self
            .blocking(move |db| {
                let row = db
                    .get_direct_message(&message_id.to_string())?
                    .ok_or(HubError::MessageNotFound)?;
                let message = row.into_model()?;
                if message.receiver_id != reader_id {
                    return Err(HubError::NotRecipient);
                }
                let flipped = db.mark_message_read(&message_id.to_string())?;
                Ok((message, flipped))
            })
            .await?;

        message.is_read = true;
        if flipped {
            self.send_receipt(message.sender_id, message.id, reader_id).await;
        }
        Ok(message)
    }

    /// Mark every unread message from `with` to the reader as read.
    /// Returns the ids that changed; one receipt is sent per id.
    pub async fn mark_conversation_read(&self, reader: &Actor, with: &str) -> Result<Vec<Uuid>, HubError> {
        let reader_id = reader.user_id;
        let with = with.to_string();

        let (peer_id, flipped) = self
            .blocking(move |db| {
                let peer = db
                    .get_user_by_username(&with)?
                    .ok_or_else(|| HubError::UnknownUser(with.clone()))?;
                let flipped = db.mark_conversation_read(&reader_id.to_string(), &peer.id)?;
                let flipped = flipped
                    .iter()
                    .map(|id| parse_id(id))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Ok((parse_id(&peer.id)?, flipped))
            })
            .await?;

        for message_id in &flipped {
            self.send_receipt(peer_id, *message_id, reader_id).await;
        }
        Ok(flipped)
    }

    async fn send_receipt(&self, sender_id: Uuid, message_id: Uuid, reader_id: Uuid) {
        self.dispatcher
            .send_to_user(
                sender_id,
                GatewayEvent::ReadReceipt {
                    message_id,
                    reader_id,
                    read_at: Utc::now(),
                },
            )
            .await;
    }

    /// Ephemeral typing signal. Never stored; dropped if the peer is offline.
    pub async fn typing(&self, sender: &Actor, to: &str, is_typing: bool) -> Result<(), HubError> {
        let to = to.to_string();
        let recipient_id = self
            .blocking(move |db| {
                let row = db
                    .get_user_by_username(&to)?
                    .ok_or_else(|| HubError::UnknownRecipient(to.clone()))?;
                Ok(parse_id(&row.id)?)
            })
            .await?;

        self.dispatcher
            .send_to_user(
                recipient_id,
                GatewayEvent::Typing {
                    from_user_id: sender.user_id,
                    from_username: sender.username.clone(),
                    is_typing,
                },
            )
            .await;
        Ok(())
    }

    // -- Notifications --

    /// Persist a notification and fan it out to everyone connected.
    /// Non-privileged roles are rejected before anything is stored.
    pub async fn broadcast_notification(
        &self,
        actor: &Actor,
        kind: NotificationKind,
        title: &str,
        message: &str,
    ) -> Result<Notification, HubError> {
        if !actor.role.is_privileged() {
            return Err(HubError::Forbidden(actor.role));
        }
        if title.trim().is_empty() || message.trim().is_empty() {
            return Err(HubError::EmptyContent);
        }

        let notification = Notification {
            id: Uuid::new_v4(),
            kind,
            title: title.to_string(),
            message: message.to_string(),
            created_by: actor.user_id,
            created_at: Utc::now(),
        };

        let row = notification.clone();
        let notification = self
            .blocking(move |db| {
                let stamp = format_timestamp(row.created_at);
                db.insert_notification(
                    &row.id.to_string(),
                    row.kind.as_str(),
                    &row.title,
                    &row.message,
                    &row.created_by.to_string(),
                    &stamp,
                )?;
                Ok(Notification {
                    created_at: parse_timestamp(&stamp)?,
                    ..row
                })
            })
            .await?;

        info!(
            "{} ({}) broadcast {} notification {}",
            actor.username,
            actor.role,
            notification.kind.as_str(),
            notification.id
        );
        self.dispatcher
            .broadcast(GatewayEvent::NotificationCreate(notification.clone()));

        Ok(notification)
    }

    pub async fn mark_notification_read(&self, actor: &Actor, notification_id: Uuid) -> Result<(), HubError> {
        let user_id = actor.user_id;
        self.blocking(move |db| {
            let id = notification_id.to_string();
            if db.get_notification(&id)?.is_none() {
                return Err(HubError::NotificationNotFound);
            }
            db.mark_notification_read(&id, &user_id.to_string(), &format_timestamp(Utc::now()))?;
            Ok(())
        })
        .await
    }

    pub async fn notifications(&self, actor: &Actor, limit: u32) -> Result<Vec<NotificationView>, HubError> {
        let user_id = actor.user_id;
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        self.blocking(move |db| {
            let rows = db.list_notifications_for_user(&user_id.to_string(), limit)?;
            let views = rows
                .into_iter()
                .map(|row| {
                    let is_read = row.is_read;
                    let n = row.into_model()?;
                    Ok(NotificationView {
                        id: n.id,
                        kind: n.kind,
                        title: n.title,
                        message: n.message,
                        created_by: n.created_by,
                        created_at: n.created_at,
                        is_read,
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(views)
        })
        .await
    }

    // -- Read path for clients that were offline --

    pub async fn conversations(&self, actor: &Actor) -> Result<Vec<ConversationSummary>, HubError> {
        let user_id = actor.user_id;
        self.blocking(move |db| {
            let rows = db.list_conversations(&user_id.to_string())?;
            let summaries = rows
                .into_iter()
                .map(|row| {
                    Ok(ConversationSummary {
                        peer_id: parse_id(&row.peer_id)?,
                        peer_username: row.peer_username,
                        last_message: row.last_message.into_model()?,
                        unread_count: row.unread_count,
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(summaries)
        })
        .await
    }

    /// Messages between the actor and `with`, newest first. `before` is an
    /// RFC 3339 timestamp taken from the oldest message of the previous page;
    /// `before_id` is that message's id, so rows sharing its timestamp are
    /// not skipped.
    pub async fn history(
        &self,
        actor: &Actor,
        with: &str,
        limit: u32,
        before: Option<String>,
        before_id: Option<Uuid>,
    ) -> Result<Vec<DirectMessage>, HubError> {
        let cursor = match before {
            Some(raw) => Some(format_timestamp(
                parse_timestamp(&raw).map_err(|_| HubError::InvalidCursor(raw.clone()))?,
            )),
            None => None,
        };
        let user_id = actor.user_id;
        let with = with.to_string();
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);

        self.blocking(move |db| {
            let peer = db
                .get_user_by_username(&with)?
                .ok_or_else(|| HubError::UnknownUser(with.clone()))?;
            let rows = db.get_conversation(
                &user_id.to_string(),
                &peer.id,
                limit,
                cursor.as_deref(),
                before_id.map(|id| id.to_string()).as_deref(),
            )?;
            let messages = rows
                .into_iter()
                .map(|row| row.into_model())
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(messages)
        })
        .await
    }

    pub async fn unread_count(&self, actor: &Actor) -> Result<u32, HubError> {
        let user_id = actor.user_id;
        self.blocking(move |db| Ok(db.unread_count(&user_id.to_string())?))
            .await
    }

    pub async fn presence(&self) -> Vec<OnlineUser> {
        self.dispatcher.online_users().await
    }
}

fn validate_content(content: &str) -> Result<(), HubError> {
    if content.trim().is_empty() {
        return Err(HubError::EmptyContent);
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(HubError::ContentTooLong { max: MAX_CONTENT_CHARS });
    }
    Ok(())
}
