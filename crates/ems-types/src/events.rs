use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{DirectMessage, Notification, NotificationKind, OnlineUser, Role};

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms the connection is authenticated and registered
    Ready {
        user_id: Uuid,
        username: String,
        role: Role,
    },

    /// A user came online or went offline
    PresenceUpdate {
        user_id: Uuid,
        username: String,
        online: bool,
    },

    /// Reply to a presence query
    PresenceList { users: Vec<OnlineUser> },

    /// A direct message addressed to this connection
    DirectMessage(DirectMessage),

    /// Sent back to the author only, after the message is stored
    MessageAck {
        message_id: Uuid,
        client_ref: Option<String>,
        delivered: bool,
    },

    /// The recipient read one of this connection's messages
    ReadReceipt {
        message_id: Uuid,
        reader_id: Uuid,
        read_at: chrono::DateTime<chrono::Utc>,
    },

    /// A peer started or stopped typing a direct message to this connection
    Typing {
        from_user_id: Uuid,
        from_username: String,
        is_typing: bool,
    },

    /// A privileged user broadcast a notification
    NotificationCreate(Notification),

    /// A command from this connection failed
    Error {
        op: String,
        code: String,
        message: String,
    },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Send a direct message to another user by username
    SendMessage {
        to: String,
        content: String,
        #[serde(default)]
        client_ref: Option<String>,
    },

    /// Indicate typing to another user
    Typing { to: String, is_typing: bool },

    /// Mark a received message as read
    MarkRead { message_id: Uuid },

    /// Mark every unread message from a user as read
    MarkConversationRead { with: String },

    /// Broadcast a notification to everyone connected (privileged roles only)
    Broadcast {
        kind: NotificationKind,
        title: String,
        message: String,
    },

    /// Record that this user has read a notification
    MarkNotificationRead { notification_id: Uuid },

    /// Ask for the current list of online users
    QueryPresence,
}

impl GatewayCommand {
    /// Short operation name used in error replies and logs.
    pub fn op(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::Typing { .. } => "typing",
            Self::MarkRead { .. } => "mark_read",
            Self::MarkConversationRead { .. } => "mark_conversation_read",
            Self::Broadcast { .. } => "broadcast",
            Self::MarkNotificationRead { .. } => "mark_notification_read",
            Self::QueryPresence => "query_presence",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_use_adjacent_tagging() {
        let raw = r#"{"type":"SendMessage","data":{"to":"student01","content":"hi"}}"#;
        match serde_json::from_str::<GatewayCommand>(raw).unwrap() {
            GatewayCommand::SendMessage { to, content, client_ref } => {
                assert_eq!(to, "student01");
                assert_eq!(content, "hi");
                assert!(client_ref.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let raw = r#"{"type":"QueryPresence"}"#;
        assert!(matches!(
            serde_json::from_str::<GatewayCommand>(raw).unwrap(),
            GatewayCommand::QueryPresence
        ));
    }

    #[test]
    fn presence_event_shape() {
        let id = Uuid::new_v4();
        let event = GatewayEvent::PresenceUpdate {
            user_id: id,
            username: "faculty01".into(),
            online: true,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "PresenceUpdate");
        assert_eq!(value["data"]["username"], "faculty01");
        assert_eq!(value["data"]["online"], true);
    }

    #[test]
    fn broadcast_kind_is_lowercase_on_the_wire() {
        let raw = r#"{"type":"Broadcast","data":{"kind":"emergency","title":"Drill","message":"Fire drill at 10"}}"#;
        let cmd: GatewayCommand = serde_json::from_str(raw).unwrap();
        assert_eq!(cmd.op(), "broadcast");
        assert!(matches!(
            cmd,
            GatewayCommand::Broadcast { kind: NotificationKind::Emergency, .. }
        ));
    }
}
