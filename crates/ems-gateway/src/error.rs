use ems_types::models::Role;

/// Classified failure of a hub operation. Sent back to the calling
/// connection only; storage failures are logged and never leak detail.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("content must not be empty")]
    EmptyContent,

    #[error("content exceeds {max} characters")]
    ContentTooLong { max: usize },

    #[error("cannot send a message to yourself")]
    SelfMessage,

    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("sender account no longer exists")]
    UnknownSender,

    #[error("message not found")]
    MessageNotFound,

    #[error("only the recipient can mark a message as read")]
    NotRecipient,

    #[error("notification not found")]
    NotificationNotFound,

    #[error("role '{0}' may not broadcast notifications")]
    Forbidden(Role),

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("storage failure")]
    Storage(#[from] anyhow::Error),
}

impl HubError {
    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyContent => "empty_content",
            Self::ContentTooLong { .. } => "content_too_long",
            Self::SelfMessage => "self_message",
            Self::UnknownRecipient(_) => "unknown_recipient",
            Self::UnknownUser(_) => "unknown_user",
            Self::UnknownSender => "unknown_sender",
            Self::MessageNotFound => "message_not_found",
            Self::NotRecipient => "not_recipient",
            Self::NotificationNotFound => "notification_not_found",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidCursor(_) => "invalid_cursor",
            Self::Storage(_) => "internal",
        }
    }
}
