use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use ems_gateway::HubError;
use ems_types::api::ErrorBody;

/// HTTP face of a hub failure.
pub struct ApiError(pub HubError);

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            HubError::EmptyContent
            | HubError::ContentTooLong { .. }
            | HubError::SelfMessage
            | HubError::InvalidCursor(_) => StatusCode::BAD_REQUEST,
            HubError::UnknownRecipient(_)
            | HubError::UnknownUser(_)
            | HubError::MessageNotFound
            | HubError::NotificationNotFound => StatusCode::NOT_FOUND,
            HubError::UnknownSender => StatusCode::UNAUTHORIZED,
            HubError::NotRecipient | HubError::Forbidden(_) => StatusCode::FORBIDDEN,
            HubError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self.0 {
            HubError::Storage(cause) => {
                error!("Storage failure: {:#}", cause);
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: self.0.code().to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
