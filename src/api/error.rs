use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::controller::ControlError;
use crate::storage::{HistoryError, RegistryError};
use crate::videos::VideoError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Video(#[from] VideoError),
    #[error(transparent)]
    History(#[from] HistoryError),
}

fn registry_status(e: &RegistryError) -> StatusCode {
    match e {
        RegistryError::Validation(_) => StatusCode::BAD_REQUEST,
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::Database(_) | RegistryError::Poisoned => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Registry(e) => registry_status(e),
            ApiError::Control(ControlError::Registry(e)) => registry_status(e),
            ApiError::Control(ControlError::StartupFailure(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Video(VideoError::InvalidName(_)) => StatusCode::BAD_REQUEST,
            ApiError::Video(VideoError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::History(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError::from(RegistryError::Validation("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(ControlError::Registry(RegistryError::NotFound(4))).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(ControlError::StartupFailure("down".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(VideoError::NotFound("a.mp4".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(RegistryError::Poisoned).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
