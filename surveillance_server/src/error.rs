use crate::media::MediaError;
use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use threat_detection::InferenceError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Media(#[from] MediaError),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Inference(e) => match e {
                InferenceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                InferenceError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                InferenceError::Conflict(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Media(e) if e.is_invalid_input() => StatusCode::BAD_REQUEST,
            ApiError::Media(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn detail(&self) -> String {
        match self {
            ApiError::Inference(e) => match e {
                InferenceError::InvalidInput(msg)
                | InferenceError::ModelUnavailable(msg)
                | InferenceError::Conflict(msg) => msg.clone(),
                other => other.to_string(),
            },
            other => other.to_string(),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::BadRequest(format!("Invalid multipart body: {}", err.body_text()))
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("worker task failed: {}", err))
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }

        let body = ErrorResponse {
            detail: self.detail(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inference_errors_map_to_http_status() {
        let cases = [
            (InferenceError::invalid_input("bad"), StatusCode::BAD_REQUEST),
            (InferenceError::unavailable("gone"), StatusCode::SERVICE_UNAVAILABLE),
            (InferenceError::Conflict("busy".into()), StatusCode::CONFLICT),
            (InferenceError::internal("boom"), StatusCode::INTERNAL_SERVER_ERROR),
            (InferenceError::media("codec"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status_code(), status);
        }
    }

    #[test]
    fn client_errors_keep_their_message_as_detail() {
        let err = ApiError::from(InferenceError::Conflict(
            "Training already in progress".into(),
        ));
        assert_eq!(err.detail(), "Training already in progress");
    }

    #[test]
    fn unreadable_video_is_a_client_error() {
        let err = ApiError::from(MediaError::InvalidVideo("no video stream".into()));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
