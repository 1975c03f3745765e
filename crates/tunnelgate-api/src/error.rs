use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, error};
use tunnelgate_control::{ControlError, ErrorKind};

use crate::models::ErrorResponse;

/// Error returned by handlers, rendered as `{error, code}`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>, code: &str) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.into(),
                code: Some(code.to_string()),
            },
        }
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::ExternalToolFailure
        | ErrorKind::ConfigurationMissing
        | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        let status = status_for(err.kind());
        if status.is_server_error() {
            error!("Request failed ({}): {}", err.code(), err);
        } else {
            debug!("Request rejected ({}): {}", err.code(), err);
        }
        Self::new(status, err.to_string(), err.code())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
