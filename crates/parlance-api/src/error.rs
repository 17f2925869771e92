use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use parlance_domain::status_code;
use parlance_store::StoreError;
use serde_json::json;

pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::BAD_REQUEST, message: msg.into() }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::NOT_FOUND, message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::INTERNAL_SERVER_ERROR, message: msg.into() }
    }

    /// Map a triggering-façade error chain, honoring any status it carries.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        let status = StatusCode::from_u16(status_code(&err))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        ApiError { status, message: err.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => ApiError::not_found(e.to_string()),
            StoreError::Conflict(_) => {
                ApiError { status: StatusCode::CONFLICT, message: e.to_string() }
            }
            _ => ApiError::internal(e.to_string()),
        }
    }
}
