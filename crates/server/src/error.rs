use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use execution::runtime::RuntimeError;
use services::services::{container::PoolError, proxy::ProxyError};
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Capacity and environment problems are operator-actionable and get
        // 503 so clients can distinguish them from their own bad requests.
        let status = match &self {
            ApiError::Pool(PoolError::Capacity { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Pool(e) if e.is_environment() => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Pool(PoolError::ImageUnavailable { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Runtime(e) if e.is_environment() => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Runtime(RuntimeError::ContainerNotFound(_)) | ApiError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!("API error ({status}): {self}");
        }

        (status, Json(ApiResponse::<()>::error(&self.to_string()))).into_response()
    }
}
