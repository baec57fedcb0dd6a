//! Executor error to HTTP response mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gemini_executor::ExecuteError;

/// JSON error envelope returned by every failing route.
pub struct ApiError(pub ExecuteError);

/// Fixed kind-to-status table for the admin surface.
pub fn status_for(error: &ExecuteError) -> StatusCode {
    match error {
        ExecuteError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ExecuteError::SelectionFailed => StatusCode::SERVICE_UNAVAILABLE,
        ExecuteError::AllFailed { .. } => StatusCode::BAD_GATEWAY,
        ExecuteError::Network {
            retryable: true, ..
        } => StatusCode::GATEWAY_TIMEOUT,
        ExecuteError::Network {
            retryable: false, ..
        } => StatusCode::BAD_GATEWAY,
        ExecuteError::Parse { .. } => StatusCode::BAD_GATEWAY,
        ExecuteError::Upstream { code, .. } => match code {
            401 => StatusCode::UNAUTHORIZED,
            429 => StatusCode::TOO_MANY_REQUESTS,
            400 => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        },
        ExecuteError::Cancelled => {
            // Client went away mid-request.
            StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let mut body = serde_json::json!({
            "error": {
                "kind": self.0.kind(),
                "message": self.0.to_string(),
            }
        });
        if let ExecuteError::AllFailed {
            validation_url: Some(url),
            ..
        }
        | ExecuteError::Upstream {
            validation_url: Some(url),
            ..
        } = &self.0
        {
            body["error"]["validation_url"] = serde_json::json!(url);
        }
        (status, axum::Json(body)).into_response()
    }
}
