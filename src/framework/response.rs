use crate::error::DbError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

impl DbError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Permission { .. } => StatusCode::FORBIDDEN,
            Self::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Cleanup {
                original: Some(original),
                ..
            } => original.status(),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DbError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            // Driver and configuration details stay in the log
            tracing::error!(error = %self, "Request failed");
            "an internal error occurred".to_string()
        } else {
            self.to_string()
        };
        let body = json!({
            "error": status.canonical_reason().unwrap_or("error"),
            "message": message,
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(DbError::not_found(Some("user")).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            DbError::permission("write", "read-only bind").status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(DbError::NoActiveScope.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let wrapped = DbError::with_cleanup(
            DbError::not_found(None::<String>),
            vec![DbError::internal("close failed")],
        );
        assert_eq!(wrapped.status(), StatusCode::NOT_FOUND);
    }
}
