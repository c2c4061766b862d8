use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    Configuration(String),

    #[error("Region extraction failed: {0}")]
    Extraction(String),

    #[error("Failed to extract features")]
    FeatureExtraction,

    #[error("Upstream service error: {0}")]
    Upstream(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn missing_env(key: &str) -> Self {
        RelayError::Configuration(format!("{} environment variable not configured", key))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RelayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl RelayError {
    /// Maps a multipart read failure by the status axum assigns it.
    fn from_multipart_status(status: StatusCode, detail: String) -> Self {
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            RelayError::PayloadTooLarge(format!("Request body too large: {}", detail))
        } else {
            RelayError::InvalidInput(format!("Malformed multipart body: {}", detail))
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RelayError::Upstream(format!("request timed out: {}", err))
        } else {
            RelayError::Upstream(err.to_string())
        }
    }
}

impl From<image::ImageError> for RelayError {
    fn from(err: image::ImageError) -> Self {
        RelayError::Extraction(err.to_string())
    }
}

impl From<MultipartError> for RelayError {
    fn from(err: MultipartError) -> Self {
        Self::from_multipart_status(err.status(), err.to_string())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Upstream detail stays in the log; callers get a generic failure.
        let message = match &self {
            RelayError::Upstream(detail) => {
                error!(detail = %detail, "Upstream service call failed");
                "Upstream service request failed".to_string()
            }
            other => {
                if status.is_server_error() {
                    error!("{}", other);
                }
                other.to_string()
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_input_is_bad_request() {
        let err = RelayError::InvalidInput("No image uploaded".into());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "No image uploaded");
    }

    #[test]
    fn test_server_side_errors_are_500() {
        for err in [
            RelayError::missing_env("FASTAPI_YOLO_URL"),
            RelayError::Extraction("empty crop".into()),
            RelayError::FeatureExtraction,
            RelayError::Upstream("connection refused".into()),
            RelayError::Internal("task cancelled".into()),
        ] {
            assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    #[test]
    fn test_configuration_message_names_variable() {
        let err = RelayError::missing_env("FASTAPI_DINO_URL");
        assert_eq!(
            err.to_string(),
            "FASTAPI_DINO_URL environment variable not configured"
        );
    }

    #[test]
    fn test_multipart_length_limit_is_413() {
        let err = RelayError::from_multipart_status(
            StatusCode::PAYLOAD_TOO_LARGE,
            "length limit exceeded".into(),
        );
        assert!(matches!(err, RelayError::PayloadTooLarge(_)));
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let err = RelayError::from_multipart_status(StatusCode::BAD_REQUEST, "bad boundary".into());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
