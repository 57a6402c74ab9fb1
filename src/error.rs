//! Error types shared by the prediction pipeline and the HTTP layer

use std::time::Duration;

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

use crate::backends::BackendKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid image: {0}")]
    Decode(String),

    #[error("Unknown backend '{0}'. Must be one of tf-serving, tf-lite, ai-platform")]
    UnknownBackend(String),

    #[error("Backend {0} is not configured")]
    BackendNotConfigured(BackendKind),

    #[error("Model server did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Model server unavailable: {0}")]
    Unavailable(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid scores: {0}")]
    InvalidScores(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Report error: {0}")]
    Report(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Server(String),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            // reqwest does not expose the configured duration on the error
            Error::Unavailable(format!("request timed out: {}", e))
        } else if e.is_connect() {
            Error::Unavailable(e.to_string())
        } else {
            Error::Backend(e.to_string())
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<actix_web::error::BlockingError> for Error {
    fn from(e: actix_web::error::BlockingError) -> Self {
        Error::Server(e.to_string())
    }
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::Decode(_) | Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::UnknownBackend(_) => StatusCode::NOT_FOUND,
            Error::BackendNotConfigured(_) | Error::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Backend(_)
            | Error::InvalidScores(_)
            | Error::Storage(_)
            | Error::Report(_)
            | Error::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(detail = %self, "Server-side error occurred");
            "Server-side error occurred.".to_string()
        } else {
            tracing::warn!(detail = %self, status = status.as_u16(), "Request failed");
            self.to_string()
        };

        HttpResponse::build(status).json(json!({
            "error": true,
            "message": message,
        }))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
