use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};

use crate::quota::LimitDimension;

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    Config {
        message: String,
    },
    ConfigurationMissing {
        field: String,
    },
    DownstreamCallFailed {
        message: String,
        status_code: Option<StatusCode>,
        raw_response: Option<String>,
    },
    FileRead {
        message: String,
        file_path: String,
    },
    InternalError {
        message: String,
    },
    InvalidRequest {
        message: String,
    },
    LimitExceeded {
        dimension: LimitDimension,
    },
    Observability {
        message: String,
    },
    StoreUnavailable {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the log level for this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::ConfigurationMissing { .. } => tracing::Level::ERROR,
            ErrorDetails::DownstreamCallFailed { .. } => tracing::Level::ERROR,
            ErrorDetails::FileRead { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::LimitExceeded { .. } => tracing::Level::DEBUG,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::StoreUnavailable { .. } => tracing::Level::WARN,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::ConfigurationMissing { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::DownstreamCallFailed { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::FileRead { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::LimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::Observability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable machine-readable tag included in error response bodies
    pub fn error_type(&self) -> &'static str {
        match self {
            ErrorDetails::Config { .. } => "config",
            ErrorDetails::ConfigurationMissing { .. } => "configuration_missing",
            ErrorDetails::DownstreamCallFailed { .. } => "downstream_call_failed",
            ErrorDetails::FileRead { .. } => "file_read",
            ErrorDetails::InternalError { .. } => "internal_error",
            ErrorDetails::InvalidRequest { .. } => "invalid_request",
            ErrorDetails::LimitExceeded { .. } => "limit_exceeded",
            ErrorDetails::Observability { .. } => "observability",
            ErrorDetails::StoreUnavailable { .. } => "store_unavailable",
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }

    /// Body returned to HTTP clients. Provider and store internals stay in the
    /// logs; clients get a generic message for those variants.
    fn to_response_json(&self) -> Value {
        match self {
            ErrorDetails::DownstreamCallFailed { .. } => json!({
                "error": {
                    "message": "The downstream completion request failed",
                    "type": self.error_type(),
                }
            }),
            ErrorDetails::StoreUnavailable { .. } => json!({
                "error": {
                    "message": "Quota state is temporarily unavailable; request denied",
                    "type": self.error_type(),
                }
            }),
            ErrorDetails::InternalError { .. } => json!({
                "error": {
                    "message": "Internal server error",
                    "type": self.error_type(),
                }
            }),
            ErrorDetails::LimitExceeded { dimension } => json!({
                "error": {
                    "message": self.to_string(),
                    "type": self.error_type(),
                    "reason": dimension,
                }
            }),
            _ => json!({
                "error": {
                    "message": self.to_string(),
                    "type": self.error_type(),
                }
            }),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::Config { message } => {
                write!(f, "Configuration error: {message}")
            }
            ErrorDetails::ConfigurationMissing { field } => {
                write!(
                    f,
                    "Required configuration `{field}` is missing; refusing to start the dependent component"
                )
            }
            ErrorDetails::DownstreamCallFailed {
                message,
                status_code,
                raw_response,
            } => {
                write!(f, "Downstream completion call failed: {message}")?;
                if let Some(status_code) = status_code {
                    write!(f, " (status {status_code})")?;
                }
                if let Some(raw_response) = raw_response {
                    write!(f, ". Raw response: {raw_response}")?;
                }
                Ok(())
            }
            ErrorDetails::FileRead { message, file_path } => {
                write!(f, "Error reading file `{file_path}`: {message}")
            }
            ErrorDetails::InternalError { message } => {
                write!(f, "Internal error: {message}")
            }
            ErrorDetails::InvalidRequest { message } => {
                write!(f, "Invalid request: {message}")
            }
            ErrorDetails::LimitExceeded { dimension } => {
                write!(f, "Quota exceeded on dimension `{dimension}`")
            }
            ErrorDetails::Observability { message } => {
                write!(f, "Error setting up observability: {message}")
            }
            ErrorDetails::StoreUnavailable { message } => {
                write!(f, "Counter store unavailable: {message}")
            }
        }
    }
}

impl IntoResponse for Error {
    /// Convert the error into an Axum response
    fn into_response(self) -> Response {
        let body = self.0.to_response_json();
        (self.status_code(), Json(body)).into_response()
    }
}
