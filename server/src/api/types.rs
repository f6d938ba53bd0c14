//! Shared API types
//!
//! Common types used across all API endpoints including error handling and
//! query-parameter parsing.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde_json::json;

/// Parse an optional timestamp string parameter (RFC 3339 / ISO 8601 format)
pub fn parse_timestamp_param(s: &Option<String>) -> Result<Option<DateTime<Utc>>, ApiError> {
    match s {
        Some(ts) => DateTime::parse_from_rfc3339(ts)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| {
                ApiError::bad_request(
                    "INVALID_TIMESTAMP",
                    format!("Invalid timestamp format: {}. Use ISO 8601 format.", ts),
                )
            }),
        None => Ok(None),
    }
}

/// Standard API error response
#[derive(Debug)]
pub enum ApiError {
    BadRequest { code: String, message: String },
    NotFound { code: String, message: String },
    Unauthorized { code: String, message: String },
    Forbidden { code: String, message: String },
    Internal { message: String },
}

impl ApiError {
    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NotFound {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unauthorized {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn forbidden(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Forbidden {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

}

impl From<crate::domain::fleet::FleetError> for ApiError {
    fn from(e: crate::domain::fleet::FleetError) -> Self {
        use crate::domain::fleet::FleetError;
        match e {
            FleetError::Unauthorized => Self::unauthorized("INVALID_FLEET_KEY", e.to_string()),
            FleetError::UnknownNode(_) => Self::forbidden("UNKNOWN_NODE", e.to_string()),
            FleetError::ClockSkew(_) => Self::bad_request("CLOCK_SKEW", e.to_string()),
            FleetError::Disabled => Self::not_found("FLEET_DISABLED", e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, code, message) = match self {
            Self::BadRequest { code, message } => {
                (StatusCode::BAD_REQUEST, "bad_request", code, message)
            }
            Self::NotFound { code, message } => (StatusCode::NOT_FOUND, "not_found", code, message),
            Self::Unauthorized { code, message } => {
                (StatusCode::UNAUTHORIZED, "unauthorized", code, message)
            }
            Self::Forbidden { code, message } => {
                (StatusCode::FORBIDDEN, "forbidden", code, message)
            }
            Self::Internal { message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "INTERNAL".to_string(),
                message,
            ),
        };
        (
            status,
            Json(json!({
                "error": error_type,
                "code": code,
                "message": message
            })),
        )
            .into_response()
    }
}
