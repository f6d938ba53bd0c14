//! Bearer-token authentication for the query and admin surfaces
//!
//! Ingestion endpoints stay open; everything under /api is guarded by a
//! single secret token, either configured or generated at startup. The
//! token is accepted as `Authorization: Bearer <token>` or, for SSE
//! clients that cannot set headers, as a `token` query parameter.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::utils::crypto::{constant_time_eq, generate_token};

/// Authentication error response
#[derive(Debug)]
pub struct AuthError {
    pub status: StatusCode,
    pub error: &'static str,
    pub code: &'static str,
    pub message: String,
}

impl AuthError {
    pub fn required() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            error: "unauthorized",
            code: "AUTH_REQUIRED",
            message: "Authentication required".to_string(),
        }
    }

    pub fn invalid() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            error: "unauthorized",
            code: "TOKEN_INVALID",
            message: "Invalid token".to_string(),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.error,
            "code": self.code,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

/// Token validation service
pub struct AuthService {
    enabled: bool,
    token: String,
}

impl AuthService {
    /// Build from config. Generates a fresh token when auth is on but no
    /// token was supplied; the caller prints it in the startup banner.
    pub fn new(enabled: bool, configured_token: Option<String>) -> Self {
        let token = match configured_token {
            Some(t) if !t.is_empty() => t,
            _ => generate_token(32),
        };
        Self { enabled, token }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Validate a presented token
    pub fn verify(&self, presented: &str) -> bool {
        constant_time_eq(presented, &self.token)
    }
}

/// Extract the presented token from the Authorization header or the
/// `token` query parameter
fn presented_token(req: &Request) -> Option<String> {
    if let Some(value) = req.headers().get(header::AUTHORIZATION)
        && let Ok(value) = value.to_str()
        && let Some(token) = value.strip_prefix("Bearer ")
    {
        return Some(token.to_string());
    }
    req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("token=")
                .map(|t| urlencoded_decode(t).unwrap_or_else(|| t.to_string()))
        })
    })
}

// Minimal percent-decoding: tokens are hex so only %XX escapes matter
fn urlencoded_decode(s: &str) -> Option<String> {
    if !s.contains('%') {
        return None;
    }
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 3 <= bytes.len() {
            let hex = s.get(i + 1..i + 3)?;
            let byte = u8::from_str_radix(hex, 16).ok()?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Authentication middleware for the query and admin routes
pub async fn require_auth(
    State(auth): State<Arc<AuthService>>,
    req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    if !auth.enabled() {
        return Ok(next.run(req).await);
    }

    let Some(token) = presented_token(&req) else {
        return Err(AuthError::required());
    };
    if !auth.verify(&token) {
        return Err(AuthError::invalid());
    }
    Ok(next.run(req).await)
}
