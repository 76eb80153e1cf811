//! Shared-secret gate in front of every entry point.
//!
//! The HTTP routes go through [`require_token`]; tail sessions call
//! [`AuthGate::check`] on their handshake message.

use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::error::{ControlError, Result};

/// Header carrying the admin token on HTTP requests.
pub const TOKEN_HEADER: &str = "x-admin-token";

#[derive(Clone)]
pub struct AuthGate {
    secret: Arc<str>,
}

impl AuthGate {
    pub fn new(secret: impl Into<String>) -> Self {
        let secret: String = secret.into();
        Self {
            secret: Arc::from(secret),
        }
    }

    /// Permit only an exact match. Comparison is constant-time in the token contents.
    pub fn check(&self, presented: Option<&str>) -> Result<()> {
        let Some(token) = presented else {
            return Err(ControlError::Unauthorized);
        };
        if self.secret.is_empty() {
            return Err(ControlError::Unauthorized);
        }
        if bool::from(token.as_bytes().ct_eq(self.secret.as_bytes())) {
            Ok(())
        } else {
            Err(ControlError::Unauthorized)
        }
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Pull the presented token from the header, falling back to `?token=`.
pub fn presented_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    if let Some(value) = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(value.to_string());
    }
    Query::<TokenQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(q)| q.token)
}

/// Middleware applied to the whole `/api` router.
pub async fn require_token(
    State(gate): State<AuthGate>,
    request: Request,
    next: Next,
) -> Response {
    let token = presented_token(request.headers(), request.uri());

    if let Err(e) = gate.check(token.as_deref()) {
        tracing::warn!(
            method = %request.method(),
            path = %request.uri().path(),
            "Rejected request without a valid admin token"
        );
        return crate::engine::server::error_response(&e).into_response();
    }

    next.run(request).await
}
