//! Auth token middleware.
//!
//! All requests must carry the bearer token: `Authorization: Bearer`,
//! the `flypad_token` cookie, or — only when `FYP_ALLOW_QUERY_TOKEN_AUTH=1`
//! — a `?token=` query parameter (WebSocket clients can't set headers).
//! `/health` and `/pair/claim` stay unauthenticated.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::pairing::AuthService;

/// Axum middleware that checks for a valid auth token.
pub async fn auth_middleware(
    State(auth): State<Arc<AuthService>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Health stays open; pairing claims are how tokens are obtained.
    if path == "/health" || path == "/pair/claim" {
        return Ok(next.run(req).await);
    }

    // Authorization header first
    if let Some(auth_header) = req.headers().get("authorization") {
        if let Ok(value) = auth_header.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                if auth.verify_token(token) {
                    return Ok(next.run(req).await);
                }
            }
        }
    }

    // Cookie
    if let Some(cookie_header) = req.headers().get("cookie") {
        if let Ok(value) = cookie_header.to_str() {
            for pair in value.split(';') {
                if let Some(token) = pair.trim().strip_prefix("flypad_token=") {
                    if auth.verify_token(token) {
                        return Ok(next.run(req).await);
                    }
                }
            }
        }
    }

    // Query param, only when explicitly enabled
    if auth.allow_query_token() {
        if let Some(query) = req.uri().query() {
            for pair in query.split('&') {
                if let Some(token) = pair.strip_prefix("token=") {
                    if auth.verify_token(token) {
                        return Ok(next.run(req).await);
                    }
                }
            }
        }
    }

    Err(StatusCode::UNAUTHORIZED)
}
