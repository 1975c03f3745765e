//! API key authentication middleware
//!
//! The key is accepted from `X-API-Key` or `Authorization: Bearer <key>`.
//! Only its SHA-256 digest is kept in memory.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::error::ApiError;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing API key (X-API-Key or Authorization: Bearer header)")]
    Missing,

    #[error("Invalid Authorization header format. Expected 'Bearer <key>'")]
    InvalidFormat,

    #[error("Invalid API key")]
    Invalid,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Missing => "MISSING_API_KEY",
            AuthError::InvalidFormat => "INVALID_AUTH_FORMAT",
            AuthError::Invalid => "INVALID_API_KEY",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        ApiError::new(StatusCode::UNAUTHORIZED, self.to_string(), self.code()).into_response()
    }
}

/// Key verification state shared across middleware instances
#[derive(Clone)]
pub struct ApiKeyState {
    digest: [u8; 32],
}

impl ApiKeyState {
    pub fn new(api_key: &str) -> Self {
        Self {
            digest: digest(api_key),
        }
    }

    pub fn verify(&self, candidate: &str) -> bool {
        // Constant-time over the digests.
        let candidate = digest(candidate);
        candidate
            .iter()
            .zip(self.digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let key = extract_key(headers)?;
        if self.verify(&key) {
            Ok(())
        } else {
            Err(AuthError::Invalid)
        }
    }
}

fn digest(key: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(key.as_bytes()));
    out
}

fn extract_key(headers: &HeaderMap) -> Result<String, AuthError> {
    if let Some(value) = headers.get(API_KEY_HEADER) {
        return value
            .to_str()
            .map(|s| s.trim().to_string())
            .map_err(|_| AuthError::Invalid);
    }

    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or(AuthError::Missing)?;

    auth_header
        .strip_prefix("Bearer ")
        .map(|key| key.trim().to_string())
        .ok_or(AuthError::InvalidFormat)
}

/// Rejects requests without a valid API key with 401
pub async fn require_api_key(
    State(state): State<Arc<ApiKeyState>>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    if let Err(e) = state.authenticate(request.headers()) {
        debug!("Rejected {} {}: {}", request.method(), request.uri().path(), e);
        return Err(e);
    }
    Ok(next.run(request).await)
}

/// Random URL-safe key with 256 bits of entropy
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
