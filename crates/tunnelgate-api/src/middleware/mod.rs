//! API Middleware
//!
//! Middleware layers for authentication and request processing.

pub mod auth;

pub use auth::{generate_api_key, require_api_key, ApiKeyState, AuthError};
