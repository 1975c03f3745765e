//! Subdomain generation and validation

use rand::distributions::Uniform;
use rand::Rng;

use crate::error::{ControlError, Result};

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Length of generated subdomains
pub const GENERATED_LENGTH: usize = 8;

/// How tunnel subdomains are generated and which user-supplied ones are accepted
///
/// The default validation follows DNS label rules:
/// - lowercase ASCII letters, digits and hyphens only
/// - between 3 and 63 characters
/// - no leading or trailing hyphen
pub trait SubdomainPolicy: Send + Sync {
    /// Produce a candidate; uniqueness is checked by the caller
    fn generate(&self) -> String;

    fn validate(&self, subdomain: &str) -> Result<()> {
        if subdomain.is_empty() {
            return Err(ControlError::InvalidSubdomain(
                "Subdomain cannot be empty".to_string(),
            ));
        }

        if subdomain.len() > 63 {
            return Err(ControlError::InvalidSubdomain(format!(
                "Subdomain too long (max 63 characters): {}",
                subdomain.len()
            )));
        }

        if subdomain.len() < 3 {
            return Err(ControlError::InvalidSubdomain(
                "Subdomain too short (minimum 3 characters)".to_string(),
            ));
        }

        if subdomain.starts_with('-') || subdomain.ends_with('-') {
            return Err(ControlError::InvalidSubdomain(
                "Subdomain cannot start or end with hyphen".to_string(),
            ));
        }

        for ch in subdomain.chars() {
            if !(ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-') {
                return Err(ControlError::InvalidSubdomain(format!(
                    "Subdomain contains invalid character '{}' (only a-z, 0-9 and hyphens allowed)",
                    ch
                )));
            }
        }

        Ok(())
    }
}

/// Random `[a-z0-9]` labels of fixed length
#[derive(Debug, Clone)]
pub struct RandomSubdomainPolicy {
    length: usize,
}

impl RandomSubdomainPolicy {
    pub fn new() -> Self {
        Self {
            length: GENERATED_LENGTH,
        }
    }
}

impl Default for RandomSubdomainPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SubdomainPolicy for RandomSubdomainPolicy {
    fn generate(&self) -> String {
        let dist = Uniform::from(0..ALPHABET.len());
        rand::thread_rng()
            .sample_iter(dist)
            .take(self.length)
            .map(|i| ALPHABET[i] as char)
            .collect()
    }
}

/// `https://{subdomain}.{base_domain}`
pub fn public_url(subdomain: &str, base_domain: &str) -> String {
    format!("https://{}.{}", subdomain, base_domain)
}
