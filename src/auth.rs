//! Input validation and request throttling
//!
//! Usernames double as file names in the key store and as path segments
//! in directory URLs, so they are validated everywhere they enter.

use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap};
use dashmap::DashMap;

use crate::crypto::verifying_key_from_jwk;
use crate::types::PublicJwk;

/// Fixed-window request counter keyed by client and endpoint
pub struct RateLimiter {
    /// (window start, requests seen in window)
    windows: DashMap<String, (Instant, u32)>,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            limit,
            window,
        }
    }

    /// Count a request; false once the client exceeded its window budget
    pub fn check(&self, client: &str, endpoint: &str) -> bool {
        self.check_with_limit(client, endpoint, self.limit)
    }

    /// Like [`RateLimiter::check`] with an endpoint specific budget
    pub fn check_with_limit(&self, client: &str, endpoint: &str, limit: u32) -> bool {
        let now = Instant::now();

        // Clean up expired windows
        self.windows
            .retain(|_, (start, _)| now.duration_since(*start) < self.window);

        let key = format!("{}:{}", client, endpoint);
        let mut entry = self.windows.entry(key).or_insert((now, 0));
        if entry.1 >= limit {
            return false;
        }
        entry.1 += 1;
        true
    }

    /// Number of tracked windows (for stats)
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// Best-effort client address from proxy headers
pub fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("cf-connecting-ip")
        .or_else(|| headers.get("x-forwarded-for"))
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".into())
}

/// Bearer token from the Authorization header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

// ============ Validation Functions ============

/// Validate a GitHub username
pub fn validate_username(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Username cannot be empty");
    }
    if name.len() > 39 {
        return Err("Username must be at most 39 characters");
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err("Username must contain only alphanumeric characters and hyphens");
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err("Username cannot start or end with a hyphen");
    }
    Ok(())
}

/// Validate a declared agent name
pub fn validate_agent_name(agent: &str) -> Result<(), &'static str> {
    if agent.is_empty() {
        return Err("Agent name cannot be empty");
    }
    if agent.chars().count() > 64 {
        return Err("Agent name must be at most 64 characters");
    }
    if agent.chars().any(char::is_control) {
        return Err("Agent name cannot contain control characters");
    }
    Ok(())
}

/// Validate a public key submitted for registration
pub fn validate_public_jwk(jwk: &PublicJwk) -> Result<(), String> {
    if let Some(ref use_) = jwk.use_ {
        if use_ != "sig" {
            return Err(format!("Unsupported key use '{}'", use_));
        }
    }
    verifying_key_from_jwk(jwk)
        .map(|_| ())
        .map_err(|e| e.to_string())
}
