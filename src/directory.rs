//! Public key directory: the trust anchor
//!
//! The verifier only trusts keys resolved here, never key material carried
//! inside an envelope. Network resolution is bounded by a per-attempt
//! timeout and a fixed number of attempts; a timeout is reported as an
//! error so callers fail closed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use reqwest::{Client, StatusCode};

use crate::auth::validate_username;
use crate::error::{CredError, CredResult};
use crate::github::map_reqwest;
use crate::types::{
    DirectoryEntry, ErrorBody, GithubProfile, PublicJwk, RegisterKeyRequest, Registration,
};

/// Maps an account to its currently valid public key
#[async_trait]
pub trait TrustAnchor: Send + Sync {
    /// `Ok(None)` when the account has no registered key
    async fn resolve(&self, username: &str) -> CredResult<Option<DirectoryEntry>>;
}

/// Accepts new public keys for authenticated accounts
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    async fn register(
        &self,
        token: &str,
        profile: &GithubProfile,
        key: &PublicJwk,
    ) -> CredResult<Registration>;
}

#[async_trait]
impl<T: TrustAnchor + ?Sized> TrustAnchor for Arc<T> {
    async fn resolve(&self, username: &str) -> CredResult<Option<DirectoryEntry>> {
        (**self).resolve(username).await
    }
}

#[async_trait]
impl<T: KeyRegistry + ?Sized> KeyRegistry for Arc<T> {
    async fn register(
        &self,
        token: &str,
        profile: &GithubProfile,
        key: &PublicJwk,
    ) -> CredResult<Registration> {
        (**self).register(token, profile, key).await
    }
}

// ============ HTTP Directory ============

/// Client for the key directory HTTP API
#[derive(Debug, Clone)]
pub struct HttpKeyDirectory {
    client: Client,
    base_url: String,
    attempts: u32,
    backoff: Duration,
}

impl HttpKeyDirectory {
    pub fn new(base_url: impl Into<String>, timeout: Duration, attempts: u32) -> CredResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CredError::directory(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            attempts: attempts.max(1),
            backoff: Duration::from_millis(200),
        })
    }

    /// Override the initial retry delay (doubles per attempt)
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    async fn resolve_once(&self, username: &str) -> Result<Option<DirectoryEntry>, Attempt> {
        let resp = self
            .client
            .get(format!("{}/v1/keys/{}", self.base_url, username))
            .send()
            .await
            .map_err(|e| Attempt::Retry(map_reqwest("key directory", e)))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(Attempt::Retry(CredError::directory(format!(
                "key directory returned {}",
                status
            ))));
        }
        if !status.is_success() {
            return Err(Attempt::Final(CredError::directory(format!(
                "key directory returned {}",
                status
            ))));
        }

        resp.json::<DirectoryEntry>()
            .await
            .map(Some)
            .map_err(|e| Attempt::Retry(map_reqwest("key directory response", e)))
    }
}

enum Attempt {
    Retry(CredError),
    Final(CredError),
}

#[async_trait]
impl TrustAnchor for HttpKeyDirectory {
    async fn resolve(&self, username: &str) -> CredResult<Option<DirectoryEntry>> {
        if validate_username(username).is_err() {
            return Ok(None);
        }

        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match self.resolve_once(username).await {
                Ok(entry) => return Ok(entry),
                Err(Attempt::Final(e)) => return Err(e),
                Err(Attempt::Retry(e)) if attempt >= self.attempts => return Err(e),
                Err(Attempt::Retry(e)) => {
                    tracing::warn!(
                        "Key lookup for @{} failed (attempt {}/{}): {}",
                        username,
                        attempt,
                        self.attempts,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl KeyRegistry for HttpKeyDirectory {
    async fn register(
        &self,
        token: &str,
        _profile: &GithubProfile,
        key: &PublicJwk,
    ) -> CredResult<Registration> {
        let resp = self
            .client
            .post(format!("{}/v1/keys", self.base_url))
            .bearer_auth(token)
            .json(&RegisterKeyRequest {
                public_key: key.clone(),
            })
            .send()
            .await
            .map_err(|e| map_reqwest("key registration", e))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .json::<ErrorBody>()
                .await
                .map(|b| b.error)
                .unwrap_or_else(|_| status.to_string());
            return Err(if status == StatusCode::UNAUTHORIZED {
                CredError::Authentication(message)
            } else {
                CredError::directory(format!("Key registration failed: {}", message))
            });
        }

        resp.json()
            .await
            .map_err(|e| CredError::directory(format!("invalid registration response: {}", e)))
    }
}

// ============ Local Anchors ============

/// In-memory directory for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    keys: DashMap<String, DirectoryEntry>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: DirectoryEntry) {
        self.keys.insert(entry.github.to_lowercase(), entry);
    }

    pub fn remove(&self, username: &str) -> Option<DirectoryEntry> {
        self.keys.remove(&username.to_lowercase()).map(|(_, e)| e)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl TrustAnchor for MemoryDirectory {
    async fn resolve(&self, username: &str) -> CredResult<Option<DirectoryEntry>> {
        Ok(self.keys.get(&username.to_lowercase()).map(|r| r.value().clone()))
    }
}

#[async_trait]
impl KeyRegistry for MemoryDirectory {
    async fn register(
        &self,
        _token: &str,
        profile: &GithubProfile,
        key: &PublicJwk,
    ) -> CredResult<Registration> {
        let entry = DirectoryEntry {
            github: profile.login.clone(),
            github_id: Some(profile.id),
            public_key: key.clone(),
            registered_at: Utc::now(),
        };
        self.insert(entry.clone());
        Ok(Registration {
            github: entry.github,
            public_key: entry.public_key,
            registered_at: entry.registered_at,
        })
    }
}

/// A single locally supplied key, used for offline verification
///
/// Every account resolves to the pinned key, so only envelopes signed by
/// that key verify.
#[derive(Debug, Clone)]
pub struct PinnedKey {
    key: PublicJwk,
}

impl PinnedKey {
    pub fn new(key: PublicJwk) -> Self {
        Self { key }
    }

    /// Parse a JWK document; private members are discarded
    pub fn from_jwk_json(json: &str) -> CredResult<Self> {
        let key: PublicJwk = serde_json::from_str(json)
            .map_err(|e| CredError::InvalidInput(format!("invalid key file: {}", e)))?;
        crate::crypto::verifying_key_from_jwk(&key)
            .map_err(|e| CredError::InvalidInput(format!("invalid key file: {}", e)))?;
        Ok(Self::new(key))
    }
}

#[async_trait]
impl TrustAnchor for PinnedKey {
    async fn resolve(&self, username: &str) -> CredResult<Option<DirectoryEntry>> {
        Ok(Some(DirectoryEntry {
            github: username.to_string(),
            github_id: None,
            public_key: self.key.clone(),
            registered_at: Utc::now(),
        }))
    }
}
