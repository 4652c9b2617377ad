//! Application state for the key directory service

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::interval;

use crate::auth::{validate_public_jwk, validate_username, RateLimiter};
use crate::config::Config;
use crate::directory::TrustAnchor;
use crate::error::{ApiError, ApiResult, CredResult};
use crate::github::IdentityProvider;
use crate::types::{DirectoryEntry, HealthResponse, RegisterKeyRequest, Registration};

/// Global application state
pub struct AppState {
    /// Registered keys indexed by lowercase GitHub login
    pub keys: DashMap<String, DirectoryEntry>,
    /// Validates bearer tokens on registration
    pub provider: Arc<dyn IdentityProvider>,
    pub limiter: RateLimiter,
    pub config: Config,
    /// Start time for uptime calculation
    pub start_time: Instant,
    /// Persistence dirty flag
    dirty: AtomicBool,
    /// Notify for immediate save
    persist_notify: Notify,
    shutdown: AtomicBool,
    pub last_persist: std::sync::RwLock<Option<DateTime<Utc>>>,
}

impl AppState {
    pub fn new(config: Config, provider: Arc<dyn IdentityProvider>) -> Arc<Self> {
        Arc::new(Self {
            keys: DashMap::new(),
            provider,
            limiter: RateLimiter::new(config.rate_limit_requests, config.rate_limit_window),
            config,
            start_time: Instant::now(),
            dirty: AtomicBool::new(false),
            persist_notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            last_persist: std::sync::RwLock::new(None),
        })
    }

    /// Load state from disk
    pub async fn load_from_disk(self: &Arc<Self>) -> anyhow::Result<()> {
        let path = self.config.state_file_path();

        if path.exists() {
            let json = tokio::fs::read_to_string(&path).await?;
            let snapshot: StateSnapshot = serde_json::from_str(&json)?;

            for entry in snapshot.keys {
                if validate_username(&entry.github).is_err() {
                    tracing::warn!("Skipping stored key with invalid username {:?}", entry.github);
                    continue;
                }
                self.keys.insert(entry.github.to_lowercase(), entry);
            }

            tracing::info!(
                "Loaded state: {} keys (saved {})",
                self.keys.len(),
                snapshot.saved_at
            );
        } else {
            tracing::info!("No existing state file, starting fresh");
        }

        Ok(())
    }

    /// Start background persistence worker
    pub fn spawn_persister(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        let persist_interval = state.config.persist_interval;

        tokio::spawn(async move {
            let mut ticker = interval(persist_interval);

            loop {
                if state.shutdown.load(Ordering::SeqCst) {
                    tracing::info!("Persister shutting down, final save...");
                    if let Err(e) = state.save_all().await {
                        tracing::error!("Failed final persist: {}", e);
                    }
                    break;
                }

                tokio::select! {
                    _ = ticker.tick() => {
                        if state.dirty.swap(false, Ordering::SeqCst) {
                            if let Err(e) = state.save_all().await {
                                tracing::error!("Failed to persist state: {}", e);
                            }
                        }
                    }
                    _ = state.persist_notify.notified() => {
                        state.dirty.store(false, Ordering::SeqCst);
                        if let Err(e) = state.save_all().await {
                            tracing::error!("Failed to persist state: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Signal shutdown
    pub fn signal_shutdown(&self) {
        tracing::info!("Shutdown signaled");
        self.shutdown.store(true, Ordering::SeqCst);
        self.persist_notify.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Write all keys to the state file (temp file, then rename)
    pub async fn save_all(&self) -> anyhow::Result<()> {
        let mut keys: Vec<DirectoryEntry> = self.keys.iter().map(|r| r.value().clone()).collect();
        keys.sort_by(|a, b| a.github.to_lowercase().cmp(&b.github.to_lowercase()));

        let snapshot = StateSnapshot {
            keys,
            saved_at: Utc::now(),
        };

        let json = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::create_dir_all(&self.config.data_dir).await?;

        let path = self.config.state_file_path();
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &json).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        if let Ok(mut last) = self.last_persist.write() {
            *last = Some(snapshot.saved_at);
        }
        tracing::info!("State persisted: {} keys", snapshot.keys.len());
        Ok(())
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    // ============ Key Operations ============

    /// Register (or rotate) the key of the account behind `token`
    pub async fn register_key(
        &self,
        token: &str,
        req: RegisterKeyRequest,
    ) -> ApiResult<Registration> {
        validate_public_jwk(&req.public_key).map_err(|e| {
            ApiError::bad_request_with_hint(e, "public_key must be an Ed25519 JWK (kty OKP)")
        })?;

        let profile = self.provider.authenticate(token).await?;
        validate_username(&profile.login)
            .map_err(|e| ApiError::BadRequest(format!("GitHub login rejected: {}", e)))?;

        let entry = DirectoryEntry {
            github: profile.login.clone(),
            github_id: Some(profile.id),
            public_key: req.public_key,
            registered_at: Utc::now(),
        };
        let previous = self.keys.insert(profile.login.to_lowercase(), entry.clone());

        self.mark_dirty();
        if previous.is_some() {
            tracing::info!("Rotated key for @{}", entry.github);
        } else {
            tracing::info!("Registered key for @{}", entry.github);
        }

        Ok(Registration {
            github: entry.github,
            public_key: entry.public_key,
            registered_at: entry.registered_at,
        })
    }

    /// Current key for `username`
    pub fn lookup(&self, username: &str) -> ApiResult<DirectoryEntry> {
        validate_username(username).map_err(|e| {
            ApiError::bad_request_with_hint(e, "GitHub usernames are 1-39 alphanumeric or '-' chars")
        })?;
        self.keys
            .get(&username.to_lowercase())
            .map(|r| r.value().clone())
            .ok_or_else(|| ApiError::NotFound("No key registered for user".into()))
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "ok".into(),
            version: self.config.version.clone(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            keys_count: self.keys.len(),
        }
    }
}

#[async_trait]
impl TrustAnchor for AppState {
    async fn resolve(&self, username: &str) -> CredResult<Option<DirectoryEntry>> {
        Ok(self
            .keys
            .get(&username.to_lowercase())
            .map(|r| r.value().clone()))
    }
}

#[derive(Serialize, Deserialize)]
struct StateSnapshot {
    keys: Vec<DirectoryEntry>,
    saved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_signing_key, public_jwk};
    use crate::error::CredError;
    use crate::types::GithubProfile;
    use tempfile::tempdir;

    struct TokenIsLogin;

    #[async_trait]
    impl IdentityProvider for TokenIsLogin {
        async fn authenticate(&self, token: &str) -> CredResult<GithubProfile> {
            match token.strip_prefix("gho_") {
                Some(login) => Ok(GithubProfile {
                    login: login.into(),
                    id: login.len() as u64,
                    avatar_url: String::new(),
                }),
                None => Err(CredError::Authentication("Bad credentials".into())),
            }
        }
    }

    fn new_state(data_dir: &std::path::Path) -> Arc<AppState> {
        let config = Config {
            data_dir: data_dir.to_path_buf(),
            ..Config::default()
        };
        AppState::new(config, Arc::new(TokenIsLogin))
    }

    fn request() -> RegisterKeyRequest {
        RegisterKeyRequest {
            public_key: public_jwk(&generate_signing_key().verifying_key()),
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let dir = tempdir().unwrap();
        let state = new_state(dir.path());

        let reg = state.register_key("gho_Alice", request()).await.unwrap();
        assert_eq!(reg.github, "Alice");

        let entry = state.lookup("alice").unwrap();
        assert_eq!(entry.public_key, reg.public_key);
        assert_eq!(entry.github_id, Some(5));
        assert!(matches!(state.lookup("bob"), Err(ApiError::NotFound(_))));
        assert!(matches!(
            state.lookup("bad/name"),
            Err(ApiError::BadRequestWithHint(..))
        ));
    }

    #[tokio::test]
    async fn test_register_rejects_bad_token() {
        let dir = tempdir().unwrap();
        let state = new_state(dir.path());
        assert!(matches!(
            state.register_key("nope", request()).await,
            Err(ApiError::Unauthorized(_))
        ));
        assert!(state.keys.is_empty());
    }

    #[tokio::test]
    async fn test_rotation_replaces_key() {
        let dir = tempdir().unwrap();
        let state = new_state(dir.path());
        state.register_key("gho_alice", request()).await.unwrap();
        let second = state.register_key("gho_alice", request()).await.unwrap();

        assert_eq!(state.keys.len(), 1);
        assert_eq!(state.lookup("alice").unwrap().public_key, second.public_key);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempdir().unwrap();
        let state = new_state(dir.path());
        let reg = state.register_key("gho_alice", request()).await.unwrap();
        state.save_all().await.unwrap();
        assert!(state.last_persist.read().unwrap().is_some());

        let restored = new_state(dir.path());
        restored.load_from_disk().await.unwrap();
        assert_eq!(restored.lookup("alice").unwrap().public_key, reg.public_key);
        assert!(restored.resolve("ALICE").await.unwrap().is_some());
    }
}
