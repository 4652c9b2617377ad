//! Identity management
//!
//! An identity is an Ed25519 key bound to a GitHub account. It is created
//! once by [`IdentityManager::init`], persisted in an [`IdentityStore`] and
//! loaded for every signing operation. A store holds exactly one identity;
//! re-initializing replaces it and the old key can no longer sign.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};

use crate::auth::validate_username;
use crate::crypto::{
    compute_fingerprint, generate_signing_key, private_jwk, public_jwk, signing_key_from_jwk,
};
use crate::directory::KeyRegistry;
use crate::error::{CredError, CredResult};
use crate::github::IdentityProvider;
use crate::types::{IdentitySummary, PrivateJwk, PublicJwk, Username};

const KEY_EXTENSION: &str = "jwk";

/// A loaded signing identity
#[derive(Clone)]
pub struct Identity {
    username: Username,
    signing_key: SigningKey,
    public_key: PublicJwk,
    fingerprint: String,
    registered_at: Option<DateTime<Utc>>,
}

impl Identity {
    /// Create a new identity with a fresh key
    pub fn generate(username: &str) -> CredResult<Self> {
        validate_username(username).map_err(|e| CredError::InvalidInput(e.into()))?;
        Ok(Self::from_signing_key(username, generate_signing_key()))
    }

    /// Rebuild an identity from its stored private key
    pub fn from_private_jwk(username: &str, jwk: &PrivateJwk) -> CredResult<Self> {
        validate_username(username).map_err(|e| CredError::InvalidInput(e.into()))?;
        let key = signing_key_from_jwk(jwk)
            .map_err(|e| CredError::storage(format!("stored key for @{} is invalid: {}", username, e)))?;
        Ok(Self::from_signing_key(username, key))
    }

    fn from_signing_key(username: &str, signing_key: SigningKey) -> Self {
        let public_key = public_jwk(&signing_key.verifying_key());
        let fingerprint = compute_fingerprint(&public_key);
        Self {
            username: username.to_string(),
            signing_key,
            public_key,
            fingerprint,
            registered_at: None,
        }
    }

    pub fn with_registered_at(mut self, at: DateTime<Utc>) -> Self {
        self.registered_at = Some(at);
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn public_jwk(&self) -> &PublicJwk {
        &self.public_key
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn private_jwk(&self) -> PrivateJwk {
        private_jwk(&self.signing_key)
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn summary(&self) -> IdentitySummary {
        IdentitySummary {
            username: self.username.clone(),
            fingerprint: self.fingerprint.clone(),
            registered_at: self.registered_at,
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("username", &self.username)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

// ============ Identity Stores ============

/// Persistence for the single local identity
pub trait IdentityStore: Send + Sync {
    /// Persist `key` for `username`, replacing any previous identity
    fn save(&self, username: &str, key: &PrivateJwk) -> CredResult<()>;

    /// Load the stored identity, if any
    fn load(&self) -> CredResult<Option<(Username, PrivateJwk)>>;

    /// Remove the stored identity
    fn clear(&self) -> CredResult<()>;
}

/// Stores the identity as `<dir>/<username>.jwk`
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the key file for `username`
    pub fn key_path(&self, username: &str) -> CredResult<PathBuf> {
        validate_username(username).map_err(|e| CredError::InvalidInput(e.into()))?;
        Ok(self.dir.join(format!("{}.{}", username, KEY_EXTENSION)))
    }

    /// Usernames with a key file, sorted
    fn stored_usernames(&self) -> CredResult<Vec<Username>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CredError::storage(format!(
                    "cannot read {}: {}",
                    self.dir.display(),
                    e
                )))
            }
        };

        let mut names: Vec<Username> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().map(|e| e == KEY_EXTENSION).unwrap_or(false))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .filter(|name| validate_username(name).is_ok())
            .collect();
        names.sort();
        Ok(names)
    }

    fn ensure_dir(&self) -> CredResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            CredError::storage(format!("cannot create {}: {}", self.dir.display(), e))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))
                .map_err(|e| CredError::storage(e.to_string()))?;
        }
        Ok(())
    }
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

impl IdentityStore for FileKeyStore {
    fn save(&self, username: &str, key: &PrivateJwk) -> CredResult<()> {
        let path = self.key_path(username)?;
        self.ensure_dir()?;

        let json = serde_json::to_string_pretty(key)
            .map_err(|e| CredError::storage(e.to_string()))?;
        let temp_path = path.with_extension("jwk.tmp");
        write_private(&temp_path, json.as_bytes())
            .map_err(|e| CredError::storage(format!("cannot write {}: {}", temp_path.display(), e)))?;
        fs::rename(&temp_path, &path)
            .map_err(|e| CredError::storage(format!("cannot write {}: {}", path.display(), e)))?;

        // One identity per store
        for other in self.stored_usernames()? {
            if other != username {
                let stale = self.dir.join(format!("{}.{}", other, KEY_EXTENSION));
                fs::remove_file(&stale).map_err(|e| {
                    CredError::storage(format!("cannot remove {}: {}", stale.display(), e))
                })?;
                tracing::debug!("Removed previous identity @{}", other);
            }
        }

        tracing::debug!("Saved identity @{} to {}", username, path.display());
        Ok(())
    }

    fn load(&self) -> CredResult<Option<(Username, PrivateJwk)>> {
        let names = self.stored_usernames()?;
        let Some(username) = names.first() else {
            return Ok(None);
        };
        if names.len() > 1 {
            tracing::warn!(
                "{} identities found in {}, using @{}",
                names.len(),
                self.dir.display(),
                username
            );
        }

        let path = self.key_path(username)?;
        let json = fs::read_to_string(&path)
            .map_err(|e| CredError::storage(format!("cannot read {}: {}", path.display(), e)))?;
        let key: PrivateJwk = serde_json::from_str(&json)
            .map_err(|e| CredError::storage(format!("corrupt key file {}: {}", path.display(), e)))?;
        Ok(Some((username.clone(), key)))
    }

    fn clear(&self) -> CredResult<()> {
        for username in self.stored_usernames()? {
            let path = self.key_path(&username)?;
            fs::remove_file(&path).map_err(|e| {
                CredError::storage(format!("cannot remove {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }
}

/// In-memory store for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    slot: RwLock<Option<(Username, PrivateJwk)>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryKeyStore {
    fn save(&self, username: &str, key: &PrivateJwk) -> CredResult<()> {
        validate_username(username).map_err(|e| CredError::InvalidInput(e.into()))?;
        let mut slot = self
            .slot
            .write()
            .map_err(|_| CredError::storage("identity store lock poisoned"))?;
        *slot = Some((username.to_string(), key.clone()));
        Ok(())
    }

    fn load(&self) -> CredResult<Option<(Username, PrivateJwk)>> {
        let slot = self
            .slot
            .read()
            .map_err(|_| CredError::storage("identity store lock poisoned"))?;
        Ok(slot.clone())
    }

    fn clear(&self) -> CredResult<()> {
        let mut slot = self
            .slot
            .write()
            .map_err(|_| CredError::storage("identity store lock poisoned"))?;
        *slot = None;
        Ok(())
    }
}

// ============ Identity Manager ============

/// What `init` does when an identity already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitPolicy {
    /// Overwrite it (last writer wins)
    #[default]
    Replace,
    /// Refuse with [`CredError::IdentityExists`]
    KeepExisting,
}

/// Creates, persists and loads the local identity
pub struct IdentityManager<S, P, R> {
    store: S,
    provider: P,
    registry: R,
}

impl<S, P, R> IdentityManager<S, P, R>
where
    S: IdentityStore,
    P: IdentityProvider,
    R: KeyRegistry,
{
    pub fn new(store: S, provider: P, registry: R) -> Self {
        Self {
            store,
            provider,
            registry,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Authenticate `token`, create a key, persist it and register it.
    ///
    /// The key is stored before the directory learns about it. If
    /// registration fails the previous identity is put back.
    pub async fn init(&self, token: &str, policy: InitPolicy) -> CredResult<Identity> {
        let token = token.trim();
        if token.is_empty() {
            return Err(CredError::Authentication("token is empty".into()));
        }

        let previous = match self.store.load() {
            Ok(previous) => previous,
            Err(e) if policy == InitPolicy::Replace => {
                tracing::warn!("Ignoring unreadable identity store: {}", e);
                None
            }
            Err(e) => return Err(e),
        };
        if policy == InitPolicy::KeepExisting {
            if let Some((username, _)) = &previous {
                return Err(CredError::IdentityExists(username.clone()));
            }
        }

        let profile = self.provider.authenticate(token).await?;
        let identity = Identity::generate(&profile.login)?;
        self.store.save(identity.username(), &identity.private_jwk())?;

        let registration = match self
            .registry
            .register(token, &profile, identity.public_jwk())
            .await
        {
            Ok(registration) => registration,
            Err(e) => {
                self.restore(previous.as_ref());
                return Err(e);
            }
        };

        if let Some((old_username, old_key)) = previous {
            tracing::warn!(
                "Replaced identity @{} (fingerprint {}) with @{} (fingerprint {})",
                old_username,
                compute_fingerprint(&old_key.to_public()),
                identity.username(),
                identity.fingerprint()
            );
        }
        tracing::info!(
            "Identity created for @{} ({})",
            identity.username(),
            identity.fingerprint()
        );

        Ok(identity.with_registered_at(registration.registered_at))
    }

    /// Put the store back to `previous` after a failed registration
    fn restore(&self, previous: Option<&(Username, PrivateJwk)>) {
        let restored = match previous {
            Some((username, key)) => self.store.save(username, key),
            None => self.store.clear(),
        };
        if let Err(e) = restored {
            tracing::error!("Could not restore previous identity: {}", e);
        }
    }

    /// Load the current identity
    pub fn load(&self) -> CredResult<Identity> {
        let (username, key) = self.store.load()?.ok_or(CredError::NoIdentity)?;
        Identity::from_private_jwk(&username, &key)
    }

    /// Username and fingerprint of the current identity
    pub fn whoami(&self) -> CredResult<IdentitySummary> {
        Ok(self.load()?.summary())
    }
}
