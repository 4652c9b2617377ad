use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default public key directory
pub const DEFAULT_API_URL: &str = "https://api.agentcred.dev";
/// Default GitHub REST endpoint
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
/// Default GitHub OAuth endpoint
pub const DEFAULT_GITHUB_LOGIN_URL: &str = "https://github.com";
/// OAuth app used for the device flow
pub const DEFAULT_CLIENT_ID: &str = "Ov23lilcYBamYnpi7qNb";

#[derive(Debug, Clone)]
pub struct Config {
    pub version: String,
    /// Local state root; keys live under `<home>/keys`
    pub home: PathBuf,
    /// Key directory used to register and resolve keys
    pub api_url: String,
    pub github_api_url: String,
    pub github_login_url: String,
    pub client_id: String,
    /// Per-attempt timeout for trust anchor resolution
    pub resolve_timeout: Duration,
    /// Total attempts for trust anchor resolution
    pub resolve_retries: u32,
    /// Accepted distance between `iat` and now
    pub max_clock_skew: Duration,

    // Key directory service
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub persist_interval: Duration,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".agentcred"))
        .unwrap_or_else(|| PathBuf::from(".agentcred"))
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            home: env::var("AGENTCRED_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_home()),
            api_url: env::var("AGENTCRED_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.into()),
            github_api_url: env::var("GITHUB_API_URL")
                .unwrap_or_else(|_| DEFAULT_GITHUB_API_URL.into()),
            github_login_url: env::var("GITHUB_LOGIN_URL")
                .unwrap_or_else(|_| DEFAULT_GITHUB_LOGIN_URL.into()),
            client_id: env::var("AGENTCRED_CLIENT_ID").unwrap_or_else(|_| DEFAULT_CLIENT_ID.into()),
            resolve_timeout: Duration::from_secs(env_parse("AGENTCRED_RESOLVE_TIMEOUT_SECS", 10)),
            resolve_retries: env_parse("AGENTCRED_RESOLVE_RETRIES", 3),
            max_clock_skew: Duration::from_secs(env_parse(
                "AGENTCRED_MAX_CLOCK_SKEW_SECS",
                24 * 60 * 60,
            )),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("PORT", 8080),
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            persist_interval: Duration::from_secs(env_parse("PERSIST_INTERVAL_SECS", 30)),
            rate_limit_requests: env_parse("RATE_LIMIT_REQUESTS", 60),
            rate_limit_window: Duration::from_secs(env_parse("RATE_LIMIT_WINDOW_SECS", 60)),
        }
    }

    /// Directory holding the local identity
    pub fn key_dir(&self) -> PathBuf {
        self.home.join("keys")
    }

    /// Snapshot file of the key directory service
    pub fn state_file_path(&self) -> PathBuf {
        self.data_dir.join("keys.json")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
