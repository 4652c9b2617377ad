//! GitHub as the external identity provider
//!
//! Tokens are validated against `GET /user`. When no token is supplied the
//! OAuth device flow obtains one interactively.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::error::{CredError, CredResult};
use crate::types::GithubProfile;

const USER_AGENT: &str = concat!("agentcred/", env!("CARGO_PKG_VERSION"));
const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Resolves an account token to a GitHub profile
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, token: &str) -> CredResult<GithubProfile>;
}

#[async_trait]
impl<T: IdentityProvider + ?Sized> IdentityProvider for std::sync::Arc<T> {
    async fn authenticate(&self, token: &str) -> CredResult<GithubProfile> {
        (**self).authenticate(token).await
    }
}

pub(crate) fn map_reqwest(context: &str, e: reqwest::Error) -> CredError {
    if e.is_timeout() {
        CredError::Timeout(format!("{}: {}", context, e))
    } else {
        CredError::directory(format!("{}: {}", context, e))
    }
}

/// Classify a non-success `GET /user` status
///
/// Only 401 and 403 mean the token is bad. Outages and throttling are
/// directory errors.
fn status_error(status: StatusCode) -> Option<CredError> {
    match status {
        s if s.is_success() => None,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Some(CredError::Authentication(
            "invalid or expired GitHub token".into(),
        )),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            Some(CredError::directory(format!("GitHub unavailable: {}", s)))
        }
        s => Some(CredError::Authentication(format!("GitHub returned {}", s))),
    }
}

/// GitHub REST client
#[derive(Debug, Clone)]
pub struct GitHubClient {
    client: Client,
    api_url: String,
}

impl GitHubClient {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> CredResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| CredError::directory(e.to_string()))?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl IdentityProvider for GitHubClient {
    async fn authenticate(&self, token: &str) -> CredResult<GithubProfile> {
        let resp = self
            .client
            .get(format!("{}/user", self.api_url))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| map_reqwest("GitHub", e))?;

        if let Some(e) = status_error(resp.status()) {
            return Err(e);
        }

        let profile: GithubProfile = resp
            .json()
            .await
            .map_err(|e| CredError::Authentication(format!("unexpected GitHub response: {}", e)))?;
        tracing::debug!("Authenticated GitHub user @{} ({})", profile.login, profile.id);
        Ok(profile)
    }
}

// ============ OAuth Device Flow ============

/// Response to a device code request
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    pub interval: u64,
}

#[derive(Debug, Deserialize)]
struct TokenPoll {
    access_token: Option<String>,
    error: Option<String>,
}

/// What a single poll of the token endpoint yielded
#[derive(Debug, PartialEq, Eq)]
enum PollOutcome {
    Token(String),
    Pending,
    SlowDown,
}

fn interpret_poll(poll: TokenPoll) -> CredResult<PollOutcome> {
    match (poll.access_token, poll.error.as_deref()) {
        (_, Some("authorization_pending")) => Ok(PollOutcome::Pending),
        (_, Some("slow_down")) => Ok(PollOutcome::SlowDown),
        (_, Some("expired_token")) => Err(CredError::Authentication("Device code expired".into())),
        (_, Some("access_denied")) => {
            Err(CredError::Authentication("User denied authorization".into()))
        }
        (_, Some(other)) => Err(CredError::Authentication(format!("OAuth error: {}", other))),
        (Some(token), None) => Ok(PollOutcome::Token(token)),
        (None, None) => Err(CredError::Authentication(
            "OAuth response carried no token".into(),
        )),
    }
}

/// GitHub OAuth device authorization flow
#[derive(Debug, Clone)]
pub struct DeviceFlow {
    client: Client,
    login_url: String,
    client_id: String,
}

impl DeviceFlow {
    pub fn new(login_url: impl Into<String>, client_id: impl Into<String>) -> CredResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| CredError::directory(e.to_string()))?;
        Ok(Self {
            client,
            login_url: login_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
        })
    }

    /// Ask GitHub for a user code
    pub async fn request_code(&self) -> CredResult<DeviceCode> {
        let resp = self
            .client
            .post(format!("{}/login/device/code", self.login_url))
            .header("Accept", "application/json")
            .form(&[("client_id", self.client_id.as_str())])
            .send()
            .await
            .map_err(|e| map_reqwest("device code request", e))?;
        if !resp.status().is_success() {
            return Err(CredError::Authentication(format!(
                "Failed to request device code ({})",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| CredError::Authentication(format!("invalid device code response: {}", e)))
    }

    /// Poll until the user approves, denies or the code expires
    pub async fn poll_token(&self, code: &DeviceCode) -> CredResult<String> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(code.expires_in);
        let mut interval = Duration::from_secs(code.interval.max(1));

        loop {
            if tokio::time::Instant::now() + interval >= deadline {
                return Err(CredError::Authentication("Device code expired".into()));
            }
            tokio::time::sleep(interval).await;

            let resp = self
                .client
                .post(format!("{}/login/oauth/access_token", self.login_url))
                .header("Accept", "application/json")
                .form(&[
                    ("client_id", self.client_id.as_str()),
                    ("device_code", code.device_code.as_str()),
                    ("grant_type", DEVICE_GRANT_TYPE),
                ])
                .send()
                .await
                .map_err(|e| map_reqwest("token poll", e))?;
            if !resp.status().is_success() {
                return Err(CredError::Authentication(format!(
                    "Failed to poll for access token ({})",
                    resp.status()
                )));
            }
            let poll: TokenPoll = resp
                .json()
                .await
                .map_err(|e| CredError::Authentication(e.to_string()))?;

            match interpret_poll(poll)? {
                PollOutcome::Token(token) => return Ok(token),
                PollOutcome::Pending => continue,
                PollOutcome::SlowDown => {
                    interval += Duration::from_secs(5);
                    tracing::debug!("GitHub asked to slow down, polling every {:?}", interval);
                }
            }
        }
    }
}
