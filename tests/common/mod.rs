#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tempfile::TempDir;
use tokio::net::TcpListener;

use agentcred::github::IdentityProvider;
use agentcred::types::GithubProfile;
use agentcred::{api, AppState, Config, CredError, CredResult};

/// Test client for API calls
pub struct TestClient {
    pub base_url: String,
    pub client: Client,
    pub token: Option<String>,
}

impl TestClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: Client::new(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        let mut req = self.client.get(format!("{}{}", self.base_url, path));
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }
        req.send().await.expect("Failed to send request")
    }

    pub async fn post<T: serde::Serialize>(&self, path: &str, body: &T) -> reqwest::Response {
        let mut req = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }
        req.send().await.expect("Failed to send request")
    }
}

/// Identity provider backed by a fixed token table
#[derive(Default)]
pub struct StaticProvider {
    users: HashMap<String, GithubProfile>,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, token: &str, login: &str, id: u64) -> Self {
        self.users.insert(
            token.to_string(),
            GithubProfile {
                login: login.to_string(),
                id,
                avatar_url: format!("https://avatars.githubusercontent.com/u/{}", id),
            },
        );
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticProvider {
    async fn authenticate(&self, token: &str) -> CredResult<GithubProfile> {
        self.users
            .get(token)
            .cloned()
            .ok_or_else(|| CredError::Authentication("Bad credentials".into()))
    }
}

/// Default test accounts: alice (id 1001) and bob (id 1002)
pub fn test_provider() -> StaticProvider {
    StaticProvider::new()
        .with_user("gho_alice", "alice", 1001)
        .with_user("gho_bob", "bob", 1002)
}

pub struct TestServer {
    pub base_url: String,
    pub state: Arc<AppState>,
    /// Held so the data directory outlives the server
    pub data_dir: TempDir,
}

/// Start a key directory on a random port
pub async fn spawn_test_server() -> TestServer {
    spawn_test_server_with(|_| {}).await
}

pub async fn spawn_test_server_with(tweak: impl FnOnce(&mut Config)) -> TestServer {
    let data_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = Config {
        data_dir: data_dir.path().to_path_buf(),
        host: "127.0.0.1".into(),
        port: 0,
        ..Config::default()
    };
    tweak(&mut config);

    let state = AppState::new(config, Arc::new(test_provider()));
    let app = api::create_router(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Server failed");
    });

    // Wait for server to be ready
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    TestServer {
        base_url: format!("http://{}", addr),
        state,
        data_dir,
    }
}
