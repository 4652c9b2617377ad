//! Integration tests for the key directory service

mod common;

use common::{spawn_test_server, spawn_test_server_with, TestClient};
use reqwest::StatusCode;
use serde_json::{json, Value};

use agentcred::identity::Identity;
use agentcred::signer::{sign, SignOptions};
use agentcred::types::{DirectoryEntry, Registration, VerificationResult};
use agentcred::FailureReason;

async fn register(base_url: &str, token: &str, identity: &Identity) -> reqwest::Response {
    TestClient::new(base_url.to_string())
        .with_token(token)
        .post("/v1/keys", &json!({ "public_key": identity.public_jwk() }))
        .await
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = spawn_test_server().await;

    let resp = TestClient::new(server.base_url.clone()).get("/v1/health").await;
    assert!(resp.status().is_success());

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["keys_count"], 0);
}

#[tokio::test]
async fn test_index_describes_endpoints() {
    let server = spawn_test_server().await;

    let body: Value = TestClient::new(server.base_url.clone())
        .get("/")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["name"], "AgentCred API");
    assert_eq!(body["endpoints"]["verify"], "POST /v1/verify");
}

#[tokio::test]
async fn test_register_and_lookup_key() {
    let server = spawn_test_server().await;
    let identity = Identity::generate("alice").unwrap();

    let resp = register(&server.base_url, "gho_alice", &identity).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let registration: Registration = resp.json().await.unwrap();
    assert_eq!(registration.github, "alice");
    assert_eq!(&registration.public_key, identity.public_jwk());

    let client = TestClient::new(server.base_url.clone());
    let resp = client.get("/v1/keys/alice").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let entry: DirectoryEntry = resp.json().await.unwrap();
    assert_eq!(entry.github, "alice");
    assert_eq!(entry.github_id, Some(1001));
    assert_eq!(&entry.public_key, identity.public_jwk());

    // GitHub logins are case-insensitive
    assert_eq!(client.get("/v1/keys/ALICE").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_register_requires_valid_token() {
    let server = spawn_test_server().await;
    let identity = Identity::generate("alice").unwrap();

    let resp = TestClient::new(server.base_url.clone())
        .post("/v1/keys", &json!({ "public_key": identity.public_jwk() }))
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = register(&server.base_url, "gho_mallory", &identity).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Invalid GitHub token");

    assert!(server.state.keys.is_empty());
}

#[tokio::test]
async fn test_register_rejects_bad_key() {
    let server = spawn_test_server().await;
    let client = TestClient::new(server.base_url.clone()).with_token("gho_alice");

    let resp = client
        .post(
            "/v1/keys",
            &json!({ "public_key": { "kty": "RSA", "crv": "Ed25519", "x": "AAAA" } }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = client.post("/v1/keys", &json!({ "nope": true })).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Invalid request body");
}

#[tokio::test]
async fn test_lookup_errors() {
    let server = spawn_test_server().await;
    let client = TestClient::new(server.base_url.clone());

    assert_eq!(client.get("/v1/keys/nobody").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(client.get("/v1/keys/-bad-").await.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        client.get(&format!("/v1/keys/{}", "a".repeat(40))).await.status(),
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn test_verify_endpoint() {
    let server = spawn_test_server().await;
    let identity = Identity::generate("alice").unwrap();
    register(&server.base_url, "gho_alice", &identity).await;

    let envelope = sign("Hello, world!", &identity, &SignOptions::agent("bot")).unwrap();
    let client = TestClient::new(server.base_url.clone());

    // Bare envelope
    let resp = client.post("/v1/verify", &envelope).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let result: VerificationResult = resp.json().await.unwrap();
    assert!(result.verified);
    let github = result.github.unwrap();
    assert_eq!(github.username, "alice");
    assert_eq!(github.id, Some(1001));
    assert_eq!(result.agent.as_deref(), Some("bot"));
    assert!(result.signed_at.is_some());

    // Wrapped envelope
    let resp = client.post("/v1/verify", &json!({ "envelope": envelope })).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["verified"], true);
    assert!(body.get("signedAt").is_some());
}

#[tokio::test]
async fn test_verify_endpoint_failures() {
    let server = spawn_test_server().await;
    let alice = Identity::generate("alice").unwrap();
    register(&server.base_url, "gho_alice", &alice).await;
    let client = TestClient::new(server.base_url.clone());

    let mut tampered = sign("Hello", &alice, &SignOptions::default()).unwrap();
    tampered.content = "Hello!".into();
    let resp = client.post("/v1/verify", &tampered).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let result: VerificationResult = resp.json().await.unwrap();
    assert_eq!(result.reason, Some(FailureReason::TamperedContent));

    let carol = Identity::generate("carol").unwrap();
    let unknown = sign("Hello", &carol, &SignOptions::default()).unwrap();
    let resp = client.post("/v1/verify", &unknown).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let result: VerificationResult = resp.json().await.unwrap();
    assert_eq!(result.reason, Some(FailureReason::UnknownIdentity));

    let resp = client.post("/v1/verify", &json!({ "content": "x" })).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let result: VerificationResult = resp.json().await.unwrap();
    assert!(!result.verified);
    assert_eq!(result.reason, Some(FailureReason::MalformedEnvelope));

    let resp = client
        .client
        .post(format!("{}/v1/verify", server.base_url))
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_key_rotation_invalidates_old_signatures() {
    let server = spawn_test_server().await;
    let client = TestClient::new(server.base_url.clone());

    let old = Identity::generate("alice").unwrap();
    register(&server.base_url, "gho_alice", &old).await;
    let envelope = sign("before rotation", &old, &SignOptions::default()).unwrap();

    let new = Identity::generate("alice").unwrap();
    register(&server.base_url, "gho_alice", &new).await;

    let result: VerificationResult = client.post("/v1/verify", &envelope).await.json().await.unwrap();
    assert!(!result.verified);
    assert_eq!(result.reason, Some(FailureReason::InvalidSignature));
}

#[tokio::test]
async fn test_rate_limit() {
    let server = spawn_test_server_with(|config| config.rate_limit_requests = 2).await;
    let client = TestClient::new(server.base_url.clone());
    let body = json!({ "content": "x" });

    assert_eq!(client.post("/v1/verify", &body).await.status(), StatusCode::BAD_REQUEST);
    assert_eq!(client.post("/v1/verify", &body).await.status(), StatusCode::BAD_REQUEST);

    let resp = client.post("/v1/verify", &body).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Rate limit exceeded");

    // Lookups have their own budget
    assert_eq!(
        client.get("/v1/keys/alice").await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_registrations_persist() {
    let server = spawn_test_server().await;
    let identity = Identity::generate("alice").unwrap();
    register(&server.base_url, "gho_alice", &identity).await;

    server.state.save_all().await.unwrap();

    let snapshot = std::fs::read_to_string(server.data_dir.path().join("keys.json")).unwrap();
    let snapshot: Value = serde_json::from_str(&snapshot).unwrap();
    assert_eq!(snapshot["keys"][0]["github"], "alice");
    assert_eq!(snapshot["keys"][0]["public_key"]["x"], identity.public_jwk().x);
}
