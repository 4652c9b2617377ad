//! Core types for AgentCred
//!
//! Envelope, JWS claims, JWK key material, directory records and
//! verification results. Field names follow the wire format exactly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope format version
pub const ENVELOPE_VERSION: &str = "1.0";

/// Suffix appended to a GitHub username to form the JWS issuer and key ID
pub const ISSUER_SUFFIX: &str = "@agentcred";

/// JWS `typ` header value
pub const JWS_TYPE: &str = "agentcred+jwt";

/// The only supported JWS algorithm
pub const JWS_ALG: &str = "EdDSA";

/// Agent name used when the caller doesn't supply one
pub const DEFAULT_AGENT: &str = "default";

/// Content type used when the caller doesn't supply one
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// GitHub username (also the directory key)
pub type Username = String;

/// Issuer string for a username (`alice@agentcred`)
pub fn issuer_for(username: &str) -> String {
    format!("{}{}", username, ISSUER_SUFFIX)
}

// ============ Envelope Types ============

/// Signed container binding content to an account and an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub agentcred: Credential,
    pub content: String,
}

/// The `agentcred` block of an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Envelope version
    pub v: String,
    /// Compact JWS over the claims
    pub jws: String,
    /// Signer's GitHub username
    pub github: Username,
    /// Declared agent name
    pub agent: String,
}

/// JWS protected header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedHeader {
    pub alg: String,
    pub typ: String,
    pub kid: String,
}

impl ProtectedHeader {
    pub fn for_user(username: &str) -> Self {
        Self {
            alg: JWS_ALG.into(),
            typ: JWS_TYPE.into(),
            kid: issuer_for(username),
        }
    }
}

/// Claims carried in the JWS payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Envelope version the claims were issued for
    pub v: String,
    /// `<username>@agentcred`
    pub iss: String,
    /// Agent name
    pub sub: String,
    /// Issued-at, unix seconds
    pub iat: i64,
    /// `sha256:<hex>` of the content
    pub content_hash: String,
    pub content_type: String,
}

// ============ Key Types ============

/// Public Ed25519 key as an OKP JWK
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicJwk {
    pub kty: String,
    pub crv: String,
    /// base64url public key bytes
    pub x: String,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
}

/// Private Ed25519 key as an OKP JWK (the stored identity file)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    /// base64url secret key bytes
    pub d: String,
}

impl PrivateJwk {
    /// Drop the secret half
    pub fn to_public(&self) -> PublicJwk {
        PublicJwk {
            kty: self.kty.clone(),
            crv: self.crv.clone(),
            x: self.x.clone(),
            use_: None,
            alg: None,
        }
    }
}

impl std::fmt::Debug for PrivateJwk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateJwk")
            .field("kty", &self.kty)
            .field("crv", &self.crv)
            .field("x", &self.x)
            .field("d", &"<redacted>")
            .finish()
    }
}

// ============ Identity Types ============

/// GitHub account resolved from a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubProfile {
    pub login: Username,
    pub id: u64,
    #[serde(default)]
    pub avatar_url: String,
}

/// What `init` and `whoami` report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySummary {
    pub username: Username,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
}

// ============ Directory Types ============

/// A key as published by the key directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub github: Username,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_id: Option<u64>,
    pub public_key: PublicJwk,
    pub registered_at: DateTime<Utc>,
}

/// Key registration request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterKeyRequest {
    pub public_key: PublicJwk,
}

/// Key registration response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub github: Username,
    pub public_key: PublicJwk,
    pub registered_at: DateTime<Utc>,
}

// ============ Verification Types ============

/// Why a verification failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Required fields missing or unparseable
    MalformedEnvelope,
    /// Content no longer matches the signed digest
    TamperedContent,
    /// The account has no registered key
    UnknownIdentity,
    /// Signature does not verify against the account's key
    InvalidSignature,
    /// Signed claims disagree with the envelope
    ClaimMismatch,
    /// Signed too long ago (or in the future)
    Expired,
    /// Trust anchor could not be consulted
    Unavailable,
}

/// Account info attached to a successful verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubInfo {
    pub username: Username,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

/// Outcome of verifying an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<GithubInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

impl VerificationResult {
    pub fn success(github: GithubInfo, agent: String, signed_at: DateTime<Utc>) -> Self {
        Self {
            verified: true,
            github: Some(github),
            agent: Some(agent),
            signed_at: Some(signed_at),
            error: None,
            reason: None,
        }
    }

    pub fn failure(reason: FailureReason, error: impl Into<String>) -> Self {
        Self {
            verified: false,
            github: None,
            agent: None,
            signed_at: None,
            error: Some(error.into()),
            reason: Some(reason),
        }
    }
}

// ============ Service Types ============

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub keys_count: usize,
}

/// Error body returned by the key directory service
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issuer_for() {
        assert_eq!(issuer_for("alice"), "alice@agentcred");
        assert_eq!(ProtectedHeader::for_user("bob").kid, "bob@agentcred");
    }

    #[test]
    fn test_failure_result_serialization() {
        let result = VerificationResult::failure(FailureReason::TamperedContent, "Content hash mismatch");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["verified"], false);
        assert_eq!(json["reason"], "tampered_content");
        assert!(json.get("github").is_none());
    }

    #[test]
    fn test_success_result_uses_camel_case() {
        let result = VerificationResult::success(
            GithubInfo {
                username: "alice".into(),
                id: Some(7),
            },
            "bot".into(),
            Utc::now(),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["verified"], true);
        assert_eq!(json["github"]["username"], "alice");
        assert!(json.get("signedAt").is_some());
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn test_private_jwk_debug_redacts_secret() {
        let jwk = PrivateJwk {
            kty: "OKP".into(),
            crv: "Ed25519".into(),
            x: "pub".into(),
            d: "supersecret".into(),
        };
        let debug = format!("{:?}", jwk);
        assert!(!debug.contains("supersecret"));
        assert_eq!(jwk.to_public().x, "pub");
    }

    #[test]
    fn test_public_jwk_use_field_rename() {
        let jwk: PublicJwk =
            serde_json::from_str(r#"{"kty":"OKP","crv":"Ed25519","x":"abc","use":"sig"}"#).unwrap();
        assert_eq!(jwk.use_.as_deref(), Some("sig"));
        assert!(jwk.alg.is_none());
    }
}
