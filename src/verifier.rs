//! Envelope verification
//!
//! Checks run in a fixed order so failures are attributable:
//!
//! ```text
//! shape --> content digest --> resolve account key --> signature --> claims
//! ```
//!
//! The digest is compared before any network access so tampered content is
//! reported as such, independent of the directory. The signature check is
//! never retried; only key resolution is.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::auth::validate_username;
use crate::codec;
use crate::crypto::{content_digest, digests_match, verifying_key_from_jwk};
use crate::directory::TrustAnchor;
use crate::error::{CredError, CredResult};
use crate::jws::CompactJws;
use crate::types::{issuer_for, Envelope, GithubInfo, VerificationResult, ENVELOPE_VERSION};

/// A successfully verified envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub github: GithubInfo,
    pub agent: String,
    pub signed_at: DateTime<Utc>,
    pub content_type: String,
}

impl From<Verified> for VerificationResult {
    fn from(v: Verified) -> Self {
        VerificationResult::success(v.github, v.agent, v.signed_at)
    }
}

pub struct Verifier<A> {
    anchor: A,
    resolve_timeout: Duration,
    max_clock_skew: Duration,
}

impl<A: TrustAnchor> Verifier<A> {
    pub fn new(anchor: A) -> Self {
        Self {
            anchor,
            resolve_timeout: Duration::from_secs(30),
            max_clock_skew: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Overall deadline for key resolution, retries included
    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    pub fn with_max_clock_skew(mut self, skew: Duration) -> Self {
        self.max_clock_skew = skew;
        self
    }

    pub fn anchor(&self) -> &A {
        &self.anchor
    }

    /// Verify an envelope, reporting failures in the result
    pub async fn verify(&self, envelope: &Envelope) -> VerificationResult {
        self.verify_at(envelope, Utc::now()).await
    }

    pub async fn verify_at(&self, envelope: &Envelope, now: DateTime<Utc>) -> VerificationResult {
        match self.check_at(envelope, now).await {
            Ok(verified) => verified.into(),
            Err(e) => failure_result(&e),
        }
    }

    /// Decode JSON text and verify it
    pub async fn verify_json(&self, input: &str) -> VerificationResult {
        match codec::decode(input) {
            Ok(envelope) => self.verify(&envelope).await,
            Err(e) => failure_result(&CredError::from(e)),
        }
    }

    /// Verify an envelope, returning the failure as a typed error
    pub async fn check(&self, envelope: &Envelope) -> CredResult<Verified> {
        self.check_at(envelope, Utc::now()).await
    }

    pub async fn check_at(&self, envelope: &Envelope, now: DateTime<Utc>) -> CredResult<Verified> {
        let cred = &envelope.agentcred;

        // 1. Shape
        if cred.v != ENVELOPE_VERSION {
            return Err(CredError::malformed(format!("unsupported version '{}'", cred.v)));
        }
        validate_username(&cred.github)
            .map_err(|e| CredError::malformed(format!("agentcred.github: {}", e)))?;
        if cred.agent.is_empty() {
            return Err(CredError::malformed("agentcred.agent is empty"));
        }
        let jws = CompactJws::parse(&cred.jws)?;

        // 2. Content digest
        let actual = content_digest(&envelope.content);
        if !digests_match(&actual, &jws.claims.content_hash) {
            tracing::debug!("Content digest mismatch for envelope from @{}", cred.github);
            return Err(CredError::TamperedContent);
        }

        // 3. Account key from the trust anchor
        let entry = tokio::time::timeout(self.resolve_timeout, self.anchor.resolve(&cred.github))
            .await
            .map_err(|_| {
                CredError::Timeout(format!("key lookup for @{} timed out", cred.github))
            })??
            .ok_or_else(|| CredError::UnknownIdentity(cred.github.clone()))?;
        if !entry.github.eq_ignore_ascii_case(&cred.github) {
            return Err(CredError::UnknownIdentity(cred.github.clone()));
        }
        let key = verifying_key_from_jwk(&entry.public_key).map_err(|e| {
            CredError::directory(format!("directory key for @{} is unusable: {}", cred.github, e))
        })?;

        // 4. Signature
        jws.verify(&key)?;

        // 5. Claims binding
        let claims = &jws.claims;
        if claims.iss != issuer_for(&cred.github) {
            return Err(CredError::ClaimMismatch("Issuer mismatch".into()));
        }
        if claims.sub != cred.agent {
            return Err(CredError::ClaimMismatch("Agent mismatch".into()));
        }
        if claims.v != cred.v {
            return Err(CredError::ClaimMismatch("Version mismatch".into()));
        }
        let skew = now.timestamp().abs_diff(claims.iat);
        if skew > self.max_clock_skew.as_secs() {
            return Err(CredError::Expired);
        }
        let signed_at = Utc
            .timestamp_opt(claims.iat, 0)
            .single()
            .ok_or(CredError::Expired)?;

        tracing::debug!("Verified envelope from @{} ({})", entry.github, cred.agent);

        Ok(Verified {
            github: GithubInfo {
                username: entry.github,
                id: entry.github_id,
            },
            agent: cred.agent.clone(),
            signed_at,
            content_type: claims.content_type.clone(),
        })
    }
}

fn failure_result(e: &CredError) -> VerificationResult {
    let reason = e
        .failure_reason()
        .unwrap_or(crate::types::FailureReason::Unavailable);
    tracing::debug!("Verification failed ({:?}): {}", reason, e);
    VerificationResult::failure(reason, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{KeyRegistry, MemoryDirectory, PinnedKey};
    use crate::identity::Identity;
    use crate::signer::{sign, sign_at, SignOptions};
    use crate::types::{FailureReason, GithubProfile};
    use async_trait::async_trait;

    async fn setup() -> (Identity, Verifier<MemoryDirectory>) {
        let identity = Identity::generate("alice").unwrap();
        let directory = MemoryDirectory::new();
        directory
            .register(
                "token",
                &GithubProfile {
                    login: "alice".into(),
                    id: 1,
                    avatar_url: String::new(),
                },
                identity.public_jwk(),
            )
            .await
            .unwrap();
        (identity, Verifier::new(directory))
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (identity, verifier) = setup().await;
        let envelope = sign("hello", &identity, &SignOptions::agent("bot")).unwrap();

        let result = verifier.verify(&envelope).await;
        assert!(result.verified, "{:?}", result);
        assert_eq!(result.github.unwrap().username, "alice");
        assert_eq!(result.agent.as_deref(), Some("bot"));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_tampered_content() {
        let (identity, verifier) = setup().await;
        let mut envelope = sign("hello", &identity, &SignOptions::default()).unwrap();
        envelope.content.push('!');

        let result = verifier.verify(&envelope).await;
        assert!(!result.verified);
        assert_eq!(result.reason, Some(FailureReason::TamperedContent));
    }

    #[tokio::test]
    async fn test_tampered_content_detected_before_lookup() {
        // Even with an empty directory, content tampering is what's reported
        let identity = Identity::generate("alice").unwrap();
        let verifier = Verifier::new(MemoryDirectory::new());
        let mut envelope = sign("hello", &identity, &SignOptions::default()).unwrap();
        envelope.content = "bye".into();
        assert!(matches!(
            verifier.check(&envelope).await,
            Err(CredError::TamperedContent)
        ));
    }

    #[tokio::test]
    async fn test_unknown_identity() {
        let identity = Identity::generate("mallory").unwrap();
        let (_, verifier) = setup().await;
        let envelope = sign("hello", &identity, &SignOptions::default()).unwrap();

        let result = verifier.verify(&envelope).await;
        assert_eq!(result.reason, Some(FailureReason::UnknownIdentity));
    }

    #[tokio::test]
    async fn test_key_in_envelope_is_not_trusted() {
        // Mallory signs as alice with her own key
        let (_, verifier) = setup().await;
        let forger = Identity::generate("alice").unwrap();
        let envelope = sign("hello", &forger, &SignOptions::default()).unwrap();

        let result = verifier.verify(&envelope).await;
        assert!(!result.verified);
        assert_eq!(result.reason, Some(FailureReason::InvalidSignature));
    }

    #[tokio::test]
    async fn test_corrupted_signature() {
        let (identity, verifier) = setup().await;
        let mut envelope = sign("hello", &identity, &SignOptions::default()).unwrap();

        let mut bytes = envelope.agentcred.jws.into_bytes();
        let i = bytes.len() - 10;
        bytes[i] = if bytes[i] == b'A' { b'B' } else { b'A' };
        envelope.agentcred.jws = String::from_utf8(bytes).unwrap();

        let result = verifier.verify(&envelope).await;
        assert!(!result.verified);
        assert_eq!(result.reason, Some(FailureReason::InvalidSignature));
    }

    #[tokio::test]
    async fn test_agent_relabel_rejected() {
        let (identity, verifier) = setup().await;
        let mut envelope = sign("hello", &identity, &SignOptions::agent("bot")).unwrap();
        envelope.agentcred.agent = "trusted-bot".into();

        let result = verifier.verify(&envelope).await;
        assert_eq!(result.reason, Some(FailureReason::ClaimMismatch));
        assert_eq!(result.error.as_deref(), Some("Agent mismatch"));
    }

    #[tokio::test]
    async fn test_expired_signature() {
        let (identity, verifier) = setup().await;
        let signed_at = Utc::now() - chrono::Duration::seconds(86_401);
        let envelope = sign_at("hello", &identity, &SignOptions::default(), signed_at).unwrap();

        let result = verifier.verify(&envelope).await;
        assert_eq!(result.reason, Some(FailureReason::Expired));

        let verifier = verifier.with_max_clock_skew(Duration::from_secs(2 * 86_400));
        assert!(verifier.verify(&envelope).await.verified);
    }

    #[tokio::test]
    async fn test_malformed_envelopes() {
        let (identity, verifier) = setup().await;
        let good = sign("hello", &identity, &SignOptions::default()).unwrap();

        let mut bad_version = good.clone();
        bad_version.agentcred.v = "0.9".into();
        let mut bad_jws = good.clone();
        bad_jws.agentcred.jws = "not-a-jws".into();
        let mut bad_user = good.clone();
        bad_user.agentcred.github = "../../etc".into();

        for envelope in [bad_version, bad_jws, bad_user] {
            let result = verifier.verify(&envelope).await;
            assert_eq!(result.reason, Some(FailureReason::MalformedEnvelope));
        }

        let result = verifier.verify_json(r#"{"content":"x"}"#).await;
        assert_eq!(result.reason, Some(FailureReason::MalformedEnvelope));
        let result = verifier.verify_json("{{{").await;
        assert_eq!(result.reason, Some(FailureReason::MalformedEnvelope));
    }

    struct HangingAnchor;

    #[async_trait]
    impl TrustAnchor for HangingAnchor {
        async fn resolve(
            &self,
            _username: &str,
        ) -> CredResult<Option<crate::types::DirectoryEntry>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_resolution_timeout_fails_closed() {
        let identity = Identity::generate("alice").unwrap();
        let envelope = sign("hello", &identity, &SignOptions::default()).unwrap();
        let verifier = Verifier::new(HangingAnchor).with_resolve_timeout(Duration::from_millis(20));

        let result = verifier.verify(&envelope).await;
        assert!(!result.verified);
        assert_eq!(result.reason, Some(FailureReason::Unavailable));
    }

    #[tokio::test]
    async fn test_offline_pinned_key() {
        let identity = Identity::generate("alice").unwrap();
        let envelope = sign("hello", &identity, &SignOptions::default()).unwrap();

        let verifier = Verifier::new(PinnedKey::new(identity.public_jwk().clone()));
        assert!(verifier.verify(&envelope).await.verified);

        let other = Identity::generate("alice").unwrap();
        let verifier = Verifier::new(PinnedKey::new(other.public_jwk().clone()));
        assert!(!verifier.verify(&envelope).await.verified);
    }
}
