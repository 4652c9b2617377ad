//! EdDSA compact JWS
//!
//! `base64url(header) "." base64url(claims) "." base64url(signature)` where
//! header and claims are canonical JSON.

use ed25519_dalek::{SigningKey, VerifyingKey};

use crate::codec::to_canonical_string;
use crate::crypto::{b64url_decode, b64url_encode, sign_bytes, verify_bytes};
use crate::error::{CredError, CredResult};
use crate::types::{Claims, ProtectedHeader, JWS_ALG};

/// Produce a compact JWS over `claims`
pub fn sign(header: &ProtectedHeader, claims: &Claims, key: &SigningKey) -> CredResult<String> {
    let header_json = to_canonical_string(header)?;
    let claims_json = to_canonical_string(claims)?;
    let signing_input = format!(
        "{}.{}",
        b64url_encode(header_json.as_bytes()),
        b64url_encode(claims_json.as_bytes())
    );
    let signature = sign_bytes(key, signing_input.as_bytes());
    Ok(format!("{}.{}", signing_input, b64url_encode(&signature)))
}

/// A parsed, not yet verified, compact JWS
#[derive(Debug, Clone)]
pub struct CompactJws {
    pub header: ProtectedHeader,
    /// Untrusted until [`CompactJws::verify`] succeeds
    pub claims: Claims,
    signing_input: String,
    signature: String,
}

impl CompactJws {
    /// Split and decode a compact JWS. Shape problems are malformed-envelope errors.
    pub fn parse(token: &str) -> CredResult<Self> {
        let parts: Vec<&str> = token.trim().split('.').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(CredError::malformed("jws must have three non-empty segments"));
        }

        let header_bytes = b64url_decode(parts[0])
            .map_err(|e| CredError::malformed(format!("jws header: {}", e)))?;
        let header: ProtectedHeader = serde_json::from_slice(&header_bytes)
            .map_err(|e| CredError::malformed(format!("jws header: {}", e)))?;

        let claims_bytes = b64url_decode(parts[1])
            .map_err(|e| CredError::malformed(format!("jws payload: {}", e)))?;
        let claims: Claims = serde_json::from_slice(&claims_bytes)
            .map_err(|e| CredError::malformed(format!("jws payload: {}", e)))?;

        Ok(Self {
            header,
            claims,
            signing_input: format!("{}.{}", parts[0], parts[1]),
            signature: parts[2].to_string(),
        })
    }

    /// Check the algorithm and the signature against `key`
    pub fn verify(&self, key: &VerifyingKey) -> CredResult<()> {
        if self.header.alg != JWS_ALG {
            return Err(CredError::InvalidSignature("Invalid algorithm".into()));
        }
        let signature = b64url_decode(&self.signature)
            .map_err(|e| CredError::InvalidSignature(e.to_string()))?;
        verify_bytes(key, self.signing_input.as_bytes(), &signature)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_signing_key;

    fn claims() -> Claims {
        Claims {
            v: "1.0".into(),
            iss: "alice@agentcred".into(),
            sub: "bot".into(),
            iat: 1_700_000_000,
            content_hash: "sha256:abc".into(),
            content_type: "text/plain".into(),
        }
    }

    #[test]
    fn test_sign_parse_verify() {
        let key = generate_signing_key();
        let token = sign(&ProtectedHeader::for_user("alice"), &claims(), &key).unwrap();
        assert_eq!(token.split('.').count(), 3);

        let jws = CompactJws::parse(&token).unwrap();
        assert_eq!(jws.claims, claims());
        assert_eq!(jws.header.typ, "agentcred+jwt");
        assert!(jws.verify(&key.verifying_key()).is_ok());
    }

    #[test]
    fn test_signing_is_deterministic() {
        let key = generate_signing_key();
        let header = ProtectedHeader::for_user("alice");
        assert_eq!(
            sign(&header, &claims(), &key).unwrap(),
            sign(&header, &claims(), &key).unwrap()
        );
    }

    #[test]
    fn test_wrong_key_rejected() {
        let token = sign(&ProtectedHeader::for_user("alice"), &claims(), &generate_signing_key()).unwrap();
        let jws = CompactJws::parse(&token).unwrap();
        assert!(matches!(
            jws.verify(&generate_signing_key().verifying_key()),
            Err(CredError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_alg_none_rejected() {
        let key = generate_signing_key();
        let mut header = ProtectedHeader::for_user("alice");
        header.alg = "none".into();
        let token = sign(&header, &claims(), &key).unwrap();
        let jws = CompactJws::parse(&token).unwrap();
        match jws.verify(&key.verifying_key()) {
            Err(CredError::InvalidSignature(msg)) => assert_eq!(msg, "Invalid algorithm"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        for token in ["", "a.b", "a..c", "a.b.c.d", "!!!.e30.c2ln"] {
            assert!(
                matches!(CompactJws::parse(token), Err(CredError::MalformedEnvelope(_))),
                "token {:?} should be malformed",
                token
            );
        }
    }
}
