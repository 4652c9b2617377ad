//! Cryptographic operations for AgentCred
//!
//! Provides Ed25519 key generation, JWK conversion, signature
//! verification, content digests and fingerprint generation.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::codec::canonical_json;
use crate::types::{PrivateJwk, PublicJwk};

/// JWK key type for Ed25519
pub const JWK_KTY: &str = "OKP";
/// JWK curve for Ed25519
pub const JWK_CRV: &str = "Ed25519";
/// Prefix of content digests
pub const DIGEST_PREFIX: &str = "sha256:";

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Crypto operation errors
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),
    #[error("Invalid signature format: {0}")]
    InvalidSignature(String),
    #[error("Signature verification failed")]
    VerificationFailed,
    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),
    #[error("Base64 decode error: {0}")]
    Base64Error(String),
}

/// Generate a fresh Ed25519 signing key
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Export the public half of a key as a JWK
pub fn public_jwk(key: &VerifyingKey) -> PublicJwk {
    PublicJwk {
        kty: JWK_KTY.into(),
        crv: JWK_CRV.into(),
        x: B64URL.encode(key.as_bytes()),
        use_: None,
        alg: None,
    }
}

/// Export a signing key as a private JWK
pub fn private_jwk(key: &SigningKey) -> PrivateJwk {
    PrivateJwk {
        kty: JWK_KTY.into(),
        crv: JWK_CRV.into(),
        x: B64URL.encode(key.verifying_key().as_bytes()),
        d: B64URL.encode(key.to_bytes()),
    }
}

fn check_key_type(kty: &str, crv: &str) -> CryptoResult<()> {
    if kty != JWK_KTY || crv != JWK_CRV {
        return Err(CryptoError::UnsupportedKeyType(format!("{}/{}", kty, crv)));
    }
    Ok(())
}

fn decode_32(b64: &str, what: &str) -> CryptoResult<[u8; 32]> {
    let bytes = B64URL
        .decode(b64.trim())
        .map_err(|e| CryptoError::Base64Error(e.to_string()))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey(format!("{} must be 32 bytes, got {}", what, len)))
}

/// Parse a public JWK into a verifying key
pub fn verifying_key_from_jwk(jwk: &PublicJwk) -> CryptoResult<VerifyingKey> {
    check_key_type(&jwk.kty, &jwk.crv)?;
    if let Some(ref alg) = jwk.alg {
        if alg != crate::types::JWS_ALG {
            return Err(CryptoError::UnsupportedKeyType(format!("alg {}", alg)));
        }
    }
    let bytes = decode_32(&jwk.x, "Ed25519 public key")?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Parse a private JWK into a signing key, checking `x` matches `d`
pub fn signing_key_from_jwk(jwk: &PrivateJwk) -> CryptoResult<SigningKey> {
    check_key_type(&jwk.kty, &jwk.crv)?;
    let secret = decode_32(&jwk.d, "Ed25519 secret key")
        .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
    let key = SigningKey::from_bytes(&secret);
    if B64URL.encode(key.verifying_key().as_bytes()) != jwk.x.trim() {
        return Err(CryptoError::InvalidPrivateKey(
            "public component does not match secret".into(),
        ));
    }
    Ok(key)
}

/// Sign raw bytes
pub fn sign_bytes(key: &SigningKey, message: &[u8]) -> [u8; 64] {
    key.sign(message).to_bytes()
}

/// Verify a raw Ed25519 signature (strict: rejects malleable encodings)
pub fn verify_bytes(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> CryptoResult<()> {
    let sig_array: [u8; 64] = signature.try_into().map_err(|_| {
        CryptoError::InvalidSignature(format!(
            "Ed25519 signature must be 64 bytes, got {}",
            signature.len()
        ))
    })?;
    let signature = Signature::from_bytes(&sig_array);
    key.verify_strict(message, &signature)
        .map_err(|_| CryptoError::VerificationFailed)
}

/// Compute the fingerprint of a public key: SHA256 (hex) of its canonical JWK
///
/// Optional `use`/`alg` members are ignored so the same key always yields
/// the same fingerprint.
pub fn compute_fingerprint(jwk: &PublicJwk) -> String {
    let value = serde_json::json!({
        "crv": jwk.crv,
        "kty": jwk.kty,
        "x": jwk.x,
    });
    sha256_hex(canonical_json(&value).as_bytes())
}

/// Compute SHA256 hash of data (hex encoded)
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Digest of envelope content as carried in the claims (`sha256:<hex>`)
pub fn content_digest(content: &str) -> String {
    format!("{}{}", DIGEST_PREFIX, sha256_hex(content.as_bytes()))
}

/// Constant-time string comparison
pub fn digests_match(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

pub fn b64url_encode(data: &[u8]) -> String {
    B64URL.encode(data)
}

pub fn b64url_decode(data: &str) -> CryptoResult<Vec<u8>> {
    B64URL
        .decode(data)
        .map_err(|e| CryptoError::Base64Error(e.to_string()))
}
