//! AgentCred
//!
//! Human accountability credentials for AI agents.
//! A person binds an Ed25519 key to their GitHub account; agents acting for
//! them sign content with it, and anyone can verify the result against a
//! public key directory.
//!
//! ## Architecture
//!
//! - **Identity**: one local key per store, registered with the key directory
//! - **Envelope**: content plus a compact EdDSA JWS over its digest and claims
//! - **Verification**: keys come only from a trust anchor, never the envelope
//! - **Key directory**: small axum service mapping GitHub logins to keys

pub mod api;
pub mod auth;
pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod error;
pub mod github;
pub mod identity;
pub mod jws;
pub mod signer;
pub mod state;
pub mod types;
pub mod verifier;

pub use client::{CredentialClient, LocalClient, ProcessClient};
pub use config::Config;
pub use directory::{HttpKeyDirectory, KeyRegistry, MemoryDirectory, PinnedKey, TrustAnchor};
pub use error::{ApiError, ApiResult, CredError, CredResult};
pub use identity::{Identity, IdentityManager, IdentityStore, InitPolicy};
pub use signer::{sign, sign_html, SignOptions};
pub use state::AppState;
pub use types::{Envelope, FailureReason, VerificationResult};
pub use verifier::Verifier;
