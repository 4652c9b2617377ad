use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::types::{ErrorBody, FailureReason};

/// Errors surfaced by the library and the command front end
#[derive(Error, Debug)]
pub enum CredError {
    #[error("GitHub authentication failed: {0}")]
    Authentication(String),

    #[error("No identity found. Run 'agentcred init' first.")]
    NoIdentity,

    #[error("Identity already exists for @{0}")]
    IdentityExists(String),

    #[error("Invalid envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Content hash mismatch - content was tampered")]
    TamperedContent,

    #[error("No registered key for user: {0}")]
    UnknownIdentity(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("{0}")]
    ClaimMismatch(String),

    #[error("Signature expired or timestamp out of range")]
    Expired,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Key directory error: {0}")]
    Directory(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Command failed (exit {code}): {message}")]
    Process { code: i32, message: String },
}

impl CredError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn directory(msg: impl Into<String>) -> Self {
        Self::Directory(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedEnvelope(msg.into())
    }

    /// Verification failure class, if this error ends a verification
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            CredError::MalformedEnvelope(_) | CredError::Decode(_) => {
                Some(FailureReason::MalformedEnvelope)
            }
            CredError::TamperedContent => Some(FailureReason::TamperedContent),
            CredError::UnknownIdentity(_) => Some(FailureReason::UnknownIdentity),
            CredError::InvalidSignature(_) => Some(FailureReason::InvalidSignature),
            CredError::ClaimMismatch(_) => Some(FailureReason::ClaimMismatch),
            CredError::Expired => Some(FailureReason::Expired),
            CredError::Timeout(_) | CredError::Directory(_) => Some(FailureReason::Unavailable),
            _ => None,
        }
    }

    /// Process exit code used by the `agentcred` binary
    pub fn exit_code(&self) -> i32 {
        match self {
            CredError::InvalidInput(_) => exit_code::USAGE,
            CredError::Authentication(_) => exit_code::AUTHENTICATION,
            CredError::NoIdentity | CredError::IdentityExists(_) => exit_code::NO_IDENTITY,
            CredError::MalformedEnvelope(_)
            | CredError::Decode(_)
            | CredError::TamperedContent
            | CredError::UnknownIdentity(_)
            | CredError::InvalidSignature(_)
            | CredError::ClaimMismatch(_)
            | CredError::Expired => exit_code::VERIFICATION_FAILED,
            CredError::Storage(_) => exit_code::STORAGE,
            CredError::Timeout(_) => exit_code::TIMEOUT,
            CredError::Directory(_) => exit_code::DIRECTORY,
            CredError::Process { code, .. } => *code,
        }
    }

    /// Rebuild a typed error from a child process exit code and its stderr
    ///
    /// Exit codes shared by several variants are told apart by the message
    /// the binary printed.
    pub fn from_exit(code: i32, stderr: &str) -> Self {
        let message = stderr.trim().trim_start_matches('✗').trim().to_string();
        match code {
            exit_code::USAGE => CredError::InvalidInput(message),
            exit_code::AUTHENTICATION => CredError::Authentication(message),
            exit_code::NO_IDENTITY => match message.strip_prefix("Identity already exists for @") {
                Some(username) => CredError::IdentityExists(username.to_string()),
                None => CredError::NoIdentity,
            },
            exit_code::VERIFICATION_FAILED => verification_error(message),
            exit_code::STORAGE => CredError::Storage(message),
            exit_code::TIMEOUT => CredError::Timeout(message),
            exit_code::DIRECTORY => CredError::Directory(message),
            _ => CredError::Process { code, message },
        }
    }
}

fn verification_error(message: String) -> CredError {
    let detail = |prefix: &str| message.strip_prefix(prefix).map(str::to_string);

    if message.starts_with("Content hash mismatch") {
        CredError::TamperedContent
    } else if message.starts_with("Signature expired") {
        CredError::Expired
    } else if let Some(username) = detail("No registered key for user: ") {
        CredError::UnknownIdentity(username)
    } else if let Some(reason) = detail("Invalid signature: ") {
        CredError::InvalidSignature(reason)
    } else if let Some(reason) = detail("Decode error: ") {
        CredError::Decode(reason)
    } else if let Some(reason) = detail("Invalid envelope: ") {
        CredError::MalformedEnvelope(reason)
    } else {
        CredError::MalformedEnvelope(message)
    }
}

impl From<CryptoError> for CredError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::VerificationFailed => CredError::InvalidSignature(e.to_string()),
            CryptoError::InvalidSignature(_) => CredError::InvalidSignature(e.to_string()),
            other => CredError::InvalidInput(other.to_string()),
        }
    }
}

pub type CredResult<T> = Result<T, CredError>;

/// Exit codes for the command front end
pub mod exit_code {
    pub const FAILURE: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTHENTICATION: i32 = 3;
    pub const NO_IDENTITY: i32 = 4;
    pub const VERIFICATION_FAILED: i32 = 5;
    pub const STORAGE: i32 = 6;
    pub const TIMEOUT: i32 = 7;
    pub const DIRECTORY: i32 = 8;
}

// ============ Key Directory Service Errors ============

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Bad request: {0}")]
    BadRequestWithHint(String, String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl ApiError {
    pub fn bad_request_with_hint(msg: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::BadRequestWithHint(msg.into(), hint.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<CredError> for ApiError {
    fn from(e: CredError) -> Self {
        match e {
            CredError::Authentication(_) => ApiError::Unauthorized("Invalid GitHub token".into()),
            CredError::Timeout(msg) | CredError::Directory(msg) => ApiError::Upstream(msg),
            CredError::Storage(msg) => ApiError::Internal(msg),
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, hint) = match &self {
            ApiError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                msg.clone(),
                Some("Include 'Authorization: Bearer <github token>' header"),
            ),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            ApiError::BadRequestWithHint(msg, hint) => {
                (StatusCode::BAD_REQUEST, msg.clone(), Some(hint.as_str()))
            }
            ApiError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded".to_string(),
                Some("Wait before making more requests"),
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                msg.clone(),
                Some("Please try again later"),
            ),
            ApiError::Upstream(msg) => (
                StatusCode::BAD_GATEWAY,
                msg.clone(),
                Some("GitHub could not be reached"),
            ),
        };

        let body = ErrorBody {
            error: message,
            hint: hint.map(str::to_string),
        };

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
