//! Envelope signing

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};

use crate::auth::validate_agent_name;
use crate::codec::to_canonical_string;
use crate::crypto::content_digest;
use crate::error::{CredError, CredResult};
use crate::identity::Identity;
use crate::jws;
use crate::types::{
    issuer_for, Claims, Credential, Envelope, ProtectedHeader, DEFAULT_AGENT,
    DEFAULT_CONTENT_TYPE, ENVELOPE_VERSION,
};

/// Per-envelope signing options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignOptions {
    pub agent: String,
    pub content_type: String,
}

impl Default for SignOptions {
    fn default() -> Self {
        Self {
            agent: DEFAULT_AGENT.into(),
            content_type: DEFAULT_CONTENT_TYPE.into(),
        }
    }
}

impl SignOptions {
    pub fn agent(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            ..Self::default()
        }
    }
}

/// Sign `content` now
pub fn sign(content: &str, identity: &Identity, options: &SignOptions) -> CredResult<Envelope> {
    sign_at(content, identity, options, Utc::now())
}

/// Sign `content` with an explicit timestamp
///
/// Identical key, content, options and timestamp produce an identical
/// envelope.
pub fn sign_at(
    content: &str,
    identity: &Identity,
    options: &SignOptions,
    signed_at: DateTime<Utc>,
) -> CredResult<Envelope> {
    validate_agent_name(&options.agent).map_err(|e| CredError::InvalidInput(e.into()))?;
    if options.content_type.trim().is_empty() {
        return Err(CredError::InvalidInput("content type cannot be empty".into()));
    }

    let username = identity.username();
    let claims = Claims {
        v: ENVELOPE_VERSION.into(),
        iss: issuer_for(username),
        sub: options.agent.clone(),
        iat: signed_at.timestamp(),
        content_hash: content_digest(content),
        content_type: options.content_type.clone(),
    };
    let jws = jws::sign(
        &ProtectedHeader::for_user(username),
        &claims,
        identity.signing_key(),
    )?;

    tracing::debug!(
        "Signed {} bytes for @{} as agent '{}'",
        content.len(),
        username,
        options.agent
    );

    Ok(Envelope {
        agentcred: Credential {
            v: ENVELOPE_VERSION.into(),
            jws,
            github: username.to_string(),
            agent: options.agent.clone(),
        },
        content: content.to_string(),
    })
}

// ============ HTML Embedding ============

/// Element wrapping signed HTML content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WrapperTag {
    #[default]
    Span,
    Div,
    P,
}

impl WrapperTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            WrapperTag::Span => "span",
            WrapperTag::Div => "div",
            WrapperTag::P => "p",
        }
    }
}

impl std::str::FromStr for WrapperTag {
    type Err = CredError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "span" => Ok(WrapperTag::Span),
            "div" => Ok(WrapperTag::Div),
            "p" => Ok(WrapperTag::P),
            other => Err(CredError::InvalidInput(format!(
                "wrapper tag must be span, div or p, got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HtmlOptions {
    pub sign: SignOptions,
    pub tag: WrapperTag,
    pub class_name: Option<String>,
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            c => out.push(c),
        }
    }
    out
}

/// Sign `content` and embed the credential in an HTML element
///
/// The `data-agentcred` attribute carries the base64 of the credential
/// block; the element body is the escaped content.
pub fn sign_html(content: &str, identity: &Identity, options: &HtmlOptions) -> CredResult<String> {
    let envelope = sign(content, identity, &options.sign)?;
    let metadata = to_canonical_string(&envelope.agentcred)?;
    let class_attr = options
        .class_name
        .as_deref()
        .map(|c| format!(" class=\"{}\"", escape_html(c)))
        .unwrap_or_default();
    let tag = options.tag.as_str();

    Ok(format!(
        "<{tag}{class_attr} data-agentcred=\"{}\">{}</{tag}>",
        BASE64.encode(metadata.as_bytes()),
        escape_html(content),
    ))
}
