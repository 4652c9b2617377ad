//! Envelope codec
//!
//! Canonical JSON writer (keys sorted by byte order, no insignificant
//! whitespace) used for the JWS signing input, the fingerprint input and the
//! envelope wire form.

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::CredError;
use crate::types::{Credential, Envelope, ENVELOPE_VERSION};

/// Codec failures
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    Json(String),
    #[error("expected a JSON object")]
    NotAnObject,
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("field '{0}' must be a string")]
    WrongType(&'static str),
    #[error("unsupported envelope version '{0}'")]
    UnsupportedVersion(String),
    #[error("serialization failed: {0}")]
    Encode(String),
}

impl From<CodecError> for CredError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Json(_) => CredError::Decode(e.to_string()),
            CodecError::Encode(_) => CredError::InvalidInput(e.to_string()),
            other => CredError::MalformedEnvelope(other.to_string()),
        }
    }
}

/// Write a JSON value in canonical form
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(_) => out.push_str(&value.to_string()),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
        }
    }
}

/// Serialize any value to canonical JSON
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, CodecError> {
    let value = serde_json::to_value(value).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(canonical_json(&value))
}

/// Encode an envelope in its canonical wire form
pub fn encode(envelope: &Envelope) -> String {
    let value = json!({
        "agentcred": {
            "v": envelope.agentcred.v,
            "jws": envelope.agentcred.jws,
            "github": envelope.agentcred.github,
            "agent": envelope.agentcred.agent,
        },
        "content": envelope.content,
    });
    canonical_json(&value)
}

/// Decode an envelope from JSON text
pub fn decode(input: &str) -> Result<Envelope, CodecError> {
    let value: Value =
        serde_json::from_str(input.trim()).map_err(|e| CodecError::Json(e.to_string()))?;
    decode_value(&value)
}

/// Decode an envelope from an already parsed JSON value
pub fn decode_value(value: &Value) -> Result<Envelope, CodecError> {
    let root = value.as_object().ok_or(CodecError::NotAnObject)?;
    let cred = match root.get("agentcred") {
        Some(Value::Object(map)) => map,
        Some(_) => return Err(CodecError::NotAnObject),
        None => return Err(CodecError::MissingField("agentcred")),
    };

    let v = string_field(cred, "v", "agentcred.v")?;
    if v != ENVELOPE_VERSION {
        return Err(CodecError::UnsupportedVersion(v));
    }

    Ok(Envelope {
        agentcred: Credential {
            v,
            jws: string_field(cred, "jws", "agentcred.jws")?,
            github: string_field(cred, "github", "agentcred.github")?,
            agent: string_field(cred, "agent", "agentcred.agent")?,
        },
        content: string_field(root, "content", "content")?,
    })
}

fn string_field(
    map: &Map<String, Value>,
    key: &str,
    path: &'static str,
) -> Result<String, CodecError> {
    match map.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(CodecError::WrongType(path)),
        None => Err(CodecError::MissingField(path)),
    }
}
