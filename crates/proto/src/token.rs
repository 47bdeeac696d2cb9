//! Authentication payloads and the session token stamped onto a connection.
//!
//! Raw `authentication` payloads are decoded at the boundary into an
//! [`AuthRequest`]; anything that is not a JSON object is rejected so the
//! connection stays unauthenticated.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtoError;

/// Default trusted-peer marker carried in the `is` field of internal tokens.
pub const INTERNAL_MARKER: &str = "-*!#fl1nter#!*-";

/// Decoded `authentication` payload.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthRequest {
    /// Trusted-peer token; bypasses credential lookup.
    Internal { fields: Map<String, Value> },
    /// Credential to be resolved by the token validator.
    Credential {
        id: String,
        fields: Map<String, Value>,
    },
}

impl AuthRequest {
    /// Decodes a raw payload, comparing its `is` field against `secret`.
    pub fn decode(payload: &Value, secret: &str) -> Result<Self, ProtoError> {
        let Value::Object(fields) = payload else {
            return Err(ProtoError::MalformedToken(format!(
                "expected object, got {}",
                json_kind(payload)
            )));
        };

        if fields.get("is").and_then(Value::as_str) == Some(secret) {
            return Ok(Self::Internal {
                fields: fields.clone(),
            });
        }

        let id = match fields.get("id") {
            None | Some(Value::Null) => "0".to_string(),
            Some(Value::String(s)) if s.is_empty() => "0".to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(ProtoError::MalformedToken(format!(
                    "id must be a string or number, got {}",
                    json_kind(other)
                )));
            }
        };

        Ok(Self::Credential {
            id,
            fields: fields.clone(),
        })
    }

    /// Returns `true` for the trusted-peer variant.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Input of a credential store lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialQuery {
    /// Credential identifier.
    pub id: String,
}

impl CredentialQuery {
    /// Creates a query for `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Record returned by a credential store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRecord {
    /// Record columns as JSON.
    pub fields: Map<String, Value>,
}

impl CredentialRecord {
    /// Wraps a JSON object as a record.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Builds a record from a JSON value, rejecting non-objects.
    pub fn from_value(value: Value) -> Result<Self, ProtoError> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(ProtoError::Serialization(format!(
                "credential record must be an object, got {}",
                json_kind(&other)
            ))),
        }
    }
}

/// Provenance of a stamped token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// Trusted peer (loopback or cluster instance).
    Internal,
    /// Resolved through a credential store or custom resolver.
    Credential,
}

/// Token stamped onto an authenticated connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionToken {
    pub kind: TokenKind,
    pub fields: Map<String, Value>,
}

impl SessionToken {
    /// Token for a trusted peer.
    pub fn internal(fields: Map<String, Value>) -> Self {
        Self {
            kind: TokenKind::Internal,
            fields,
        }
    }

    /// Merges the caller's payload (minus `user`) with the stored record.
    ///
    /// Record fields win on conflicts.
    pub fn from_credential(mut initial: Map<String, Value>, record: CredentialRecord) -> Self {
        initial.remove("user");
        initial.extend(record.fields);
        Self {
            kind: TokenKind::Credential,
            fields: initial,
        }
    }

    /// Token returned by a custom resolver. Only JSON objects are accepted;
    /// `null`, scalars and arrays yield `None`.
    pub fn from_resolver(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self {
                kind: TokenKind::Credential,
                fields,
            }),
            _ => None,
        }
    }

    /// `userId` rendered as a string when it is a string or a number.
    pub fn user_id(&self) -> Option<String> {
        match self.fields.get("userId")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Returns `true` for trusted-peer tokens.
    pub fn is_internal(&self) -> bool {
        self.kind == TokenKind::Internal
    }
}
