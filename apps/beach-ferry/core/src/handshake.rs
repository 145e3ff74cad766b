use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::channel::session_fingerprint;
use crate::role::Role;

/// Field carrying the role claim.
pub const ROLE_FIELD: &str = "role";
/// Field carrying the session token. `token` is accepted as an alias.
pub const TOKEN_FIELD: &str = "password";
const TOKEN_FIELD_ALIAS: &str = "token";

/// First message on every ferry connection.
#[derive(Clone, PartialEq, Eq)]
pub struct Handshake {
    pub role: Role,
    pub token: String,
}

impl Handshake {
    pub fn new(role: Role, token: impl Into<String>) -> Self {
        Self {
            role,
            token: token.into(),
        }
    }

    /// JSON payload a peer sends to open its seat.
    pub fn to_json(&self) -> String {
        let mut fields = Map::new();
        fields.insert(ROLE_FIELD.into(), Value::String(self.role.as_str().into()));
        fields.insert(TOKEN_FIELD.into(), Value::String(self.token.clone()));
        Value::Object(fields).to_string()
    }
}

// The token is a shared secret, keep it out of debug output.
impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("role", &self.role)
            .field("session", &session_fingerprint(&self.token))
            .finish()
    }
}

/// Reasons a handshake is refused. Callers must not surface these to the
/// peer; every variant ends in the same silent close.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake payload is not a json object of the expected shape")]
    Malformed,
    #[error("handshake field `{0}` is missing or empty")]
    MissingField(&'static str),
    #[error("unknown role `{0}`")]
    UnknownRole(String),
    #[error("no handshake received before the deadline")]
    TimedOut,
    #[error("connection ended before a handshake arrived")]
    ClosedEarly,
}

impl HandshakeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            HandshakeError::Malformed => "malformed",
            HandshakeError::MissingField(_) => "missing_field",
            HandshakeError::UnknownRole(_) => "unknown_role",
            HandshakeError::TimedOut => "timeout",
            HandshakeError::ClosedEarly => "closed_early",
        }
    }
}

/// Parses the opening frame of a connection.
///
/// Both fields are required and must be non-empty after trimming. The token
/// itself is returned byte-for-byte; only the emptiness check trims.
pub fn parse_handshake(payload: &[u8]) -> Result<Handshake, HandshakeError> {
    let value: Value = serde_json::from_slice(payload).map_err(|_| HandshakeError::Malformed)?;
    let Value::Object(fields) = value else {
        return Err(HandshakeError::Malformed);
    };

    let role = required_string(&fields, ROLE_FIELD, &[])?;
    let token = required_string(&fields, TOKEN_FIELD, &[TOKEN_FIELD_ALIAS])?;

    let role = role
        .parse::<Role>()
        .map_err(|err| HandshakeError::UnknownRole(err.0))?;

    Ok(Handshake {
        role,
        token: token.to_string(),
    })
}

fn required_string<'a>(
    fields: &'a Map<String, Value>,
    name: &'static str,
    aliases: &[&str],
) -> Result<&'a str, HandshakeError> {
    let found = std::iter::once(name)
        .chain(aliases.iter().copied())
        .find_map(|key| fields.get(key).filter(|value| !value.is_null()));

    match found {
        None => Err(HandshakeError::MissingField(name)),
        Some(Value::String(text)) if text.trim().is_empty() => {
            Err(HandshakeError::MissingField(name))
        }
        Some(Value::String(text)) => Ok(text.as_str()),
        Some(_) => Err(HandshakeError::Malformed),
    }
}
