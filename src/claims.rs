//! Best-effort extraction of identity fields from a bearer token.
//!
//! The signature is never verified. Fields recovered here only enrich log
//! records and must not be used for any authorization decision.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{Map, Value};

/// Identity hints carried by a decoded token payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenClaims {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub application_id: Option<String>,
    pub application: Option<String>,
    pub environment: Option<String>,
}

/// Decode the payload segment of a JWT-shaped token.
///
/// Returns `None` for anything that is not three dot-separated segments
/// with a base64url JSON object in the middle. A leading `Bearer ` is
/// tolerated.
pub fn decode_claims(token: &str) -> Option<TokenClaims> {
    let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let payload: Map<String, Value> = serde_json::from_slice(&bytes).ok()?;

    Some(TokenClaims {
        user_id: first_string(&payload, &["userId", "user_id", "sub", "id"]),
        session_id: first_string(&payload, &["sessionId", "session_id", "sid"]),
        application_id: first_string(&payload, &["applicationId", "application_id", "appId", "clientId"]),
        application: first_string(&payload, &["application", "app"]),
        environment: first_string(&payload, &["environment", "env"]),
    })
}

fn first_string(payload: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match payload.get(*k)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
pub(crate) fn encode_unsigned(payload: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{}.{}.sig", header, body)
}
