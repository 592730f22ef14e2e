use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Verified identity attached to an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub member_id: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("unknown credential")]
    UnknownToken,
    #[error("token missing member identifier")]
    MissingSubject,
    #[error("token header missing kid")]
    MissingKid,
    #[error("unknown jwk key id {0}")]
    UnknownKey(String),
    #[error("jwks url not configured")]
    MissingJwksUrl,
    #[error("jwks fetch failed: {0}")]
    JwksFetch(String),
    #[error("token validation failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl VerificationError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            VerificationError::UnknownToken => "unknown_token",
            VerificationError::MissingSubject => "missing_subject",
            VerificationError::MissingKid => "missing_kid",
            VerificationError::UnknownKey(_) => "unknown_key",
            VerificationError::MissingJwksUrl => "missing_jwks_url",
            VerificationError::JwksFetch(_) => "jwks_fetch",
            VerificationError::InvalidToken(_) => "invalid_token",
            VerificationError::Http(_) => "http",
        }
    }
}

/// Turns an opaque credential into an [`Identity`].
///
/// Implementations must be side-effect free from the caller's point of view; the
/// signaling core only ever calls `verify` once per connection.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, VerificationError>;
}

/// Fixed token table. Used by `--dev-token` and in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, identity: Identity) {
        self.tokens.insert(token.into(), identity);
    }

    /// Parse `TOKEN=MEMBER[:DISPLAY NAME]`.
    pub fn parse_entry(entry: &str) -> Option<(String, Identity)> {
        let (token, rest) = entry.split_once('=')?;
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        let (member, name) = match rest.split_once(':') {
            Some((member, name)) => (member.trim(), name.trim()),
            None => (rest.trim(), ""),
        };
        if member.is_empty() {
            return None;
        }
        let display_name = if name.is_empty() { member } else { name };
        Some((
            token.to_string(),
            Identity {
                member_id: member.to_string(),
                display_name: display_name.to_string(),
                avatar_ref: None,
            },
        ))
    }
}

#[async_trait]
impl IdentityVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, VerificationError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(VerificationError::UnknownToken)
    }
}
