use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::warn;

use crate::identity::{Identity, IdentityVerifier, VerificationError};

/// Member claims. The short registered names win over the long aliases when a
/// token carries both.
#[derive(Debug, Deserialize)]
struct MemberClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default, rename = "memberId")]
    member_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "displayName")]
    display_name: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
    #[serde(default, rename = "avatarRef")]
    avatar_ref: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl MemberClaims {
    fn into_identity(self) -> Result<Identity, VerificationError> {
        let member_id = non_blank(self.sub)
            .or_else(|| non_blank(self.member_id))
            .ok_or(VerificationError::MissingSubject)?;
        let display_name = non_blank(self.name)
            .or_else(|| non_blank(self.display_name))
            .unwrap_or_else(|| member_id.clone());
        Ok(Identity {
            member_id,
            display_name,
            avatar_ref: non_blank(self.avatar).or_else(|| non_blank(self.avatar_ref)),
        })
    }
}

fn validation(algorithm: Algorithm, issuer: Option<&str>, audience: Option<&str>) -> Validation {
    let mut validation = Validation::new(algorithm);
    if let Some(issuer) = issuer {
        validation.set_issuer(&[issuer]);
    }
    match audience {
        Some(audience) => validation.set_audience(&[audience]),
        None => validation.validate_aud = false,
    }
    validation
}

/// HS256 tokens signed with a secret shared with the credential issuer.
#[derive(Clone)]
pub struct HmacJwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl HmacJwtVerifier {
    pub fn new(secret: &[u8], issuer: Option<&str>, audience: Option<&str>) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: validation(Algorithm::HS256, issuer, audience),
        }
    }
}

#[async_trait]
impl IdentityVerifier for HmacJwtVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, VerificationError> {
        let data = decode::<MemberClaims>(token, &self.key, &self.validation)?;
        data.claims.into_identity()
    }
}

/// ES256 tokens checked against keys published at a JWKS endpoint.
#[derive(Clone)]
pub struct JwksVerifier {
    jwks_url: String,
    issuer: Option<String>,
    audience: Option<String>,
    cache_ttl: Duration,
    cache: Arc<RwLock<Option<JwksCache>>>,
    client: Client,
}

struct JwksCache {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

impl JwksCache {
    fn stale(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() > ttl
    }
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<JwkEntry>,
}

#[derive(Debug, Deserialize)]
struct JwkEntry {
    kid: Option<String>,
    kty: String,
    #[serde(default)]
    crv: Option<String>,
    #[serde(default)]
    x: Option<String>,
    #[serde(default)]
    y: Option<String>,
}

impl JwksVerifier {
    pub fn new(
        jwks_url: String,
        issuer: Option<String>,
        audience: Option<String>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            jwks_url,
            issuer,
            audience,
            cache_ttl,
            cache: Arc::new(RwLock::new(None)),
            client: Client::new(),
        }
    }

    async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, VerificationError> {
        {
            let cache = self.cache.read().await;
            if let Some(cache) = cache.as_ref() {
                if !cache.stale(self.cache_ttl) {
                    if let Some(key) = cache.keys.get(kid) {
                        return Ok(key.clone());
                    }
                }
            }
        }

        // Miss or stale: refetch once. A kid that is still absent after a fresh
        // fetch is unknown.
        let mut cache = self.cache.write().await;
        let fresh = cache
            .as_ref()
            .map(|c| !c.stale(self.cache_ttl) && c.keys.contains_key(kid))
            .unwrap_or(false);
        if !fresh {
            *cache = Some(self.fetch_jwks().await?);
        }

        cache
            .as_ref()
            .and_then(|c| c.keys.get(kid).cloned())
            .ok_or_else(|| VerificationError::UnknownKey(kid.to_string()))
    }

    async fn fetch_jwks(&self) -> Result<JwksCache, VerificationError> {
        if self.jwks_url.trim().is_empty() {
            return Err(VerificationError::MissingJwksUrl);
        }

        let response = self.client.get(&self.jwks_url).send().await?;
        if !response.status().is_success() {
            return Err(VerificationError::JwksFetch(format!(
                "status {}",
                response.status()
            )));
        }

        let body: JwksResponse = response.json().await?;
        let keys = usable_keys(body);
        if keys.is_empty() {
            return Err(VerificationError::JwksFetch(
                "no usable keys in JWKS response".to_string(),
            ));
        }

        Ok(JwksCache {
            keys,
            fetched_at: Instant::now(),
        })
    }
}

fn usable_keys(body: JwksResponse) -> HashMap<String, DecodingKey> {
    let mut keys = HashMap::new();
    for entry in body.keys {
        if entry.kty != "EC" || entry.crv.as_deref() != Some("P-256") {
            continue;
        }
        let (Some(kid), Some(x), Some(y)) = (entry.kid, entry.x, entry.y) else {
            continue;
        };
        match DecodingKey::from_ec_components(&x, &y) {
            Ok(key) => {
                keys.insert(kid, key);
            }
            Err(err) => {
                warn!(
                    target: "huddle-signal::jwt",
                    error = %err,
                    "failed to parse jwk entry; skipping"
                );
            }
        }
    }
    keys
}

#[async_trait]
impl IdentityVerifier for JwksVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, VerificationError> {
        let header = decode_header(token)?;
        let kid = header.kid.ok_or(VerificationError::MissingKid)?;
        let key = self.decoding_key(&kid).await?;
        let validation = validation(
            Algorithm::ES256,
            self.issuer.as_deref(),
            self.audience.as_deref(),
        );
        let data = decode::<MemberClaims>(token, &key, &validation)?;
        data.claims.into_identity()
    }
}
