use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};

use crate::identity::{IdentityVerifier, StaticVerifier};
use crate::jwt::{HmacJwtVerifier, JwksVerifier};
use crate::protocol::RelayPolicy;
use crate::registry::DEFAULT_OUTBOUND_BUFFER;

/// What to do with a frame that fails to decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum MalformedFramePolicy {
    /// Drop the frame and answer with an `error` frame.
    #[default]
    Drop,
    /// Close the connection with a protocol error.
    Close,
}

#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "HUDDLE_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Time a new connection has to present a valid credential.
    #[arg(long, env = "HUDDLE_AUTH_TIMEOUT_MS", default_value_t = 5_000)]
    pub auth_timeout_ms: u64,

    /// Close connections that send nothing for this long.
    #[arg(long, env = "HUDDLE_IDLE_TIMEOUT_SECS", default_value_t = 600)]
    pub idle_timeout_secs: u64,

    /// Frames queued per connection before it counts as a slow consumer.
    #[arg(long, env = "HUDDLE_OUTBOUND_BUFFER", default_value_t = DEFAULT_OUTBOUND_BUFFER)]
    pub outbound_buffer: usize,

    /// Largest inbound frame accepted, in bytes.
    #[arg(long, env = "HUDDLE_MAX_FRAME_BYTES", default_value_t = 64 * 1024)]
    pub max_frame_bytes: usize,

    #[arg(long, env = "HUDDLE_MALFORMED_FRAMES", value_enum, default_value_t = MalformedFramePolicy::Drop)]
    pub malformed_frames: MalformedFramePolicy,

    /// Restrict relaying to these message types (comma separated). Unset relays
    /// any directed type.
    #[arg(long, env = "HUDDLE_RELAY_TYPES", value_delimiter = ',')]
    pub relay_types: Vec<String>,

    /// Shared HS256 secret for member tokens.
    #[arg(long, env = "HUDDLE_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// JWKS endpoint publishing the ES256 keys that sign member tokens.
    #[arg(long, env = "HUDDLE_JWKS_URL")]
    pub jwks_url: Option<String>,

    #[arg(long, env = "HUDDLE_JWT_ISSUER")]
    pub jwt_issuer: Option<String>,

    #[arg(long, env = "HUDDLE_JWT_AUDIENCE")]
    pub jwt_audience: Option<String>,

    #[arg(long, env = "HUDDLE_JWKS_CACHE_TTL_SECS", default_value_t = 300)]
    pub jwks_cache_ttl_secs: u64,

    /// Accept a fixed token for local development: TOKEN=MEMBER[:NAME]. Repeatable.
    #[arg(long = "dev-token", value_name = "TOKEN=MEMBER[:NAME]")]
    pub dev_tokens: Vec<String>,

    #[arg(long, env = "HUDDLE_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Clone)]
pub enum VerifierSource {
    Jwks {
        url: String,
        issuer: Option<String>,
        audience: Option<String>,
        cache_ttl: Duration,
    },
    Secret {
        secret: String,
        issuer: Option<String>,
        audience: Option<String>,
    },
    Static(StaticVerifier),
}

impl std::fmt::Debug for VerifierSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifierSource::Jwks { url, .. } => f.debug_struct("Jwks").field("url", url).finish(),
            VerifierSource::Secret { .. } => f.write_str("Secret(..)"),
            VerifierSource::Static(_) => f.write_str("Static(..)"),
        }
    }
}

impl VerifierSource {
    pub fn build(&self) -> Arc<dyn IdentityVerifier> {
        match self {
            VerifierSource::Jwks {
                url,
                issuer,
                audience,
                cache_ttl,
            } => Arc::new(JwksVerifier::new(
                url.clone(),
                issuer.clone(),
                audience.clone(),
                *cache_ttl,
            )),
            VerifierSource::Secret {
                secret,
                issuer,
                audience,
            } => Arc::new(HmacJwtVerifier::new(
                secret.as_bytes(),
                issuer.as_deref(),
                audience.as_deref(),
            )),
            VerifierSource::Static(verifier) => Arc::new(verifier.clone()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            VerifierSource::Jwks { .. } => "jwks",
            VerifierSource::Secret { .. } => "hs256",
            VerifierSource::Static(_) => "dev-tokens",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub auth_timeout: Duration,
    pub idle_timeout: Duration,
    pub outbound_buffer: usize,
    pub max_frame_bytes: usize,
    pub malformed_frames: MalformedFramePolicy,
    pub relay_policy: RelayPolicy,
    pub verifier: VerifierSource,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServerArgs> for Config {
    type Error = anyhow::Error;

    fn try_from(args: ServerArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.auth_timeout_ms == 0 {
            bail!("auth timeout must be greater than zero");
        }
        if args.outbound_buffer == 0 {
            bail!("outbound buffer must hold at least one frame");
        }

        let relay_types: Vec<String> = args
            .relay_types
            .iter()
            .map(|kind| kind.trim().to_string())
            .filter(|kind| !kind.is_empty())
            .collect();
        let relay_policy = if relay_types.is_empty() {
            RelayPolicy::AnyDirected
        } else {
            RelayPolicy::AllowList(relay_types)
        };

        Ok(Config {
            listen_addr,
            auth_timeout: Duration::from_millis(args.auth_timeout_ms),
            idle_timeout: Duration::from_secs(args.idle_timeout_secs.max(1)),
            outbound_buffer: args.outbound_buffer,
            max_frame_bytes: args.max_frame_bytes,
            malformed_frames: args.malformed_frames,
            relay_policy,
            verifier: verifier_source(&args)?,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

fn verifier_source(args: &ServerArgs) -> Result<VerifierSource> {
    let configured = [
        args.jwks_url.is_some(),
        args.jwt_secret.is_some(),
        !args.dev_tokens.is_empty(),
    ]
    .into_iter()
    .filter(|set| *set)
    .count();
    if configured != 1 {
        bail!("configure exactly one of --jwks-url, --jwt-secret or --dev-token");
    }

    if let Some(url) = &args.jwks_url {
        return Ok(VerifierSource::Jwks {
            url: url.clone(),
            issuer: args.jwt_issuer.clone(),
            audience: args.jwt_audience.clone(),
            cache_ttl: Duration::from_secs(args.jwks_cache_ttl_secs),
        });
    }
    if let Some(secret) = &args.jwt_secret {
        if secret.len() < 16 {
            bail!("jwt secret must be at least 16 bytes");
        }
        return Ok(VerifierSource::Secret {
            secret: secret.clone(),
            issuer: args.jwt_issuer.clone(),
            audience: args.jwt_audience.clone(),
        });
    }

    let mut verifier = StaticVerifier::new();
    for entry in &args.dev_tokens {
        let (token, identity) = StaticVerifier::parse_entry(entry)
            .with_context(|| format!("invalid --dev-token '{entry}', expected TOKEN=MEMBER[:NAME]"))?;
        verifier.insert(token, identity);
    }
    Ok(VerifierSource::Static(verifier))
}

impl Config {
    /// Local defaults around a given verifier; used by tests and embedders.
    pub fn with_verifier(verifier: VerifierSource) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            auth_timeout: crate::gate::DEFAULT_AUTH_WINDOW,
            idle_timeout: Duration::from_secs(600),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            max_frame_bytes: 64 * 1024,
            malformed_frames: MalformedFramePolicy::Drop,
            relay_policy: RelayPolicy::AnyDirected,
            verifier,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}
