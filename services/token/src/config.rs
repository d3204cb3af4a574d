//! Centralized configuration for the rotation service.
//!
//! All configuration is loaded from environment variables and validated
//! at startup.

use crate::error::ConfigError;
use crate::refresh::RotationPolicy;
use base64::Engine as _;
use rust_common::TracingConfig;
use std::env;
use std::fmt;
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

const MIN_SECRET_LEN: usize = 32;

/// Where refresh-token records live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// In-process maps; state is lost on restart
    Memory,
    /// Redis
    Redis {
        /// Connection URL
        url: String,
        /// Prefix for every key written
        key_prefix: String,
    },
}

/// HMAC key for access tokens. Never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningSecret(Vec<u8>);

impl SigningSecret {
    pub fn new(bytes: Vec<u8>) -> Result<Self, ConfigError> {
        if bytes.len() < MIN_SECRET_LEN {
            return Err(ConfigError::invalid(
                "JWT_SECRET",
                format!("must be at least {} bytes, got {}", MIN_SECRET_LEN, bytes.len()),
            ));
        }
        Ok(SigningSecret(bytes))
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret([redacted])")
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // JWT settings
    /// JWT issuer claim
    pub jwt_issuer: String,
    /// JWT audience claim
    pub jwt_audience: Vec<String>,
    /// Optional `kid` header
    pub jwt_key_id: Option<String>,
    /// Access token signing secret
    pub signing_secret: SigningSecret,
    /// Access token TTL
    pub access_token_ttl: Duration,
    /// Refresh token TTL
    pub refresh_token_ttl: Duration,

    // Storage
    /// Token store backend
    pub token_store: StoreBackend,
    /// How long token records outlive their expiry
    pub token_retention: Duration,

    // Observability
    /// Tracing subscriber settings
    pub tracing: TracingConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable is present but invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let jwt_issuer = lookup("JWT_ISSUER").unwrap_or_else(|| "auth-platform".to_string());
        let jwt_audience = lookup("JWT_AUDIENCE")
            .unwrap_or_else(|| "auth-platform-api".to_string())
            .split(',')
            .map(str::trim)
            .filter(|aud| !aud.is_empty())
            .map(String::from)
            .collect::<Vec<_>>();
        if jwt_audience.is_empty() {
            return Err(ConfigError::invalid("JWT_AUDIENCE", "must name at least one audience"));
        }
        let jwt_key_id = lookup("JWT_KEY_ID").filter(|kid| !kid.is_empty());
        let signing_secret = parse_signing_secret(lookup("JWT_SECRET"))?;

        let access_token_ttl = parse_ttl(&lookup, "ACCESS_TOKEN_TTL", 900)?;
        let refresh_token_ttl = parse_ttl(&lookup, "REFRESH_TOKEN_TTL", 604800)?;
        let token_retention = Duration::from_secs(parse_var(&lookup, "TOKEN_RETENTION", 86400)?);

        let token_store = match lookup("TOKEN_STORE")
            .unwrap_or_else(|| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "memory" => StoreBackend::Memory,
            "redis" => StoreBackend::Redis {
                url: lookup("REDIS_URL").ok_or(ConfigError::Missing("REDIS_URL"))?,
                key_prefix: lookup("REDIS_KEY_PREFIX").unwrap_or_else(|| "token_rotation".to_string()),
            },
            other => return Err(ConfigError::invalid("TOKEN_STORE", format!("unknown backend {}", other))),
        };

        let tracing = TracingConfig::default()
            .with_service_name("token-rotation-service")
            .with_log_level(lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()))
            .with_json_output(parse_var(&lookup, "LOG_JSON", false)?);

        Ok(Self {
            jwt_issuer,
            jwt_audience,
            jwt_key_id,
            signing_secret,
            access_token_ttl,
            refresh_token_ttl,
            token_store,
            token_retention,
            tracing,
        })
    }

    /// Rotation policy derived from the configured TTLs.
    pub fn rotation_policy(&self) -> Result<RotationPolicy, ConfigError> {
        Ok(RotationPolicy {
            refresh_token_ttl: to_chrono("REFRESH_TOKEN_TTL", self.refresh_token_ttl)?,
        })
    }

    /// Retention as a chrono duration, for storage backends.
    pub fn retention(&self) -> Result<chrono::Duration, ConfigError> {
        to_chrono("TOKEN_RETENTION", self.token_retention)
    }
}

/// Parse variable with default value.
fn parse_var<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match lookup(name) {
        Some(val) => val.trim().parse().map_err(|e| ConfigError::invalid(name, e)),
        None => Ok(default),
    }
}

fn parse_ttl<F>(lookup: &F, name: &'static str, default_secs: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse_var(lookup, name, default_secs)?;
    if secs == 0 {
        return Err(ConfigError::invalid(name, "must be greater than zero"));
    }
    Ok(Duration::from_secs(secs))
}

fn to_chrono(name: &'static str, duration: Duration) -> Result<chrono::Duration, ConfigError> {
    chrono::Duration::from_std(duration).map_err(|e| ConfigError::invalid(name, e))
}

/// Parse signing secret; a random one is generated for development.
fn parse_signing_secret(raw: Option<String>) -> Result<SigningSecret, ConfigError> {
    match raw {
        Some(key) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(key.trim())
                .map_err(|e| ConfigError::invalid("JWT_SECRET", e))?;
            SigningSecret::new(bytes)
        }
        None => {
            use rand::RngCore;
            let mut key = vec![0u8; MIN_SECRET_LEN];
            rand::thread_rng().fill_bytes(&mut key);
            tracing::warn!("JWT_SECRET not set - using an ephemeral signing secret");
            SigningSecret::new(key)
        }
    }
}
