//! Wiring of the authority from configuration.

use crate::config::{Config, StoreBackend};
use crate::jwt::JwtAccessTokenIssuer;
use crate::refresh::TokenRotationAuthority;
use crate::storage::{MemoryTokenStore, RedisTokenStore, TokenStore};
use anyhow::Context;
use rust_common::{init_tracing, SystemClock};
use std::sync::Arc;
use tracing::info;

/// Install the tracing subscriber described by `config`.
pub fn init_telemetry(config: &Config) -> bool {
    init_tracing(&config.tracing)
}

/// Build an authority backed by the configured store, a JWT issuer and
/// the system clock.
pub async fn build_authority(config: &Config) -> anyhow::Result<TokenRotationAuthority> {
    let store: Arc<dyn TokenStore> = match &config.token_store {
        StoreBackend::Memory => Arc::new(MemoryTokenStore::new()),
        StoreBackend::Redis { url, key_prefix } => {
            let store = RedisTokenStore::new(url, key_prefix.clone(), config.retention()?)
                .await
                .context("connecting Redis token store")?;
            Arc::new(store)
        }
    };

    let mut issuer = JwtAccessTokenIssuer::new(
        config.jwt_issuer.clone(),
        config.jwt_audience.clone(),
        config.signing_secret.expose(),
        config.access_token_ttl,
    );
    if let Some(kid) = &config.jwt_key_id {
        issuer = issuer.with_key_id(kid.clone());
    }

    info!(
        store = ?config.token_store,
        refresh_token_ttl_secs = config.refresh_token_ttl.as_secs(),
        "Token rotation authority ready"
    );

    Ok(TokenRotationAuthority::new(
        store,
        Arc::new(issuer),
        Arc::new(SystemClock),
        config.rotation_policy()?,
    ))
}
