//! Process-wide registry of token caches, one per credential identity.
//!
//! Call sites that cannot thread a [`TokenCache`] handle through their own
//! plumbing can share one cache per (appid | corpid) here. The registry keys
//! on [`Auth::identity`]; the token itself is never global state, only the
//! cache handle is shared, so multiple identities coexist in one process.
//!
//! Environment conveniences (same shape as reading WXKF_* vars in older
//! tooling):
//! - Public platform: `WX_APPID`, `WX_SECRET`
//! - WeCom: `WX_CORP_ID`, `WX_CORP_SECRET`

use std::sync::OnceLock;

use dashmap::DashMap;
use tracing::debug;

use crate::token::{Auth, Error, Result, WxClient};
use crate::token_cache::TokenCache;

fn registry() -> &'static DashMap<String, TokenCache> {
    static CACHES: OnceLock<DashMap<String, TokenCache>> = OnceLock::new();
    CACHES.get_or_init(DashMap::new)
}

/// Get or start the shared cache for this identity.
///
/// The first caller for an identity spawns the cache (and its background
/// refresh task) with the supplied client; later callers receive the same
/// handle and the supplied client is ignored. Must run inside a tokio
/// runtime.
pub fn shared_cache(client: &WxClient, auth: &Auth) -> TokenCache {
    let key = auth.identity();
    registry()
        .entry(key.clone())
        .or_insert_with(|| {
            debug!(identity = %key, "starting shared token cache");
            TokenCache::spawn(client.clone(), auth.clone())
        })
        .clone()
}

/// Drop the shared cache for an identity, stopping its background task once
/// the last outstanding handle is released. Mainly for tests and credential
/// rotation.
pub fn evict(auth: &Auth) -> bool {
    registry().remove(&auth.identity()).is_some()
}

/// Shared public-platform cache from `WX_APPID` / `WX_SECRET`.
pub fn mp_cache_from_env() -> Result<TokenCache> {
    let auth = Auth::Mp {
        appid: env_var("WX_APPID")?,
        secret: env_var("WX_SECRET")?,
    };
    Ok(shared_cache(&WxClient::default(), &auth))
}

/// Shared WeCom cache from `WX_CORP_ID` / `WX_CORP_SECRET`.
pub fn work_cache_from_env() -> Result<TokenCache> {
    let auth = Auth::Work {
        corp_id: env_var("WX_CORP_ID")?,
        corp_secret: env_var("WX_CORP_SECRET")?,
    };
    Ok(shared_cache(&WxClient::default(), &auth))
}

fn env_var(name: &'static str) -> Result<String> {
    std::env::var(name).map_err(|_| Error::MissingEnv(name))
}
