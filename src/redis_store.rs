//! Redis-backed distributed token store (feature `redis`).
//!
//! Extension point for multi-instance deployments: the same
//! token/refresh contract as the in-process [`crate::token_cache::TokenCache`],
//! backed by a shared Redis so instances do not each fetch their own token
//! and trip the endpoint's daily quota.
//!
//! Design:
//! - Tokens are stored as JSON with an `expires_at` epoch timestamp and a
//!   matching Redis TTL, one key per credential identity under a namespace.
//! - When the token is missing or expired, one instance acquires a
//!   `SET NX EX` lock and fetches; the others poll the cache briefly with
//!   jitter instead of calling upstream.
//! - The expiry already carries the safety margin from
//!   [`crate::token_cache::effective_ttl`], so a read-back token is safe to
//!   present upstream for its whole remaining lifetime.
//!
//! The default, in-process `TokenCache` stays the recommended path; reach for
//! this only when several processes share one credential identity.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::token::{Auth, Error, Result, WxClient};
use crate::token_cache::{effective_ttl, AccessTokenProvider};

/// JSON payload stored in Redis for a cached token.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredToken {
    access_token: String,
    /// Epoch seconds when the token should be considered expired locally.
    expires_at: i64,
}

/// Distributed access_token store for one credential identity.
#[derive(Clone)]
pub struct RedisTokenStore {
    redis: ConnectionManager,
    client: WxClient,
    auth: Auth,
    namespace: String,
    lock_ttl: Duration,
    max_wait: Duration,
}

impl RedisTokenStore {
    pub fn new(redis: ConnectionManager, client: WxClient, auth: Auth) -> Self {
        Self {
            redis,
            client,
            auth,
            namespace: "wxtoken".to_string(),
            lock_ttl: Duration::from_secs(30),
            max_wait: Duration::from_secs(5),
        }
    }

    /// Override the Redis key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Override the fetch-lock TTL.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Override the maximum wait while another instance holds the lock.
    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }

    fn token_key(&self) -> String {
        format!("{}:{}", self.namespace, self.auth.identity())
    }

    fn lock_key(&self) -> String {
        format!("{}:lock", self.token_key())
    }

    /// Current token, fetched through the shared cache.
    #[instrument(level = "debug", skip(self))]
    pub async fn token(&self) -> Result<String> {
        let key = self.token_key();
        if let Some(st) = self.read_stored(&key).await? {
            let now = epoch()?;
            if st.expires_at > now {
                debug!("redis token valid, remaining={}s", st.expires_at - now);
                return Ok(st.access_token);
            }
            debug!("redis token expired; refreshing");
        } else {
            debug!("no token in redis; refreshing");
        }
        self.refresh_with_lock(&key).await
    }

    /// Forced refresh: ignore the cached value, take the fetch lock, and
    /// replace the stored token.
    #[instrument(level = "debug", skip(self))]
    pub async fn refresh_token(&self) -> Result<String> {
        let key = self.token_key();
        self.refresh_with_lock(&key).await
    }

    /// Drop the stored token for this identity.
    pub async fn invalidate(&self) -> Result<()> {
        let mut redis = self.redis.clone();
        let _: () = redis
            .del(self.token_key())
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn read_stored(&self, key: &str) -> Result<Option<StoredToken>> {
        let mut redis = self.redis.clone();
        let raw: Option<String> = redis.get(key).await.map_err(storage_err)?;
        match raw {
            Some(s) => {
                let st = serde_json::from_str(&s)
                    .map_err(|e| Error::Storage(format!("stored token decode: {e}")))?;
                Ok(Some(st))
            }
            None => Ok(None),
        }
    }

    /// One instance fetches under a `SET NX EX` lock; the rest poll the cache
    /// until it is populated or `max_wait` elapses.
    async fn refresh_with_lock(&self, key: &str) -> Result<String> {
        let lock_key = self.lock_key();

        if self.try_acquire_lock(&lock_key).await? {
            debug!("fetch lock acquired; calling token endpoint");
            return self.fetch_and_store(key).await;
        }

        debug!("fetch lock held by another instance; polling cache");
        let start = epoch()?;
        let max_wait = self.max_wait.as_secs() as i64;
        let mut attempt: u64 = 0;

        loop {
            if let Some(st) = self.read_stored(key).await? {
                if st.expires_at > epoch()? {
                    debug!("another instance populated the token");
                    return Ok(st.access_token);
                }
            }

            if epoch()? - start >= max_wait {
                warn!("waited {}s for token; trying the lock once more", max_wait);
                if self.try_acquire_lock(&lock_key).await? {
                    return self.fetch_and_store(key).await;
                }
                return Err(Error::Storage(
                    "timeout waiting for token; fetch lock held by another instance".into(),
                ));
            }

            attempt += 1;
            let jitter_ms = 100 + ((attempt * 37) % 200);
            sleep(Duration::from_millis(jitter_ms)).await;
        }
    }

    /// `SET lock_key val NX EX ttl`; the lock expires on its own, ownership
    /// is not tracked.
    async fn try_acquire_lock(&self, lock_key: &str) -> Result<bool> {
        let mut redis = self.redis.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(lock_key)
            .arg(lock_value())
            .arg("NX")
            .arg("EX")
            .arg(self.lock_ttl.as_secs())
            .query_async(&mut redis)
            .await
            .map_err(storage_err)?;
        Ok(acquired.is_some())
    }

    async fn fetch_and_store(&self, key: &str) -> Result<String> {
        let at = self.client.get_access_token(&self.auth).await?;
        let ttl = effective_ttl(at.expires_in)?;
        let st = StoredToken {
            access_token: at.access_token,
            expires_at: epoch()? + ttl.as_secs() as i64,
        };

        let json = serde_json::to_string(&st)
            .map_err(|e| Error::Storage(format!("stored token encode: {e}")))?;
        let mut redis = self.redis.clone();
        let _: () = redis::pipe()
            .cmd("SET")
            .arg(key)
            .arg(&json)
            .arg("EX")
            .arg(ttl.as_secs())
            .ignore()
            .query_async(&mut redis)
            .await
            .map_err(storage_err)?;

        Ok(st.access_token)
    }
}

impl AccessTokenProvider for RedisTokenStore {
    async fn access_token(&self) -> Result<String> {
        self.token().await
    }

    async fn force_refresh(&self, stale: Option<&str>) -> Result<String> {
        // Another instance may already have replaced the rejected token.
        if let Some(stale) = stale {
            if let Some(st) = self.read_stored(&self.token_key()).await? {
                if st.access_token != stale && st.expires_at > epoch()? {
                    debug!("token already replaced by another instance");
                    return Ok(st.access_token);
                }
            }
        }
        self.refresh_token().await
    }
}

fn storage_err(e: redis::RedisError) -> Error {
    Error::Storage(e.to_string())
}

fn epoch() -> Result<i64> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::Storage("system clock before epoch".into()))?;
    Ok(now.as_secs() as i64)
}

/// Lock value for diagnostics; ownership-based release is intentionally not
/// implemented, the TTL handles release.
fn lock_value() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("ts-{}", now)
}
