//! In-process access_token cache with scheduled background refresh.
//!
//! This is the crate's core. One `TokenCache` owns one credential identity
//! and keeps a valid token available at all times:
//!
//! - A single background task performs the initial fetch, then re-fetches
//!   `effective_ttl(expires_in)` after each success and a fixed short backoff
//!   after each failure, forever.
//! - [`TokenCache::token`] is a synchronous lock-read: O(1), no I/O, never
//!   suspends. During an outage it returns the recorded error rather than a
//!   stale token.
//! - [`TokenCache::refresh_token`] is the forced foreground refresh call
//!   sites use after a business endpoint reports an invalid credential.
//!   Concurrent callers are deduplicated (one upstream fetch serves them
//!   all), and the background schedule is reset to the new TTL so it does
//!   not immediately re-fetch.
//!
//! Caution: `refresh_token` costs one upstream round trip. Call it at most
//! once per observed invalid-credential error (see [`crate::retry`]); calling
//! it on every request amplifies load on the token endpoint.

use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::token::{Auth, Error, Result, WxClient};

/// Backoff between attempts after a failed fetch, regardless of the previous
/// schedule.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Effective time-to-live: the server-reported TTL minus a safety margin, so
/// that network latency and clock skew never let a caller present an
/// actually-expired token upstream. The margin scales with the reported TTL;
/// WeChat's standard 7200 maps to 6600.
pub fn effective_ttl(expires_in: i64) -> Result<Duration> {
    let secs = match expires_in {
        t if t > 3600 => t - 600,
        t if t > 1800 => t - 300,
        t if t > 300 => t - 60,
        t if t > 10 => t - 10,
        t if t > 0 => t,
        t => return Err(Error::NonPositiveExpiry(t)),
    };
    Ok(Duration::from_secs(secs as u64))
}

/// The cached authentication state. All three fields change together under
/// one write lock; readers never observe a half-updated triple.
#[derive(Debug)]
struct Credential {
    value: String,
    expires_at: Instant,
    /// Incremented on every successful store; lets a forced refresh detect
    /// that another caller already replaced the credential while it waited.
    serial: u64,
    last_error: Option<Error>,
}

impl Credential {
    fn empty() -> Self {
        Self {
            value: String::new(),
            expires_at: Instant::now(),
            serial: 0,
            last_error: Some(Error::Uninitialized),
        }
    }
}

#[derive(Debug)]
struct CacheInner {
    client: WxClient,
    auth: Auth,
    credential: RwLock<Credential>,
    /// Serializes all refresh attempts (foreground and background).
    refresh_gate: Mutex<()>,
    /// Reschedule signal for the background loop. Last write wins; the loop
    /// always observes the latest value before its next natural wake-up.
    reschedule: watch::Sender<Duration>,
    backoff: Duration,
}

impl CacheInner {
    fn read(&self) -> RwLockReadGuard<'_, Credential> {
        self.credential.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Credential> {
        self.credential.write().unwrap_or_else(|e| e.into_inner())
    }

    fn store_success(&self, value: String, ttl: Duration) {
        let mut cred = self.write();
        cred.value = value;
        cred.expires_at = Instant::now() + ttl;
        cred.serial += 1;
        cred.last_error = None;
    }

    fn store_failure(&self, err: Error) {
        let mut cred = self.write();
        cred.value.clear();
        cred.last_error = Some(err);
    }

    /// One fetch against the token endpoint; does not touch the credential.
    async fn fetch_once(&self) -> Result<(String, Duration)> {
        let at = self.client.get_access_token(&self.auth).await?;
        let ttl = effective_ttl(at.expires_in)?;
        Ok((at.access_token, ttl))
    }

    /// Fetch, store the outcome, and return the delay until the next
    /// scheduled attempt.
    async fn refresh_once(&self) -> Duration {
        let _gate = self.refresh_gate.lock().await;
        match self.fetch_once().await {
            Ok((value, ttl)) => {
                debug!(ttl_secs = ttl.as_secs(), "access_token refreshed");
                self.store_success(value, ttl);
                ttl
            }
            Err(err) => {
                warn!(
                    backoff_secs = self.backoff.as_secs(),
                    "access_token refresh failed: {err}"
                );
                self.store_failure(err);
                self.backoff
            }
        }
    }
}

/// Background scheduler: initial fetch immediately, then sleep until the next
/// attempt, waking early whenever a foreground refresh resets the schedule.
async fn run_scheduler(inner: Arc<CacheInner>) {
    let mut rx = inner.reschedule.subscribe();
    // Mark the channel's initial value as seen; only real reschedules wake us.
    let _ = rx.borrow_and_update();

    let mut delay = inner.refresh_once().await;
    loop {
        tokio::select! {
            _ = sleep(delay) => {
                delay = inner.refresh_once().await;
            }
            changed = rx.changed() => match changed {
                Ok(()) => {
                    delay = *rx.borrow_and_update();
                    debug!(delay_secs = delay.as_secs(), "refresh schedule reset");
                }
                Err(_) => return,
            },
        }
    }
}

/// Aborts the scheduler when the last cache handle is dropped.
#[derive(Debug)]
struct SchedulerGuard(JoinHandle<()>);

impl Drop for SchedulerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Per-identity access_token cache. Cheap to clone; all clones share the same
/// credential and background task.
#[derive(Clone, Debug)]
pub struct TokenCache {
    inner: Arc<CacheInner>,
    _scheduler: Arc<SchedulerGuard>,
}

impl TokenCache {
    /// Start a cache with default policy. Must be called inside a tokio
    /// runtime; the background task lives until the last handle is dropped.
    pub fn spawn(client: WxClient, auth: Auth) -> Self {
        Self::builder(client, auth).spawn()
    }

    pub fn builder(client: WxClient, auth: Auth) -> TokenCacheBuilder {
        TokenCacheBuilder {
            client,
            auth,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Cached read: the last fetched token, or the last recorded error.
    ///
    /// Never blocks on network I/O. Returns `Err` while the initial fetch is
    /// in flight (`Uninitialized`), during an outage (the fetch error), or in
    /// the window where the token passed its safety-margined expiry before
    /// the background refresh landed (`Expired`).
    pub fn token(&self) -> Result<String> {
        let cred = self.inner.read();
        if let Some(err) = &cred.last_error {
            return Err(err.clone());
        }
        if Instant::now() >= cred.expires_at {
            return Err(Error::Expired);
        }
        Ok(cred.value.clone())
    }

    /// Forced synchronous refresh: one upstream round trip, then the new
    /// token (or the fetch error). Overwrites the credential either way and
    /// resets the background schedule.
    ///
    /// Concurrent callers deduplicate: whoever holds the refresh gate fetches;
    /// callers that were queued behind it observe the bumped credential
    /// serial and return the fresh value without another upstream call. When
    /// the rejected token is at hand, prefer [`TokenCache::refresh_stale`],
    /// which also deduplicates callers arriving after the fetch completed.
    pub async fn refresh_token(&self) -> Result<String> {
        self.refresh_stale(None).await
    }

    /// Forced refresh with the caller's rejected token. If the cache already
    /// holds a different valid token, another caller refreshed in the
    /// meantime and that token is returned without an upstream call.
    #[instrument(level = "debug", skip_all)]
    pub async fn refresh_stale(&self, stale: Option<&str>) -> Result<String> {
        let seen_serial = self.inner.read().serial;

        let _gate = self.inner.refresh_gate.lock().await;
        {
            let cred = self.inner.read();
            let replaced = cred.serial > seen_serial
                || stale.is_some_and(|s| !cred.value.is_empty() && s != cred.value);
            if cred.last_error.is_none() && replaced && Instant::now() < cred.expires_at {
                debug!("credential already replaced by a concurrent refresh");
                return Ok(cred.value.clone());
            }
        }

        match self.inner.fetch_once().await {
            Ok((value, ttl)) => {
                self.inner.store_success(value.clone(), ttl);
                let _ = self.inner.reschedule.send_replace(ttl);
                Ok(value)
            }
            Err(err) => {
                warn!("forced refresh failed: {err}");
                self.inner.store_failure(err.clone());
                let _ = self.inner.reschedule.send_replace(self.inner.backoff);
                Err(err)
            }
        }
    }

    /// Identity this cache serves (for registries and logs).
    pub fn identity(&self) -> String {
        self.inner.auth.identity()
    }
}

pub struct TokenCacheBuilder {
    client: WxClient,
    auth: Auth,
    backoff: Duration,
}

impl TokenCacheBuilder {
    /// Override the fixed backoff used after a failed fetch.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn spawn(self) -> TokenCache {
        let inner = Arc::new(CacheInner {
            client: self.client,
            auth: self.auth,
            credential: RwLock::new(Credential::empty()),
            refresh_gate: Mutex::new(()),
            reschedule: watch::channel(Duration::ZERO).0,
            backoff: self.backoff,
        });
        let handle = tokio::spawn(run_scheduler(inner.clone()));
        TokenCache {
            inner,
            _scheduler: Arc::new(SchedulerGuard(handle)),
        }
    }
}

/// Seam between call sites and a token source, so the in-process cache and a
/// distributed store are interchangeable behind one contract.
pub trait AccessTokenProvider: Send + Sync {
    /// A usable token: the cached one when valid, otherwise the result of a
    /// refresh.
    fn access_token(&self) -> impl Future<Output = Result<String>> + Send;

    /// Force one refresh against the token endpoint. Invoke at most once per
    /// observed invalid-credential error, passing the rejected token so
    /// implementations can deduplicate racing refreshers.
    fn force_refresh(&self, stale: Option<&str>) -> impl Future<Output = Result<String>> + Send;
}

impl AccessTokenProvider for TokenCache {
    async fn access_token(&self) -> Result<String> {
        match self.token() {
            Ok(v) => Ok(v),
            // The scheduler keeps the cache warm; an error here means we are
            // uninitialized, expired, or mid-outage. One foreground attempt.
            Err(_) => self.refresh_token().await,
        }
    }

    async fn force_refresh(&self, stale: Option<&str>) -> Result<String> {
        self.refresh_stale(stale).await
    }
}
