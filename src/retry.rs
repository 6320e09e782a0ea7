//! Call-site retry contract for business API calls.
//!
//! When a business endpoint answers with an invalid-credential errcode
//! (40001/40014/42001), the cached token is stale on the server side. The
//! contract: refresh once, retry the original request once, and surface the
//! second failure unchanged. Never loop; unbounded refresh-retry on a
//! misconfigured credential hammers both the business endpoint and the token
//! endpoint.

use std::future::Future;

use tracing::{debug, warn};

use crate::errors::should_refresh_token;
use crate::token::{Error, Result};
use crate::token_cache::AccessTokenProvider;

/// Run one token-bearing request with the refresh-once/retry-once contract.
///
/// `f` receives the current access_token and performs the business call,
/// mapping a non-zero errcode into [`Error::Wx`]. If that errcode signals an
/// invalid or expired credential, the provider is refreshed exactly once and
/// `f` is retried exactly once with the new token; any other error, and any
/// error on the retry, is returned as-is.
pub async fn call_with_token<P, F, Fut, T>(provider: &P, mut f: F) -> Result<T>
where
    P: AccessTokenProvider,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let token = provider.access_token().await?;
    let stale = token.clone();
    match f(token).await {
        Err(Error::Wx { code, .. }) if should_refresh_token(code) => {
            warn!(code, "business endpoint rejected credential; refreshing once");
            let token = provider.force_refresh(Some(&stale)).await?;
            debug!("retrying request with refreshed token");
            f(token).await.map_err(|e| {
                if let Error::Wx { code, .. } = &e {
                    if should_refresh_token(*code) {
                        warn!(code = *code, "credential still rejected after refresh; giving up");
                    }
                }
                e
            })
        }
        other => other,
    }
}
