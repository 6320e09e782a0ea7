#![doc = r#"
wxtoken-rs

Access-token cache/refresh core for WeChat public-platform (公众号 / 小程序)
and WeCom (企业微信) APIs.

One `TokenCache` per credential identity keeps a valid bearer token warm: a
background task fetches it from Tencent's token endpoint, subtracts a
TTL-scaled safety margin from the reported `expires_in`, and re-fetches ahead
of expiry (fixed short backoff on failure). Reads are synchronous and never
touch the network; call sites that see an invalid-credential errcode refresh
once and retry once via `retry::call_with_token`.

Quick usage:

```ignore
use wxtoken_rs::{Auth, TokenCache, WxClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cache = TokenCache::spawn(
        WxClient::default(),
        Auth::Mp {
            appid: "your_appid".into(),
            secret: "your_appsecret".into(),
        },
    );

    // Cached read; populated by the background task shortly after spawn.
    let token = cache.token()?;
    println!("access_token len: {}", token.len());

    // Business call with the refresh-once/retry-once contract:
    let resp = wxtoken_rs::retry::call_with_token(&cache, |token| async move {
        my_business_call(&token).await
    })
    .await?;

    Ok(())
}
```

Feature `redis` adds `RedisTokenStore`, a distributed store behind the same
`AccessTokenProvider` contract for multi-instance deployments.
"#]

pub mod errors;
pub mod registry;
pub mod retry;
pub mod token;
pub mod token_cache;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use token::{AccessToken, Auth, Error, Result, WxClient, WxError};
pub use token_cache::{AccessTokenProvider, TokenCache, TokenCacheBuilder};

#[cfg(feature = "redis")]
pub use redis_store::RedisTokenStore;
