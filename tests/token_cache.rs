//! End-to-end behavior of the token cache against a mocked token endpoint:
//! initial population, error replay, failure backoff, schedule reset after a
//! foreground refresh, refresh deduplication, and the refresh-once/retry-once
//! contract at business call sites.

use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;
use tokio::time::sleep;

use wxtoken_rs::retry::call_with_token;
use wxtoken_rs::{Auth, Error, TokenCache, WxClient};

fn mp_auth() -> Auth {
    Auth::Mp {
        appid: "wx-test-appid".into(),
        secret: "test-secret".into(),
    }
}

fn client_for(server: &MockServer) -> WxClient {
    WxClient::default().with_mp_endpoint(format!("{}/cgi-bin/token", server.base_url()))
}

/// Poll until the cache read satisfies `pred` (the background task populates
/// the credential asynchronously after spawn).
async fn wait_for_token<F>(cache: &TokenCache, pred: F)
where
    F: Fn(&wxtoken_rs::Result<String>) -> bool,
{
    for _ in 0..300 {
        if pred(&cache.token()) {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("cache never reached expected state; last: {:?}", cache.token());
}

#[tokio::test]
async fn initial_fetch_populates_cache_and_reads_stay_cached() {
    let server = MockServer::start_async().await;
    let token_mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/cgi-bin/token")
                .query_param("grant_type", "client_credential")
                .query_param("appid", "wx-test-appid")
                .query_param("secret", "test-secret");
            then.status(200)
                .json_body(json!({"access_token": "ABC", "expires_in": 7200}));
        })
        .await;

    let cache = TokenCache::spawn(client_for(&server), mp_auth());
    wait_for_token(&cache, |r| matches!(r, Ok(t) if t == "ABC")).await;

    // Reads are served from the cache; no extra upstream calls.
    for _ in 0..20 {
        assert_eq!(cache.token().unwrap(), "ABC");
    }
    assert_eq!(token_mock.hits_async().await, 1);
}

#[tokio::test]
async fn initial_fetch_error_is_replayed_to_every_reader() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/cgi-bin/token");
            then.status(200)
                .json_body(json!({"errcode": 40001, "errmsg": "invalid credential"}));
        })
        .await;

    let cache = TokenCache::spawn(client_for(&server), mp_auth());
    wait_for_token(&cache, |r| matches!(r, Err(Error::Wx { code: 40001, .. }))).await;

    // The recorded error stays until connectivity/credentials recover; no
    // silent stale success.
    for _ in 0..5 {
        match cache.token() {
            Err(Error::Wx { code, message }) => {
                assert_eq!(code, 40001);
                assert!(message.contains("invalid credential"));
            }
            other => panic!("expected replayed errcode, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn failed_fetches_retry_on_the_fixed_backoff() {
    let server = MockServer::start_async().await;
    let token_mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/cgi-bin/token");
            then.status(200)
                .json_body(json!({"errcode": -1, "errmsg": "system busy"}));
        })
        .await;

    let cache = TokenCache::builder(client_for(&server), mp_auth())
        .with_backoff(Duration::from_millis(200))
        .spawn();
    wait_for_token(&cache, |r| matches!(r, Err(Error::Wx { code: -1, .. }))).await;

    // Backoff-spaced attempts, not TTL-spaced: expect roughly one fetch per
    // 200ms window after the initial failure.
    sleep(Duration::from_millis(1100)).await;
    let hits = token_mock.hits_async().await;
    assert!(hits >= 3, "expected backoff retries, saw {hits} fetches");
    assert!(cache.token().is_err());
}

#[tokio::test]
async fn foreground_refresh_resets_the_background_schedule() {
    let server = MockServer::start_async().await;
    // Short-lived first token: effective TTL 2s, so the scheduler's old
    // wake-up would fire at ~t+2s if the reschedule signal were lost.
    let first = server
        .mock_async(|when, then| {
            when.method(GET).path("/cgi-bin/token");
            then.status(200)
                .json_body(json!({"access_token": "TOK1", "expires_in": 2}));
        })
        .await;

    let cache = TokenCache::spawn(client_for(&server), mp_auth());
    wait_for_token(&cache, |r| matches!(r, Ok(t) if t == "TOK1")).await;
    assert_eq!(first.hits_async().await, 1);

    first.delete_async().await;
    let second = server
        .mock_async(|when, then| {
            when.method(GET).path("/cgi-bin/token");
            then.status(200)
                .json_body(json!({"access_token": "TOK2", "expires_in": 7200}));
        })
        .await;

    // Foreground refresh at ~t+0.5s reschedules the loop to the new 6600s
    // TTL; the old 2s timer must not fire.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(cache.refresh_token().await.unwrap(), "TOK2");
    assert_eq!(cache.token().unwrap(), "TOK2");

    sleep(Duration::from_millis(2500)).await;
    assert_eq!(
        second.hits_async().await,
        1,
        "background loop re-fetched on the stale schedule"
    );
}

#[tokio::test]
async fn concurrent_forced_refreshes_share_one_fetch() {
    let server = MockServer::start_async().await;
    let first = server
        .mock_async(|when, then| {
            when.method(GET).path("/cgi-bin/token");
            then.status(200)
                .json_body(json!({"access_token": "TOK1", "expires_in": 7200}));
        })
        .await;

    let cache = TokenCache::spawn(client_for(&server), mp_auth());
    wait_for_token(&cache, |r| matches!(r, Ok(t) if t == "TOK1")).await;

    first.delete_async().await;
    let second = server
        .mock_async(|when, then| {
            when.method(GET).path("/cgi-bin/token");
            then.status(200)
                .json_body(json!({"access_token": "TOK2", "expires_in": 7200}));
        })
        .await;

    // Five call sites observe the same rejected token and all force a
    // refresh; one upstream fetch serves them all.
    let refreshes = (0..5).map(|_| {
        let cache = cache.clone();
        tokio::spawn(async move { cache.refresh_stale(Some("TOK1")).await })
    });
    for handle in refreshes {
        assert_eq!(handle.await.unwrap().unwrap(), "TOK2");
    }
    assert_eq!(second.hits_async().await, 1);
}

#[tokio::test]
async fn concurrent_reads_see_either_old_or_new_token_never_a_mix() {
    let server = MockServer::start_async().await;
    let first = server
        .mock_async(|when, then| {
            when.method(GET).path("/cgi-bin/token");
            then.status(200)
                .json_body(json!({"access_token": "TOK1", "expires_in": 7200}));
        })
        .await;

    let cache = TokenCache::spawn(client_for(&server), mp_auth());
    wait_for_token(&cache, |r| matches!(r, Ok(t) if t == "TOK1")).await;

    first.delete_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/cgi-bin/token");
            then.status(200)
                .json_body(json!({"access_token": "TOK2", "expires_in": 7200}));
        })
        .await;

    let refresher = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.refresh_token().await })
    };
    let readers: Vec<_> = (0..50)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.token() })
        })
        .collect();

    for reader in readers {
        let token = reader.await.unwrap().unwrap();
        assert!(
            token == "TOK1" || token == "TOK2",
            "torn credential observed: {token:?}"
        );
    }
    assert_eq!(refresher.await.unwrap().unwrap(), "TOK2");
}

/// Minimal business call: appends the token, maps errcode != 0 to Error::Wx.
async fn business_call(url: &str, token: &str) -> wxtoken_rs::Result<String> {
    let resp = reqwest::get(format!("{url}?access_token={token}"))
        .await
        .map_err(Error::from)?;
    let v: serde_json::Value = resp.json().await.map_err(Error::from)?;
    let code = v["errcode"].as_i64().unwrap_or(0);
    if code != 0 {
        return Err(Error::Wx {
            code,
            message: v["errmsg"].as_str().unwrap_or_default().to_string(),
        });
    }
    Ok(v["data"].as_str().unwrap_or_default().to_string())
}

#[tokio::test]
async fn invalid_credential_on_business_call_refreshes_once_and_retries_once() {
    let server = MockServer::start_async().await;
    let first = server
        .mock_async(|when, then| {
            when.method(GET).path("/cgi-bin/token");
            then.status(200)
                .json_body(json!({"access_token": "TOK1", "expires_in": 7200}));
        })
        .await;

    // Business endpoint: rejects the stale token, accepts the refreshed one.
    let rejected = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/cgi-bin/business")
                .query_param("access_token", "TOK1");
            then.status(200)
                .json_body(json!({"errcode": 42001, "errmsg": "access_token expired"}));
        })
        .await;
    let accepted = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/cgi-bin/business")
                .query_param("access_token", "TOK2");
            then.status(200)
                .json_body(json!({"errcode": 0, "errmsg": "ok", "data": "payload"}));
        })
        .await;

    let cache = TokenCache::spawn(client_for(&server), mp_auth());
    wait_for_token(&cache, |r| matches!(r, Ok(t) if t == "TOK1")).await;

    first.delete_async().await;
    let refreshed = server
        .mock_async(|when, then| {
            when.method(GET).path("/cgi-bin/token");
            then.status(200)
                .json_body(json!({"access_token": "TOK2", "expires_in": 7200}));
        })
        .await;

    let biz_url = format!("{}/cgi-bin/business", server.base_url());
    let out = call_with_token(&cache, |token| {
        let url = biz_url.clone();
        async move { business_call(&url, &token).await }
    })
    .await
    .unwrap();

    assert_eq!(out, "payload");
    assert_eq!(rejected.hits_async().await, 1);
    assert_eq!(accepted.hits_async().await, 1);
    assert_eq!(refreshed.hits_async().await, 1);
}

#[tokio::test]
async fn persistently_invalid_credential_fails_after_exactly_one_retry() {
    let server = MockServer::start_async().await;
    let token_mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/cgi-bin/token");
            then.status(200)
                .json_body(json!({"access_token": "TOK1", "expires_in": 7200}));
        })
        .await;
    // Business endpoint rejects every token.
    let business = server
        .mock_async(|when, then| {
            when.method(GET).path("/cgi-bin/business");
            then.status(200)
                .json_body(json!({"errcode": 40014, "errmsg": "invalid access_token"}));
        })
        .await;

    let cache = TokenCache::spawn(client_for(&server), mp_auth());
    wait_for_token(&cache, |r| matches!(r, Ok(t) if t == "TOK1")).await;
    let fetches_before = token_mock.hits_async().await;

    let biz_url = format!("{}/cgi-bin/business", server.base_url());
    let err = call_with_token(&cache, |token| {
        let url = biz_url.clone();
        async move { business_call(&url, &token).await }
    })
    .await
    .unwrap_err();

    // One original attempt plus exactly one retry, one refresh in between,
    // then the error surfaces. No loop.
    assert!(matches!(err, Error::Wx { code: 40014, .. }));
    assert_eq!(business.hits_async().await, 2);
    assert_eq!(token_mock.hits_async().await, fetches_before + 1);
}

#[tokio::test]
async fn short_lived_token_refires_without_external_trigger() {
    let server = MockServer::start_async().await;
    // expires_in=2 sits in the use-as-is band: effective TTL 2s.
    let token_mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/cgi-bin/token");
            then.status(200)
                .json_body(json!({"access_token": "SHORT", "expires_in": 2}));
        })
        .await;

    let cache = TokenCache::spawn(client_for(&server), mp_auth());
    wait_for_token(&cache, |r| matches!(r, Ok(t) if t == "SHORT")).await;
    assert_eq!(token_mock.hits_async().await, 1);

    // The loop fires again after the effective TTL with no external trigger.
    sleep(Duration::from_millis(2600)).await;
    assert!(token_mock.hits_async().await >= 2);
    assert_eq!(cache.token().unwrap(), "SHORT");
}
