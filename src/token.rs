//! WeChat access_token endpoint client.
//!
//! Provides the credential types and the low-level client used to fetch an
//! `access_token` from Tencent's token endpoints. Caching, proactive refresh
//! and the retry contract live in [`crate::token_cache`] and [`crate::retry`];
//! this module performs exactly one HTTP round trip per call.
//!
//! Design:
//! - `Auth` distinguishes the two credential identities (public platform
//!   appid/secret vs. WeCom corpid/corpsecret).
//! - `WxClient` wraps `reqwest::Client`, carries a request timeout, and maps
//!   the endpoint's success/error union into `Result<AccessToken>`.
//! - Errors are unified via `Error`; the cache stores and replays them, so
//!   every variant is cheap to clone.
//!
//! Endpoints:
//! - Public platform (公众号 / 小程序):
//!   GET https://api.weixin.qq.com/cgi-bin/token?grant_type=client_credential&appid=APPID&secret=SECRET
//! - WeCom (企业微信):
//!   GET https://qyapi.weixin.qq.com/cgi-bin/gettoken?corpid=CORP_ID&corpsecret=CORP_SECRET
//!
//! Note: secrets are never logged; identifiers are reduced to a redacted hint.

use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

const MP_TOKEN_ENDPOINT: &str = "https://api.weixin.qq.com/cgi-bin/token";
const WORK_TOKEN_ENDPOINT: &str = "https://qyapi.weixin.qq.com/cgi-bin/gettoken";

/// Default per-request timeout for token fetches. Token bodies are tiny JSON;
/// anything slower than this is treated as a transport failure and handed to
/// the backoff path.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Credential identity.
///
/// One live token cache per distinct identity; never share a cache between
/// identities.
#[derive(Clone, Debug)]
pub enum Auth {
    /// Public platform: Official Account / Mini Program (appid + secret)
    Mp { appid: String, secret: String },
    /// WeCom / Enterprise WeChat (corpid + corpsecret)
    Work {
        corp_id: String,
        corp_secret: String,
    },
}

impl Auth {
    /// Stable identity key for registries and storage namespaces.
    pub fn identity(&self) -> String {
        match self {
            Auth::Mp { appid, .. } => format!("mp:{}", appid),
            Auth::Work { corp_id, .. } => format!("work:{}", corp_id),
        }
    }
}

/// Successful token endpoint response body.
#[derive(Clone, Debug, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    /// Server-reported time-to-live in seconds (7200 in practice).
    pub expires_in: i64,
}

/// WeChat API error response body (`errcode != 0`).
#[derive(Clone, Debug, Deserialize)]
pub struct WxError {
    pub errcode: i64,
    pub errmsg: String,
}

/// Raw token response: either the success shape or the errcode shape.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum TokenRawResp {
    Ok(AccessToken),
    Err(WxError),
}

/// Unified error type.
///
/// Every variant is `Clone` because the token cache records the most recent
/// failure and replays it to each subsequent reader.
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("http error: {0}")]
    Http(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("weixin error {code}: {message}")]
    Wx { code: i64, message: String },

    #[error("unexpected token response (status {status}): {error}; body: {body}")]
    UnexpectedResponse {
        status: u16,
        error: String,
        body: String,
    },

    /// The endpoint claimed success but reported `expires_in <= 0`.
    #[error("token endpoint reported non-positive expires_in: {0}")]
    NonPositiveExpiry(i64),

    /// The cache has not completed its initial fetch yet.
    #[error("access token not initialized yet")]
    Uninitialized,

    /// The cached token passed its safety-margined expiry before the
    /// background refresh replaced it.
    #[error("cached access token expired; refresh pending")]
    Expired,

    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    #[cfg(feature = "redis")]
    #[error("token storage error: {0}")]
    Storage(String),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Low-level WeChat token endpoint client.
///
/// - Wraps `reqwest::Client` (reusable, stateless, no locking needed)
/// - Fetches access_token for either identity; no caching here
/// - Endpoint URLs are overridable for tests and proxies
#[derive(Clone, Debug)]
pub struct WxClient {
    http: reqwest::Client,
    mp_endpoint: String,
    work_endpoint: String,
}

impl Default for WxClient {
    fn default() -> Self {
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .expect("reqwest::Client build must succeed");
        Self {
            http,
            mp_endpoint: MP_TOKEN_ENDPOINT.to_string(),
            work_endpoint: WORK_TOKEN_ENDPOINT.to_string(),
        }
    }
}

impl WxClient {
    /// Use a custom `reqwest::Client` (connection pool, proxy, TLS config).
    pub fn with_http(http: reqwest::Client) -> Self {
        Self {
            http,
            ..Self::default()
        }
    }

    /// Override the request timeout (rebuilds the inner client).
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(timeout)
            .build()
            .expect("reqwest::Client build must succeed");
        Self { http, ..self }
    }

    /// Override the public-platform token endpoint URL.
    pub fn with_mp_endpoint(mut self, url: impl Into<String>) -> Self {
        self.mp_endpoint = url.into();
        self
    }

    /// Override the WeCom token endpoint URL.
    pub fn with_work_endpoint(mut self, url: impl Into<String>) -> Self {
        self.work_endpoint = url.into();
        self
    }

    /// Fetch a fresh access_token for the given identity.
    ///
    /// One GET, no retry, no caching. Secrets are appended as query
    /// parameters per the wire contract and never logged.
    #[instrument(level = "debug", skip(self, auth))]
    pub async fn get_access_token(&self, auth: &Auth) -> Result<AccessToken> {
        match auth {
            Auth::Mp { appid, secret } => {
                let mut url = Url::parse(&self.mp_endpoint)
                    .map_err(|e| Error::InvalidUrl(e.to_string()))?;
                {
                    let mut qp = url.query_pairs_mut();
                    qp.append_pair("grant_type", "client_credential");
                    qp.append_pair("appid", appid);
                    qp.append_pair("secret", secret);
                }
                if appid.starts_with("ww") {
                    warn!(
                        "appid starts with 'ww' (likely a WeCom corpid); use Auth::Work for enterprise credentials"
                    );
                }
                debug!(
                    "requesting public-platform access_token, appid hint: {}",
                    redact_id(appid)
                );
                self.request_token(url).await
            }
            Auth::Work {
                corp_id,
                corp_secret,
            } => {
                let mut url = Url::parse(&self.work_endpoint)
                    .map_err(|e| Error::InvalidUrl(e.to_string()))?;
                {
                    let mut qp = url.query_pairs_mut();
                    qp.append_pair("corpid", corp_id);
                    qp.append_pair("corpsecret", corp_secret);
                }
                if corp_id.starts_with("wx") {
                    warn!(
                        "corpid starts with 'wx' (likely a public-platform appid); use Auth::Mp for appid/secret credentials"
                    );
                }
                debug!(
                    "requesting WeCom access_token, corpid hint: {}",
                    redact_id(corp_id)
                );
                self.request_token(url).await
            }
        }
    }

    async fn request_token(&self, url: Url) -> Result<AccessToken> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;

        // Decode as the success/error union first; the endpoint returns 200
        // for both shapes.
        match serde_json::from_slice::<TokenRawResp>(&bytes) {
            Ok(TokenRawResp::Ok(ok)) => {
                if ok.expires_in <= 0 {
                    return Err(Error::NonPositiveExpiry(ok.expires_in));
                }
                Ok(ok)
            }
            Ok(TokenRawResp::Err(err)) => Err(Error::Wx {
                code: err.errcode,
                message: err.errmsg,
            }),
            Err(de_err) => {
                // Redact and truncate the body before surfacing it; it may
                // contain a token we failed to decode structurally.
                let mut body = String::from_utf8_lossy(&bytes).to_string();
                if let Ok(mut v) = serde_json::from_str::<serde_json::Value>(&body) {
                    if let Some(obj) = v.as_object_mut() {
                        if obj.get("access_token").is_some() {
                            obj.insert(
                                "access_token".to_string(),
                                serde_json::Value::String("[redacted]".into()),
                            );
                        }
                    }
                    if let Ok(s) = serde_json::to_string(&v) {
                        body = s;
                    }
                }
                if body.len() > 2048 {
                    body.truncate(2048);
                    body.push_str("...");
                }
                Err(Error::UnexpectedResponse {
                    status: status.as_u16(),
                    error: de_err.to_string(),
                    body,
                })
            }
        }
    }
}

/// Redact an identifier for logs: keep first 2 and last 2 chars where possible.
pub(crate) fn redact_id(id: &str) -> String {
    if id.len() <= 4 {
        format!("{}***", id)
    } else {
        format!("{}***{}", &id[..2], &id[id.len().saturating_sub(2)..])
    }
}
