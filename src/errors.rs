//! Global WeChat/WeCom errcode helpers.
//!
//! Purpose
//! - Map well-known global errcode values to categories and hints
//! - Recommend whether to retry, or refresh the access_token
//!
//! Notes
//! - Always make program logic depend on `errcode` rather than `errmsg`.
//! - `errmsg` may change; treat it only as diagnostic text.
//! - `should_refresh_token` is the predicate the retry contract in
//!   [`crate::retry`] keys on: an invalid/expired credential reported by a
//!   business endpoint warrants exactly one refresh and one retry.

/// High-level classification for an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Success (errcode = 0)
    Success,
    /// Temporary/system busy (retryable with backoff)
    TemporarySystem,
    /// Credential problems: invalid secret, invalid or expired access_token
    Auth,
    /// Invalid parameter or malformed request
    InvalidParam,
    /// Quota or frequency limit exceeded
    Limit,
    /// API not authorized for this credential
    Unauthorized,
    /// Unknown/uncategorized
    Unknown,
}

/// Recommendation for retry strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAdvice {
    pub retry: bool,
    /// First backoff in milliseconds (if retry)
    pub initial_backoff_ms: Option<u64>,
    pub max_retries: Option<u8>,
    pub reason: &'static str,
}

impl RetryAdvice {
    pub const NO: RetryAdvice = RetryAdvice {
        retry: false,
        initial_backoff_ms: None,
        max_retries: None,
        reason: "do not retry",
    };
    pub const TRANSIENT_3: RetryAdvice = RetryAdvice {
        retry: true,
        initial_backoff_ms: Some(300),
        max_retries: Some(3),
        reason: "transient/system busy; retry with backoff",
    };
}

/// Classify a global errcode.
pub fn category_for(code: i64) -> ErrorCategory {
    match code {
        0 => ErrorCategory::Success,
        -1 => ErrorCategory::TemporarySystem,
        40001 | 40013 | 40014 | 40125 | 42001 => ErrorCategory::Auth,
        40002 | 41001 | 41002 | 43001 => ErrorCategory::InvalidParam,
        45009 | 45011 => ErrorCategory::Limit,
        48001 | 48002 | 50001 => ErrorCategory::Unauthorized,
        _ => ErrorCategory::Unknown,
    }
}

/// Whether a business response with this errcode means the cached
/// access_token is invalid or expired and should be refreshed once.
pub fn should_refresh_token(code: i64) -> bool {
    matches!(code, 40001 | 40014 | 42001)
}

/// Whether to retry, and how.
pub fn should_retry(code: i64) -> RetryAdvice {
    match code {
        -1 => RetryAdvice::TRANSIENT_3,
        // Credential problems: retrying without a refresh is pointless; the
        // refresh-once path handles these.
        40001 | 40013 | 40014 | 40125 | 42001 => RetryAdvice {
            retry: false,
            initial_backoff_ms: None,
            max_retries: None,
            reason: "invalid credential or token; refresh before retry",
        },
        // Parameter issues should be fixed, then resent.
        40002 | 41001 | 41002 | 43001 => RetryAdvice {
            retry: false,
            initial_backoff_ms: None,
            max_retries: None,
            reason: "invalid parameter; correct request and resend",
        },
        // Limits and authorization: do not retry blindly.
        45009 | 45011 | 48001 | 48002 | 50001 => RetryAdvice::NO,
        _ => RetryAdvice::NO,
    }
}

/// Friendly hint for a known errcode.
pub fn hint_for(code: i64) -> &'static str {
    match code {
        -1 => "System busy; retry with backoff (<=3 attempts).",
        0 => "Success.",
        40001 => "Invalid credential; verify the secret matches the appid/corpid, or refresh the access_token.",
        40002 => "Invalid grant_type; must be client_credential for the token endpoint.",
        40013 => "Invalid appid; verify the identifier and that it matches the secret.",
        40014 => "Invalid access_token; refresh the token and retry once.",
        40125 => "Invalid secret; re-check the credential pair in the admin console.",
        41001 => "access_token missing from the request; append it as a query parameter.",
        41002 => "appid missing from the request.",
        42001 => "access_token expired; refresh the token and retry once.",
        43001 => "GET request required for this endpoint.",
        45009 => "API call frequency limit reached; slow down or raise quota.",
        45011 => "API minute-level quota reached; retry later.",
        48001 => "API unauthorized for this credential; check account permissions.",
        48002 => "API forbidden by user; the account has not granted this capability.",
        50001 => "No permission to access this API for the current user.",
        _ => "Unknown code; refer to official docs and logs for details.",
    }
}

/// A compact explanation for an errcode.
#[derive(Debug, Clone)]
pub struct ErrorHelp {
    pub code: i64,
    pub category: ErrorCategory,
    pub summary: &'static str,
    pub hint: &'static str,
    pub retry: RetryAdvice,
    /// Whether to refresh/reacquire access_token
    pub refresh_token: bool,
}

/// Build a structured help object for a given errcode.
pub fn lookup(code: i64) -> ErrorHelp {
    let summary = match code {
        -1 => "System busy",
        0 => "Success",
        40001 => "Invalid credential",
        40002 => "Invalid grant_type",
        40013 => "Invalid appid",
        40014 => "Invalid access_token",
        40125 => "Invalid secret",
        41001 => "access_token missing",
        41002 => "appid missing",
        42001 => "access_token expired",
        43001 => "GET required",
        45009 => "API frequency limit",
        45011 => "API minute quota",
        48001 => "API unauthorized",
        48002 => "API forbidden by user",
        50001 => "No permission for API",
        _ => "Unknown error",
    };
    ErrorHelp {
        code,
        category: category_for(code),
        summary,
        hint: hint_for(code),
        retry: should_retry(code),
        refresh_token: should_refresh_token(code),
    }
}

/// Produce a concise, human-readable explanation string.
pub fn explain(errcode: i64, errmsg: &str) -> String {
    let help = lookup(errcode);
    let mut parts = vec![
        format!("errcode={} ({:?})", help.code, help.category),
        help.summary.to_string(),
        format!("hint: {}", help.hint),
    ];

    if help.retry.retry {
        let mut retry_line = String::from("retry: yes");
        if let Some(ms) = help.retry.initial_backoff_ms {
            retry_line.push_str(&format!(", initial_backoff_ms={}", ms));
        }
        if let Some(n) = help.retry.max_retries {
            retry_line.push_str(&format!(", max_retries={}", n));
        }
        retry_line.push_str(&format!(" ({})", help.retry.reason));
        parts.push(retry_line);
    } else {
        parts.push(format!("retry: no ({})", help.retry.reason));
    }

    parts.push(format!(
        "refresh_token: {}",
        if help.refresh_token { "yes" } else { "no" }
    ));

    if !errmsg.is_empty() {
        parts.push(format!("errmsg: {}", errmsg));
    }

    parts.join(" | ")
}
