//! Shared HTTP plumbing for the reqwest-based providers.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};

use crate::error::LlmError;

/// Upper bound on one provider round-trip; the router's per-backend timeout
/// usually fires first.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

pub(crate) fn build_http_client() -> Client {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

pub(crate) fn transport_error(provider: &str, e: reqwest::Error) -> LlmError {
    LlmError::RequestFailed {
        provider: provider.to_string(),
        reason: e.to_string(),
    }
}

/// Turn a non-success status into the matching `LlmError`.
pub(crate) async fn check_status(provider: &str, response: Response) -> Result<Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(LlmError::AuthFailed {
            provider: provider.to_string(),
        }),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            Err(LlmError::RateLimited {
                provider: provider.to_string(),
                retry_after,
            })
        }
        _ => {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(500).collect();
            Err(LlmError::RequestFailed {
                provider: provider.to_string(),
                reason: format!("HTTP {status}: {snippet}"),
            })
        }
    }
}
