use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;

use crate::error::LlmError;

const BASE_BACKOFF_MS: u64 = 500;

/// Parse the `Retry-After` header value as seconds, falling back to exponential backoff.
pub(crate) fn retry_delay(response: &reqwest::Response, attempt: u32) -> Duration {
    if let Some(val) = response.headers().get("retry-after")
        && let Ok(s) = val.to_str()
        && let Ok(secs) = s.parse::<u64>()
    {
        return Duration::from_secs(secs);
    }
    backoff(attempt)
}

pub(crate) fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(BASE_BACKOFF_MS.saturating_mul(1 << attempt.min(10)))
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::BAD_GATEWAY
        || status == StatusCode::SERVICE_UNAVAILABLE
        || status == StatusCode::GATEWAY_TIMEOUT
}

/// Send an HTTP request, retrying up to `max_retries` times on 429 and transient 5xx responses.
///
/// `f` must return a `reqwest::Response`. The wait between attempts honours `Retry-After`
/// and otherwise doubles each time. The sleep is a tokio timer, so the worker thread is never
/// blocked.
///
/// # Errors
///
/// Returns `LlmError::RateLimited` if all attempts hit 429, `LlmError::Api` if the last
/// attempt failed with a server error, or the underlying `reqwest::Error` wrapped as
/// `LlmError::Http` for transport failures.
pub(crate) async fn send_with_retry<F, Fut>(
    provider_name: &'static str,
    max_retries: u32,
    mut f: F,
) -> Result<reqwest::Response, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    for attempt in 0..=max_retries {
        let response = f().await.map_err(LlmError::Http)?;
        let status = response.status();

        if is_retryable_status(status) {
            if attempt == max_retries {
                return Err(if status == StatusCode::TOO_MANY_REQUESTS {
                    LlmError::RateLimited
                } else {
                    LlmError::Api {
                        provider: provider_name,
                        status: status.as_u16(),
                    }
                });
            }
            let delay = retry_delay(&response, attempt);
            tracing::warn!(
                provider = provider_name,
                %status,
                "retrying in {}ms ({}/{})",
                delay.as_millis(),
                attempt + 1,
                max_retries
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        return Ok(response);
    }

    Err(LlmError::RateLimited)
}
