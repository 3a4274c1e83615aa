//! Shared HTTP plumbing for provider APIs: 30 s deadlines, exponential
//! backoff on 5xx, `Retry-After`-aware handling of 429, no retries on
//! other 4xx.

use std::time::{Duration, Instant};

use super::ProviderError;

const TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;

pub(crate) fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(TIMEOUT)
        .connect_timeout(TIMEOUT)
        .build()
        .expect("reqwest client builds")
}

pub(crate) async fn send_with_retry<F>(
    provider: &'static str,
    endpoint: &'static str,
    build: F,
) -> Result<reqwest::Response, ProviderError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut attempt: u32 = 0;
    loop {
        let started = Instant::now();
        let result = build().send().await;
        metrics::histogram!(
            "payment_provider_http_seconds",
            "provider" => provider,
            "endpoint" => endpoint
        )
        .record(started.elapsed().as_secs_f64());

        let last_attempt = attempt + 1 >= MAX_ATTEMPTS;
        match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                let retryable = status.as_u16() == 429 || status.is_server_error();
                if !retryable || last_attempt {
                    return Err(ProviderError::Api {
                        status: status.as_u16(),
                        body: response.text().await.unwrap_or_default(),
                    });
                }
                let delay = retry_after(&response).unwrap_or_else(|| backoff(attempt));
                tracing::warn!(provider, endpoint, %status, attempt, "provider request retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                if last_attempt {
                    return Err(err.into());
                }
                tracing::warn!(provider, endpoint, error = %err, attempt, "provider request retrying");
                tokio::time::sleep(backoff(attempt)).await;
            }
        }
        attempt += 1;
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt)
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
