//! HTTP client for the inference service, wrapped in rate-limit-aware retry.
//!
//! Only HTTP 429 responses are retried: the service tells us when to come
//! back, so waiting is worthwhile. Every other failure (network fault, auth
//! error, server error) is surfaced to the caller immediately as a
//! transport fault.

use super::agentic::{ChatBackend, ChatRequest, ChatResponse};
use anyhow::Result;
use mend_core::util::clip;
use regex::Regex;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Rate limit retry configuration
pub const MAX_RETRIES: u32 = 3;
pub const REQUEST_TIMEOUT_SECS: u64 = 180;

const MAX_ERROR_CONTENT_LEN: usize = 200;

/// Extract a suggested wait from a rate-limit error payload. Services phrase
/// this as "Please try again in 630ms" or "try again in 2s".
pub fn parse_retry_hint(text: &str) -> Option<Duration> {
    let re = Regex::new(r"try again in (\d+(?:\.\d+)?)\s*(ms|s)\b").ok()?;
    let lower = text.to_lowercase();
    let caps = re.captures(&lower)?;
    let amount: f64 = caps.get(1)?.as_str().parse().ok()?;
    let seconds = match caps.get(2)?.as_str() {
        "ms" => amount / 1000.0,
        _ => amount,
    };
    if seconds <= 0.0 || seconds > 300.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

/// Fallback wait when the service gives no hint: exponential backoff with a
/// linear jitter term.
pub fn backoff_delay(retry_count: u32) -> Duration {
    let base_ms = 1_000u64.saturating_mul(1u64 << retry_count.min(10));
    let jitter_ms = u64::from(retry_count).saturating_mul(500);
    Duration::from_millis(base_ms + jitter_ms)
}

/// Create a configured HTTP client for inference requests
pub fn create_http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))
}

/// Pull the inner error message out of an error body, if it is JSON-shaped.
fn error_message_from_body(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| {
            value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| text.to_string())
}

pub(crate) async fn send_with_retry(
    client: &reqwest::Client,
    api_url: &str,
    api_key: &str,
    request: &ChatRequest,
) -> Result<ChatResponse> {
    let mut retry_count = 0;

    loop {
        let response = client
            .post(api_url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", api_key))
            .json(request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Inference request failed: {}", e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read inference response: {}", e))?;

        if status.as_u16() == 429 {
            if retry_count >= MAX_RETRIES {
                return Err(anyhow::anyhow!(
                    "Rate limited after {} retries: {}",
                    retry_count,
                    clip(&error_message_from_body(&text), MAX_ERROR_CONTENT_LEN)
                ));
            }
            retry_count += 1;
            let wait = parse_retry_hint(&error_message_from_body(&text))
                .unwrap_or_else(|| backoff_delay(retry_count));
            eprintln!(
                "  Rate limit hit. Waiting {:.1}s before retry {}/{}",
                wait.as_secs_f64(),
                retry_count,
                MAX_RETRIES
            );
            tokio::time::sleep(wait).await;
            continue;
        }

        if !status.is_success() {
            return Err(anyhow::anyhow!(
                "API error {}: {}",
                status,
                clip(&error_message_from_body(&text), MAX_ERROR_CONTENT_LEN)
            ));
        }

        return serde_json::from_str(&text).map_err(|e| {
            anyhow::anyhow!(
                "Failed to parse inference response: {}\n{}",
                e,
                clip(&text, MAX_ERROR_CONTENT_LEN)
            )
        });
    }
}

/// The production [`ChatBackend`]: one bounded HTTP call per turn, with the
/// retry policy above.
pub struct HttpBackend {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl HttpBackend {
    pub fn new(api_url: String, api_key: String) -> Result<Self> {
        Ok(Self {
            client: create_http_client(REQUEST_TIMEOUT_SECS)?,
            api_url,
            api_key,
        })
    }
}

impl ChatBackend for HttpBackend {
    fn send<'a>(
        &'a self,
        request: &'a ChatRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ChatResponse>> + Send + 'a>> {
        Box::pin(send_with_retry(
            &self.client,
            &self.api_url,
            &self.api_key,
            request,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_millisecond_hint() {
        let wait = parse_retry_hint("Rate limit reached. Please try again in 630ms.").unwrap();
        assert!((wait.as_secs_f64() - 0.63).abs() < 1e-9);
    }

    #[test]
    fn parses_second_hint() {
        let wait = parse_retry_hint("Please try again in 2s").unwrap();
        assert!((wait.as_secs_f64() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn parses_fractional_second_hint() {
        let wait = parse_retry_hint("try again in 1.5s please").unwrap();
        assert!((wait.as_secs_f64() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn ignores_hintless_and_absurd_payloads() {
        assert!(parse_retry_hint("server exploded").is_none());
        assert!(parse_retry_hint("try again in 100000s").is_none());
    }

    #[test]
    fn backoff_grows_with_retry_count() {
        assert!(backoff_delay(1) < backoff_delay(2));
        assert!(backoff_delay(2) < backoff_delay(3));
        assert_eq!(backoff_delay(1), Duration::from_millis(2_500));
    }

    #[test]
    fn extracts_nested_error_message() {
        let body = r#"{"error": {"message": "Please try again in 630ms", "code": 429}}"#;
        assert_eq!(error_message_from_body(body), "Please try again in 630ms");
        assert_eq!(error_message_from_body("plain text"), "plain text");
    }
}
