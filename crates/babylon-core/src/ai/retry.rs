//! Transient-error retry for provider calls.
//!
//! Only rate limits (429), server errors (5xx), timeouts and reset
//! connections are retried. Everything else is fatal for the calling agent.

use std::time::Duration;

use crate::ai::provider::{Provider, ProviderError};
use crate::ai::types::{ChatRequest, ChatResponse};
use crate::cancellation::CancellationHandle;

/// Backoff schedule: up to 3 retries after the initial attempt.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Whether an error message looks like a transient provider failure.
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
        || lower.contains("overloaded")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection reset")
        || lower.contains("reset by peer")
}

/// Call the provider, retrying transient errors with 1s/2s/4s backoff.
///
/// Cancellation short-circuits the backoff; an in-flight call that fails
/// after cancellation is reported as cancelled rather than retried.
pub async fn call_with_retry(
    provider: &dyn Provider,
    request: &ChatRequest,
    cancellation: &CancellationHandle,
) -> Result<ChatResponse, ProviderError> {
    let mut attempt = 0usize;
    loop {
        if cancellation.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let result = tokio::select! {
            result = provider.chat(request) => result,
            _ = cancellation.cancelled() => Err(ProviderError::Cancelled),
        };

        match result {
            Ok(response) => return Ok(response),
            Err(err) => {
                let retryable = err.is_retryable() && !cancellation.is_cancelled();
                if !retryable || attempt >= RETRY_DELAYS.len() {
                    return Err(err);
                }
                let delay = RETRY_DELAYS[attempt];
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient provider error, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancellation.cancelled() => return Err(ProviderError::Cancelled),
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockOutcome, ScriptedProvider};

    #[test]
    fn classifies_transient_messages() {
        assert!(is_retryable_message("HTTP 429 Too Many Requests"));
        assert!(is_retryable_message("upstream 503 service unavailable"));
        assert!(is_retryable_message("request timed out"));
        assert!(is_retryable_message("connection reset by peer"));
        assert!(!is_retryable_message("invalid api key"));
        assert!(!is_retryable_message("HTTP 400 bad request"));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let provider = ScriptedProvider::new(vec![
            MockOutcome::Error(ProviderError::Http {
                status: 429,
                message: "rate limit".to_string(),
            }),
            MockOutcome::Error(ProviderError::Http {
                status: 503,
                message: "overloaded".to_string(),
            }),
            MockOutcome::Response(ChatResponse {
                text: "ok".to_string(),
                ..Default::default()
            }),
        ]);
        let cancellation = CancellationHandle::new();
        let request = test_request();

        let response = call_with_retry(&provider, &request, &cancellation)
            .await
            .expect("retry should recover");
        assert_eq!(response.text, "ok");
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let provider = ScriptedProvider::new(vec![MockOutcome::Error(ProviderError::Http {
            status: 401,
            message: "invalid api key".to_string(),
        })]);
        let cancellation = CancellationHandle::new();
        let request = test_request();

        let err = call_with_retry(&provider, &request, &cancellation)
            .await
            .expect_err("auth error must be fatal");
        assert!(!err.is_retryable());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_retries() {
        let provider = ScriptedProvider::new(vec![MockOutcome::Error(ProviderError::Http {
            status: 503,
            message: "overloaded".to_string(),
        })]);
        let cancellation = CancellationHandle::new();
        cancellation.cancel();
        let request = test_request();

        let err = call_with_retry(&provider, &request, &cancellation)
            .await
            .expect_err("cancelled run must fail");
        assert!(matches!(err, ProviderError::Cancelled));
    }

    fn test_request() -> ChatRequest {
        ChatRequest {
            model: "test-model".to_string(),
            system_prompt: String::new(),
            messages: Vec::new(),
            tools: Vec::new(),
            temperature: 0.0,
            max_tokens: 16,
        }
    }
}
