use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::StreamError;

/// Custom retryability classification, consulted before the built-in rules.
pub type RetryPredicate = Arc<dyn Fn(&StreamError) -> bool + Send + Sync>;

/// Exponential retry policy for opening adapter streams.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct RetryConfig {
    /// Additional attempts after the first execution.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial backoff before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Exponential multiplier per retry step.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound for computed backoff.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Substrings matched case-insensitively against the error text.
    #[serde(default = "default_retryable_patterns")]
    pub retryable_patterns: Vec<String>,
    /// HTTP status codes treated as retryable.
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: Vec<u16>,
    /// When set, a `true` verdict short-circuits the built-in rules.
    #[serde(skip)]
    pub custom_predicate: Option<RetryPredicate>,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_retryable_patterns() -> Vec<String> {
    [
        "timeout",
        "timed out",
        "connection",
        "network",
        "reset",
        "temporarily unavailable",
        "overloaded",
        "rate limit",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

fn default_retryable_status_codes() -> Vec<u16> {
    vec![408, 429, 500, 502, 503, 504]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            retryable_patterns: default_retryable_patterns(),
            retryable_status_codes: default_retryable_status_codes(),
            custom_predicate: None,
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("retryable_patterns", &self.retryable_patterns)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field("custom_predicate", &self.custom_predicate.is_some())
            .finish()
    }
}

impl RetryConfig {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub fn backoff_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.backoff_multiplier = backoff_multiplier;
        self
    }

    pub fn max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms.max(1);
        self
    }

    pub fn retryable_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.retryable_patterns.push(pattern.into());
        self
    }

    pub fn retryable_status_code(mut self, status: u16) -> Self {
        self.retryable_status_codes.push(status);
        self
    }

    pub fn custom_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&StreamError) -> bool + Send + Sync + 'static,
    {
        self.custom_predicate = Some(Arc::new(predicate));
        self
    }

    /// True while another retry attempt is allowed after `attempts_done`
    /// failures.
    pub fn can_retry(&self, attempts_done: u32) -> bool {
        attempts_done < self.max_retries
    }

    /// `min(base * multiplier^attempt, max)`, attempt 0-indexed.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(attempt as i32);
        let raw = (self.base_delay_ms as f64 * exp).round() as u64;
        Duration::from_millis(raw.min(self.max_delay_ms.max(1)))
    }

    /// Classifies a failure. Cancellation is never retryable; otherwise the
    /// custom predicate is consulted first, then the status-code set, then
    /// the message patterns.
    pub fn is_retryable(&self, error: &StreamError) -> bool {
        if error.is_cancelled() {
            return false;
        }
        if let Some(predicate) = &self.custom_predicate
            && predicate(error)
        {
            return true;
        }
        if let Some(status) = error.status_code()
            && self.retryable_status_codes.contains(&status)
        {
            return true;
        }
        let text = error.to_string().to_lowercase();
        self.retryable_patterns
            .iter()
            .any(|pattern| text.contains(&pattern.to_lowercase()))
    }
}

/// Runs `operation` up to `max_retries + 1` times with exponential backoff
/// between attempts.
///
/// The last error is re-raised unchanged once attempts are exhausted or the
/// failure is classified non-retryable. Cancellation is never retried, and
/// the backoff sleep itself is raced against the token so a cancelled caller
/// does not wait out the delay.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, StreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StreamError>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if error.is_cancelled() || !config.is_retryable(&error) || !config.can_retry(attempt)
                {
                    return Err(error);
                }
                let delay = config.backoff_delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, %error, "retrying after backoff");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(StreamError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig::default()
            .max_retries(max_retries)
            .base_delay_ms(2)
            .max_delay_ms(8)
    }

    #[test]
    fn backoff_grows_with_cap() {
        let config = RetryConfig::default()
            .base_delay_ms(100)
            .backoff_multiplier(2.0)
            .max_delay_ms(250);
        assert_eq!(config.backoff_delay(0).as_millis(), 100);
        assert_eq!(config.backoff_delay(1).as_millis(), 200);
        assert_eq!(config.backoff_delay(2).as_millis(), 250);
        assert_eq!(config.backoff_delay(3).as_millis(), 250);
    }

    #[test]
    fn backoff_is_monotone_until_cap() {
        let config = RetryConfig::default()
            .base_delay_ms(50)
            .backoff_multiplier(1.7)
            .max_delay_ms(1_000);
        let mut last = Duration::ZERO;
        for attempt in 0..12 {
            let delay = config.backoff_delay(attempt);
            assert!(delay >= last);
            assert!(delay.as_millis() <= 1_000);
            last = delay;
        }
        assert_eq!(last.as_millis(), 1_000);
    }

    #[test]
    fn status_codes_and_patterns_classify() {
        let config = RetryConfig::default();
        assert!(config.is_retryable(&StreamError::provider("p", "server blew up", Some(503))));
        assert!(!config.is_retryable(&StreamError::provider("p", "bad request", Some(404))));
        assert!(config.is_retryable(&StreamError::transport("p", "Connection reset by peer")));
        assert!(!config.is_retryable(&StreamError::protocol("malformed frame")));
        assert!(!config.is_retryable(&StreamError::Cancelled));
    }

    #[test]
    fn custom_predicate_extends_classification() {
        let config = RetryConfig::default()
            .custom_predicate(|error| error.to_string().contains("weird"));
        assert!(config.is_retryable(&StreamError::provider("p", "weird glitch", None)));
        assert!(!config.is_retryable(&StreamError::provider("p", "normal failure", None)));
    }

    #[tokio::test]
    async fn fails_twice_then_succeeds_within_budget() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(3), &CancellationToken::new(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n <= 2 {
                    Err(StreamError::transport("fake", format!("connection reset {n}")))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_reraise_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast(2), &CancellationToken::new(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(StreamError::transport("fake", format!("connection reset {n}"))) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            result.unwrap_err(),
            StreamError::transport("fake", "connection reset 3")
        );
    }

    #[tokio::test]
    async fn non_retryable_error_fails_on_first_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast(5), &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StreamError::protocol("malformed frame")) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result.unwrap_err(), StreamError::Protocol { .. }));
    }

    #[tokio::test]
    async fn cancellation_is_never_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast(5), &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StreamError::Cancelled) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err(), StreamError::Cancelled);
    }

    #[tokio::test]
    async fn cancelled_token_skips_the_operation() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast(5), &token, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.unwrap_err(), StreamError::Cancelled);
    }
}
