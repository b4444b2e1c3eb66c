//! Transport-level retry policy for provider HTTP calls.
//!
//! This covers rate limits, 5xx responses and connection failures. Malformed
//! model output is retried one layer up, by the agent invoker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

pub const BASE_BACKOFF_MS: u64 = 200;
const MAX_BACKOFF_SHIFT: usize = 6;

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);
static JITTER_SEED: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Bounded exponential backoff with an optional total time budget.
pub struct HttpRetryPolicy {
    pub max_retries: usize,
    /// Total milliseconds retries may consume; `0` means unbounded.
    pub budget_ms: u64,
    pub jitter: bool,
}

impl HttpRetryPolicy {
    /// Status codes worth another attempt: timeouts, conflicts, throttling, 5xx.
    pub fn is_retryable_status(status: u16) -> bool {
        matches!(status, 408 | 409 | 425 | 429) || status >= 500
    }

    pub fn is_retryable_error(error: &reqwest::Error) -> bool {
        error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
    }

    pub fn backoff_ms(&self, attempt: usize) -> u64 {
        let base = BASE_BACKOFF_MS.saturating_mul(1_u64 << attempt.min(MAX_BACKOFF_SHIFT));
        if !self.jitter || base <= 1 {
            return base;
        }
        // Half-to-full jitter.
        let low = base / 2;
        let seed = JITTER_SEED.fetch_add(1, Ordering::Relaxed);
        let mixed = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(23);
        low.saturating_add(mixed % (base - low + 1))
    }

    /// Delay before retrying `attempt`, never shorter than a server `Retry-After`.
    pub fn delay_ms(&self, attempt: usize, retry_after_ms: Option<u64>) -> u64 {
        let backoff_ms = self.backoff_ms(attempt);
        retry_after_ms.map_or(backoff_ms, |floor| backoff_ms.max(floor))
    }

    /// Returns the delay to wait when another attempt is allowed.
    pub fn next_delay_ms(
        &self,
        attempt: usize,
        elapsed_ms: u64,
        retry_after_ms: Option<u64>,
    ) -> Option<u64> {
        if attempt >= self.max_retries {
            return None;
        }
        let delay_ms = self.delay_ms(attempt, retry_after_ms);
        if self.budget_ms > 0 && elapsed_ms.saturating_add(delay_ms) > self.budget_ms {
            tracing::debug!(
                attempt,
                elapsed_ms,
                delay_ms,
                budget_ms = self.budget_ms,
                "retry budget exhausted"
            );
            return None;
        }
        Some(delay_ms)
    }
}

/// Parses `Retry-After` as delta seconds or an HTTP date.
pub fn parse_retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds.saturating_mul(1_000));
    }
    let retry_at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let delay_ms = retry_at.signed_duration_since(Utc::now()).num_milliseconds();
    Some(u64::try_from(delay_ms).unwrap_or(0))
}

pub fn new_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let sequence = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("triage-{millis}-{sequence}")
}
