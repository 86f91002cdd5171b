//! Adaptive rate limiter shared by the hosted HTTP clients.
//!
//! Epistemic foundation:
//! - K_i: Hosted APIs return rate limit headers on each response
//! - K_i: 429 responses require backoff
//! - I^B: Exact limits unknowable until headers received

use dashmap::DashMap;
use reqwest::header::HeaderMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Rate limit state for one model/deployment.
#[derive(Debug, Default)]
pub struct RateLimitState {
    pub remaining_requests: Option<u32>,
    pub remaining_tokens: Option<u32>,
    pub reset_requests_at: Option<Instant>,
    pub reset_tokens_at: Option<Instant>,
    /// Consecutive 429 responses
    pub consecutive_429s: u32,
    pub backoff_until: Option<Instant>,
}

impl RateLimitState {
    /// Time to wait before the next request may go out.
    pub fn wait_time(&self, now: Instant) -> Duration {
        let until = |at: Option<Instant>| at.filter(|&t| t > now).map(|t| t - now);

        let mut wait = until(self.backoff_until).unwrap_or_default();
        if self.remaining_requests == Some(0) {
            wait = wait.max(until(self.reset_requests_at).unwrap_or_default());
        }
        if self.remaining_tokens == Some(0) {
            wait = wait.max(until(self.reset_tokens_at).unwrap_or_default());
        }
        wait
    }

    /// Exponential backoff, capped at 60s.
    pub fn record_429(&mut self, retry_after: Option<f64>) {
        self.consecutive_429s += 1;
        let backoff_secs = retry_after
            .unwrap_or_else(|| 2.0_f64.powi(self.consecutive_429s as i32))
            .min(60.0);
        self.backoff_until = Some(Instant::now() + Duration::from_secs_f64(backoff_secs));
        warn!(
            consecutive_429s = self.consecutive_429s,
            backoff_secs, "Rate limited (429), backing off"
        );
    }

    pub fn record_success(&mut self) {
        if self.consecutive_429s > 0 {
            self.consecutive_429s = 0;
            self.backoff_until = None;
        }
    }

    /// Update state from OpenAI-style and Anthropic-style rate limit headers.
    pub fn update_from_headers(&mut self, headers: &HeaderMap) {
        let now = Instant::now();
        let header = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .find_map(|k| headers.get(*k)?.to_str().ok().map(str::to_string))
        };

        if let Some(v) = header(&[
            "x-ratelimit-remaining-requests",
            "anthropic-ratelimit-requests-remaining",
        ]) {
            self.remaining_requests = v.parse().ok();
        }
        if let Some(v) = header(&[
            "x-ratelimit-remaining-tokens",
            "anthropic-ratelimit-tokens-remaining",
        ]) {
            self.remaining_tokens = v.parse().ok();
        }
        if let Some(secs) = header(&["x-ratelimit-reset-requests"]).and_then(|s| parse_reset(&s)) {
            self.reset_requests_at = Some(now + Duration::from_secs_f64(secs));
        }
        if let Some(secs) = header(&["x-ratelimit-reset-tokens"]).and_then(|s| parse_reset(&s)) {
            self.reset_tokens_at = Some(now + Duration::from_secs_f64(secs));
        }
    }
}

/// Parse a reset value: plain seconds ("1.5") or a suffixed duration ("20ms", "6s").
fn parse_reset(value: &str) -> Option<f64> {
    let value = value.trim();
    if let Some(ms) = value.strip_suffix("ms") {
        return ms.parse::<f64>().ok().map(|v| v / 1000.0);
    }
    value.strip_suffix('s').unwrap_or(value).parse().ok()
}

/// Per-model adaptive rate limiter.
#[derive(Debug, Default)]
pub struct RateLimiter {
    states: DashMap<String, RateLimitState>,
    total_requests: AtomicU64,
    total_429s: AtomicU64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep until the model's limits allow another request.
    pub async fn wait_if_needed(&self, model: &str) -> Duration {
        let wait = {
            let state = self.states.entry(model.to_string()).or_default();
            state.wait_time(Instant::now())
        };

        if !wait.is_zero() {
            debug!(model, wait_ms = wait.as_millis() as u64, "Waiting for rate limit");
            tokio::time::sleep(wait).await;
        }

        wait
    }

    /// Record a response status and its headers.
    pub fn record_response(&self, model: &str, status: u16, headers: &HeaderMap) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let mut state = self.states.entry(model.to_string()).or_default();
        state.update_from_headers(headers);

        if status == 429 {
            self.total_429s.fetch_add(1, Ordering::Relaxed);
            let retry_after = headers
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<f64>().ok());
            state.record_429(retry_after);
        } else if status < 400 {
            state.record_success();
        }
    }

    /// (total requests, total 429s)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.total_requests.load(Ordering::Relaxed),
            self.total_429s.load(Ordering::Relaxed),
        )
    }
}
