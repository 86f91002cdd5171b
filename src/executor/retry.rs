//! Turn-level retry policy.
//!
//! Epistemic foundation:
//! - I^B: A call may fail in transport, or succeed with an error envelope as
//!   its text; both count as a failed attempt
//! - K_i: At most `MAX_ATTEMPTS` attempts per turn, then the turn degrades

use crate::client::ChatReply;
use crate::models::{Config, Result, TurnOutput};
use regex::Regex;
use std::future::Future;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Attempts per turn before the turn degrades to a failure marker.
pub const MAX_ATTEMPTS: u32 = 5;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

static ERROR_ENVELOPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Error\s+code:\s+\d{3}\s+-").expect("envelope pattern is valid"));

/// Whether reply text is a backend error reported as a successful answer.
pub fn is_error_envelope(text: &str) -> bool {
    ERROR_ENVELOPE.is_match(text)
}

/// Outcome of one attempt.
#[derive(Debug)]
pub enum Attempt {
    Reply(ChatReply, Duration),
    Failed(String),
}

/// Retry schedule shared by the remote adaptors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles per attempt
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(backoff: Duration) -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            backoff,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(Duration::from_millis(config.retry_backoff_ms))
    }

    /// No delay between attempts.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Delay before attempt `attempt + 1`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Run one attempt and classify it.
    pub async fn attempt<Fut>(call: Fut) -> Attempt
    where
        Fut: Future<Output = Result<ChatReply>>,
    {
        let start = Instant::now();
        match call.await {
            Ok(reply) if is_error_envelope(&reply.text) => Attempt::Failed(reply.text),
            Ok(reply) => Attempt::Reply(reply, start.elapsed()),
            Err(e) => Attempt::Failed(e.to_string()),
        }
    }

    /// Execute one turn, retrying failed attempts.
    ///
    /// Never fails: after the last attempt the error text becomes the
    /// response and elapsed time is the failure sentinel.
    pub async fn execute<F, Fut>(&self, record: &str, mut call: F) -> TurnOutput
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ChatReply>>,
    {
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match Self::attempt(call()).await {
                Attempt::Reply(reply, elapsed) => {
                    debug!(record, attempt, "Turn completed");
                    return reply.into_output(elapsed);
                }
                Attempt::Failed(error) => {
                    warn!(
                        record,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %truncate(&error, 80),
                        "Turn attempt failed"
                    );
                    last_error = error;
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.delay(attempt)).await;
            }
        }

        warn!(record, "Max retries reached, recording failed turn");
        TurnOutput::failed(last_error)
    }
}

/// Prefix of `s` of at most `max` chars, for log lines.
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
