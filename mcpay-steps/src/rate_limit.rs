//! Rate Limiter step (spec.md §4.4, §5): a token bucket keyed by upstream
//! hostname, one bucket per host, refilled and paced independently.
//!
//! Generalized from the teacher's `limit-count`/`rate-limiting` plugins
//! (`ando-plugins/src/traffic/limit_count.rs`, `rate_limiting.rs`), which key
//! fixed windows by client IP or route; here the key is the upstream host so
//! pacing protects the upstream, not the caller, matching spec.md's
//! invariant (spec.md §4.4, §5: "rate limiter is single-lane per host due to
//! `minDelayMs`, but multiple hosts proceed in parallel").

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use mcpay_core::{RateLimitConfig, TokenBucket};
use mcpay_pipeline::{Context, Step, StepOutcome};
use tokio::sync::Mutex;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url).ok()?.host_str().map(str::to_string)
}

/// Buckets persist for the process lifetime (spec.md §4.4), one
/// `tokio::sync::Mutex` per host so a host's refill/wait/consume sequence is
/// atomic and concurrent requests to the *same* host serialize through it,
/// while different hosts proceed independently (spec.md §5).
pub struct RateLimitStep {
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
    config: RateLimitConfig,
}

impl RateLimitStep {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    fn bucket_for(&self, host: &str) -> Arc<Mutex<TokenBucket>> {
        self.buckets
            .entry(host.to_string())
            .or_insert_with(|| {
                let now = now_ms();
                Arc::new(Mutex::new(TokenBucket {
                    tokens: self.config.capacity,
                    last_refill_ms: now,
                    last_request_ms: 0,
                }))
            })
            .clone()
    }

    /// Computes the pacing delay and applies it, returning the wait actually
    /// observed (used by tests; production callers only care about the
    /// side effect of the sleep).
    async fn pace(&self, host: &str) -> u64 {
        let bucket = self.bucket_for(host);
        let mut guard = bucket.lock().await;

        let now = now_ms();
        let elapsed_s = now.saturating_sub(guard.last_refill_ms) as f64 / 1000.0;
        guard.tokens = (guard.tokens + elapsed_s * self.config.refill_per_second).min(self.config.capacity);
        guard.last_refill_ms = now;

        let wait_for_token = if guard.tokens < 1.0 {
            (((1.0 - guard.tokens) / self.config.refill_per_second) * 1000.0).ceil().max(0.0) as u64
        } else {
            0
        };
        let since_last = now.saturating_sub(guard.last_request_ms);
        let wait_for_min_delay = self.config.min_delay_ms.saturating_sub(since_last);
        let wait = wait_for_token.max(if guard.last_request_ms == 0 { 0 } else { wait_for_min_delay });

        if wait > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(wait)).await;
        }

        guard.tokens -= 1.0;
        guard.last_request_ms = now_ms();
        wait
    }
}

#[async_trait]
impl Step for RateLimitStep {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn run(&self, ctx: &mut Context) -> StepOutcome {
        // The rate limiter's sleep never terminates the pipeline (spec.md §4.4).
        if let Some(host) = ctx.target_upstream.as_deref().and_then(host_of) {
            self.pace(&host).await;
        }
        StepOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_host_from_absolute_url() {
        assert_eq!(host_of("https://up.example/mcp/health"), Some("up.example".to_string()));
    }

    #[tokio::test]
    async fn first_request_on_a_fresh_bucket_does_not_wait() {
        let step = RateLimitStep::new(RateLimitConfig {
            capacity: 1.0,
            refill_per_second: 1.0,
            min_delay_ms: 1000,
        });
        let waited = step.pace("up.example").await;
        assert_eq!(waited, 0);
    }

    #[tokio::test]
    async fn second_immediate_request_waits_min_delay() {
        let step = RateLimitStep::new(RateLimitConfig {
            capacity: 5.0,
            refill_per_second: 1.0,
            min_delay_ms: 50,
        });
        step.pace("up.example").await;
        let start = std::time::Instant::now();
        step.pace("up.example").await;
        assert!(start.elapsed().as_millis() >= 40);
    }

    #[tokio::test]
    async fn distinct_hosts_do_not_share_a_bucket() {
        let step = RateLimitStep::new(RateLimitConfig {
            capacity: 1.0,
            refill_per_second: 0.1,
            min_delay_ms: 1000,
        });
        step.pace("a.example").await;
        let waited = step.pace("b.example").await;
        assert_eq!(waited, 0, "distinct host must get its own bucket");
    }
}
