//! Per-model rate limiting and daily budget enforcement.
//!
//! Every metered model call is gated here before it leaves the process:
//! a classic token bucket (continuous refill up to capacity) combined
//! with a bounded concurrency-slot pool and a hard daily USD budget.
//! Token starvation is waited out, bounded by the caller's cancellation
//! token; budget exhaustion is surfaced immediately and never retried
//! internally.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Fallback wait while parked on a concurrency slot, in case a release
/// notification is missed between the lock drop and the await.
const SLOT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Static limits for one model identifier.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ModelLimits {
    /// Maximum tokens the bucket can hold.
    pub capacity: f64,
    /// Tokens refilled per minute (continuous, `refill_per_minute/60` per
    /// second).
    pub refill_per_minute: f64,
    /// Maximum concurrent in-flight calls.
    pub concurrency_slots: usize,
    /// Hard daily spend ceiling in USD.
    pub daily_budget_usd: f64,
    /// Price used to estimate the cost of an acquire before the call is
    /// made; actual spend arrives later via [`RateLimiter::record_spend`].
    pub usd_per_1k_tokens: f64,
}

impl Default for ModelLimits {
    fn default() -> Self {
        Self {
            capacity: 100_000.0,
            refill_per_minute: 60_000.0,
            concurrency_slots: 4,
            daily_budget_usd: 50.0,
            usd_per_1k_tokens: 0.01,
        }
    }
}

/// Errors surfaced by the limiter.
#[derive(Debug, Error)]
pub enum LimiterError {
    /// No bucket configured for this model identifier.
    #[error("no rate limit configured for model '{model}'")]
    UnknownModel { model: String },

    /// Granting the request would exceed the daily budget. Surfaced
    /// immediately, without waiting; the agent decides whether to wait
    /// for the day boundary or escalate.
    #[error(
        "daily budget exceeded for model '{model}': request estimated at ${requested_usd:.2}, ${remaining_usd:.2} remaining"
    )]
    BudgetExceeded {
        model: String,
        requested_usd: f64,
        remaining_usd: f64,
    },

    /// The request asks for more tokens than the bucket can ever hold.
    #[error("request for {requested} tokens exceeds bucket capacity {capacity} for model '{model}'")]
    Oversized {
        model: String,
        requested: u64,
        capacity: f64,
    },

    /// The caller's deadline or cancellation fired while waiting for
    /// tokens or a slot.
    #[error("acquire cancelled while waiting for model '{model}'")]
    Cancelled { model: String },
}

/// Read-only snapshot for observability.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterStatus {
    /// Tokens currently available in the bucket.
    pub tokens_available: f64,
    /// USD remaining under today's budget.
    pub budget_remaining: f64,
    /// Concurrency slots currently reserved.
    pub active_connections: usize,
}

/// Mutable bucket state, guarded by a single lock so a withdrawal is
/// atomic: no two callers can observe the same tokens as available.
#[derive(Debug)]
struct BucketState {
    limits: ModelLimits,
    tokens: f64,
    last_refill: Instant,
    active: usize,
    spent_usd_today: f64,
    day: NaiveDate,
}

impl BucketState {
    fn new(limits: ModelLimits) -> Self {
        Self {
            tokens: limits.capacity,
            limits,
            last_refill: Instant::now(),
            active: 0,
            spent_usd_today: 0.0,
            day: Utc::now().date_naive(),
        }
    }

    /// Lazily credit tokens for the time elapsed since the last refill,
    /// capped at capacity.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let credit = elapsed.as_secs_f64() * self.limits.refill_per_minute / 60.0;
        if credit > 0.0 {
            self.tokens = (self.tokens + credit).min(self.limits.capacity);
            self.last_refill = now;
        }
    }

    /// Reset the spend ledger when the UTC day rolls over.
    fn roll_day(&mut self, today: NaiveDate) {
        if today != self.day {
            log::info!(
                "budget ledger reset at day boundary: {} -> {} (spent ${:.2})",
                self.day,
                today,
                self.spent_usd_today
            );
            self.day = today;
            self.spent_usd_today = 0.0;
        }
    }

    fn budget_remaining(&self) -> f64 {
        (self.limits.daily_budget_usd - self.spent_usd_today).max(0.0)
    }

    /// Seconds until `needed` tokens will have refilled.
    fn deficit_wait(&self, needed: f64) -> Duration {
        let deficit = (needed - self.tokens).max(0.0);
        let per_second = self.limits.refill_per_minute / 60.0;
        if per_second <= 0.0 {
            return SLOT_POLL_INTERVAL;
        }
        Duration::from_secs_f64(deficit / per_second).max(Duration::from_millis(10))
    }
}

struct ModelBucket {
    state: Mutex<BucketState>,
    /// Signalled on release so slot waiters wake promptly.
    released: Notify,
}

/// Per-model token bucket plus running daily spend.
///
/// Shared across all agents; buckets are internally guarded, so the
/// limiter itself hands out only `&self` operations.
pub struct RateLimiter {
    buckets: DashMap<String, Arc<ModelBucket>>,
}

impl RateLimiter {
    /// Build a limiter from configured model limits.
    pub fn new(models: impl IntoIterator<Item = (String, ModelLimits)>) -> Self {
        let limiter = Self {
            buckets: DashMap::new(),
        };
        for (model, limits) in models {
            limiter.register_model(model, limits);
        }
        limiter
    }

    /// Register (or replace) the bucket for a model.
    pub fn register_model(&self, model: impl Into<String>, limits: ModelLimits) {
        self.buckets.insert(
            model.into(),
            Arc::new(ModelBucket {
                state: Mutex::new(BucketState::new(limits)),
                released: Notify::new(),
            }),
        );
    }

    fn bucket(&self, model: &str) -> Result<Arc<ModelBucket>, LimiterError> {
        self.buckets
            .get(model)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| LimiterError::UnknownModel {
                model: model.to_string(),
            })
    }

    /// Reserve `tokens_needed` tokens and one concurrency slot, atomically.
    ///
    /// Blocks until both are available, bounded by `cancel`. Fails
    /// immediately (no wait) with [`LimiterError::BudgetExceeded`] if the
    /// estimated cost would push today's spend past the daily budget.
    pub async fn acquire(
        &self,
        model: &str,
        tokens_needed: u64,
        cancel: &CancellationToken,
    ) -> Result<(), LimiterError> {
        let bucket = self.bucket(model)?;
        let needed = tokens_needed as f64;

        loop {
            let wait = {
                let mut state = bucket.state.lock();
                state.roll_day(Utc::now().date_naive());
                state.refill(Instant::now());

                if needed > state.limits.capacity {
                    return Err(LimiterError::Oversized {
                        model: model.to_string(),
                        requested: tokens_needed,
                        capacity: state.limits.capacity,
                    });
                }

                // Hard budget gate, evaluated before token withdrawal.
                let estimated_usd = needed / 1000.0 * state.limits.usd_per_1k_tokens;
                if state.spent_usd_today + estimated_usd > state.limits.daily_budget_usd {
                    return Err(LimiterError::BudgetExceeded {
                        model: model.to_string(),
                        requested_usd: estimated_usd,
                        remaining_usd: state.budget_remaining(),
                    });
                }

                if state.tokens >= needed && state.active < state.limits.concurrency_slots {
                    state.tokens -= needed;
                    state.active += 1;
                    log::debug!(
                        "limiter acquire: model={} tokens={} active={}",
                        model,
                        tokens_needed,
                        state.active
                    );
                    return Ok(());
                }

                if state.tokens >= needed {
                    // Tokens are there; parked on a concurrency slot.
                    SLOT_POLL_INTERVAL
                } else {
                    state.deficit_wait(needed)
                }
            };

            log::debug!(
                "limiter wait: model={} tokens={} wait={:?}",
                model,
                tokens_needed,
                wait
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(LimiterError::Cancelled {
                        model: model.to_string(),
                    });
                }
                _ = bucket.released.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Return a concurrency slot. Call at most once per successful
    /// [`RateLimiter::acquire`]; extra calls are absorbed harmlessly.
    pub fn release(&self, model: &str) -> Result<(), LimiterError> {
        let bucket = self.bucket(model)?;
        {
            let mut state = bucket.state.lock();
            state.active = state.active.saturating_sub(1);
        }
        bucket.released.notify_waiters();
        Ok(())
    }

    /// Add actual spend to today's ledger. Never decreases intra-day;
    /// clamped at the daily budget so the ledger invariant holds even if
    /// an upstream estimate was low.
    pub fn record_spend(&self, model: &str, usd: f64) -> Result<(), LimiterError> {
        let bucket = self.bucket(model)?;
        let mut state = bucket.state.lock();
        state.roll_day(Utc::now().date_naive());
        let unclamped = state.spent_usd_today + usd.max(0.0);
        if unclamped > state.limits.daily_budget_usd {
            log::warn!(
                "spend for model '{}' clamped at daily budget ${:.2} (recorded total would be ${:.2})",
                model,
                state.limits.daily_budget_usd,
                unclamped
            );
        }
        state.spent_usd_today = unclamped.min(state.limits.daily_budget_usd);
        Ok(())
    }

    /// Read-only snapshot of one bucket.
    pub fn status(&self, model: &str) -> Result<LimiterStatus, LimiterError> {
        let bucket = self.bucket(model)?;
        let mut state = bucket.state.lock();
        state.roll_day(Utc::now().date_naive());
        state.refill(Instant::now());
        Ok(LimiterStatus {
            tokens_available: state.tokens,
            budget_remaining: state.budget_remaining(),
            active_connections: state.active,
        })
    }

    #[cfg(test)]
    fn force_ledger(&self, model: &str, day: NaiveDate, spent: f64) {
        let bucket = self.bucket(model).unwrap();
        let mut state = bucket.state.lock();
        state.day = day;
        state.spent_usd_today = spent;
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("models", &self.buckets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with(model: &str, limits: ModelLimits) -> RateLimiter {
        RateLimiter::new([(model.to_string(), limits)])
    }

    #[tokio::test]
    async fn test_unknown_model_rejected() {
        let limiter = RateLimiter::new([]);
        let cancel = CancellationToken::new();
        let err = limiter.acquire("ghost", 1, &cancel).await.unwrap_err();
        assert!(matches!(err, LimiterError::UnknownModel { .. }));
        assert!(matches!(
            limiter.record_spend("ghost", 1.0),
            Err(LimiterError::UnknownModel { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_starvation_waits_for_refill() {
        // Capacity 100, refill 60/min: two 40-token acquires succeed
        // immediately, the third waits ~20s for the deficit to refill.
        let limiter = limiter_with(
            "m",
            ModelLimits {
                capacity: 100.0,
                refill_per_minute: 60.0,
                concurrency_slots: 8,
                daily_budget_usd: 1000.0,
                usd_per_1k_tokens: 0.0,
            },
        );
        let cancel = CancellationToken::new();

        let start = Instant::now();
        limiter.acquire("m", 40, &cancel).await.unwrap();
        limiter.acquire("m", 40, &cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));

        limiter.acquire("m", 40, &cancel).await.unwrap();
        let waited = start.elapsed();
        assert!(
            waited >= Duration::from_secs(19) && waited <= Duration::from_secs(22),
            "expected ~20s wait, got {:?}",
            waited
        );
    }

    #[tokio::test]
    async fn test_budget_gate_fails_immediately() {
        // Budget $10, $9.50 already spent; a $1 request must fail without
        // waiting even though tokens are plentiful.
        let limiter = limiter_with(
            "m",
            ModelLimits {
                capacity: 10_000.0,
                refill_per_minute: 10_000.0,
                concurrency_slots: 8,
                daily_budget_usd: 10.0,
                usd_per_1k_tokens: 1.0,
            },
        );
        limiter.record_spend("m", 9.5).unwrap();

        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let err = limiter.acquire("m", 1000, &cancel).await.unwrap_err();
        assert!(matches!(err, LimiterError::BudgetExceeded { .. }));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_spend_never_exceeds_budget() {
        let limiter = limiter_with(
            "m",
            ModelLimits {
                daily_budget_usd: 10.0,
                ..Default::default()
            },
        );
        limiter.record_spend("m", 6.0).unwrap();
        limiter.record_spend("m", 6.0).unwrap();
        limiter.record_spend("m", 100.0).unwrap();
        let status = limiter.status("m").unwrap();
        assert_eq!(status.budget_remaining, 0.0);
    }

    #[tokio::test]
    async fn test_day_boundary_resets_spend() {
        let limiter = limiter_with(
            "m",
            ModelLimits {
                daily_budget_usd: 10.0,
                usd_per_1k_tokens: 1.0,
                ..Default::default()
            },
        );
        let yesterday = Utc::now().date_naive().pred_opt().unwrap();
        limiter.force_ledger("m", yesterday, 10.0);

        // A new day means a fresh ledger and acquire succeeds again.
        let cancel = CancellationToken::new();
        limiter.acquire("m", 1000, &cancel).await.unwrap();
        let status = limiter.status("m").unwrap();
        assert_eq!(status.budget_remaining, 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_slot_blocks_until_release() {
        let limiter = Arc::new(limiter_with(
            "m",
            ModelLimits {
                capacity: 1000.0,
                refill_per_minute: 60_000.0,
                concurrency_slots: 1,
                daily_budget_usd: 1000.0,
                usd_per_1k_tokens: 0.0,
            },
        ));
        let cancel = CancellationToken::new();
        limiter.acquire("m", 10, &cancel).await.unwrap();

        let contender = {
            let limiter = Arc::clone(&limiter);
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire("m", 10, &cancel).await })
        };
        // Give the contender a chance to park on the slot.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        limiter.release("m").unwrap();
        contender.await.unwrap().unwrap();
        assert_eq!(limiter.status("m").unwrap().active_connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_respects_cancellation() {
        let limiter = limiter_with(
            "m",
            ModelLimits {
                capacity: 100.0,
                refill_per_minute: 0.06, // effectively never refills
                concurrency_slots: 1,
                daily_budget_usd: 1000.0,
                usd_per_1k_tokens: 0.0,
            },
        );
        let cancel = CancellationToken::new();
        limiter.acquire("m", 100, &cancel).await.unwrap();

        let deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            deadline.cancel();
        });
        let err = limiter.acquire("m", 100, &cancel).await.unwrap_err();
        assert!(matches!(err, LimiterError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_oversized_request_rejected() {
        let limiter = limiter_with(
            "m",
            ModelLimits {
                capacity: 100.0,
                ..Default::default()
            },
        );
        let cancel = CancellationToken::new();
        let err = limiter.acquire("m", 101, &cancel).await.unwrap_err();
        assert!(matches!(err, LimiterError::Oversized { .. }));
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let limiter = limiter_with(
            "m",
            ModelLimits {
                capacity: 100.0,
                refill_per_minute: 60.0,
                concurrency_slots: 2,
                daily_budget_usd: 20.0,
                usd_per_1k_tokens: 0.0,
            },
        );
        let cancel = CancellationToken::new();
        limiter.acquire("m", 30, &cancel).await.unwrap();
        limiter.record_spend("m", 5.0).unwrap();

        let status = limiter.status("m").unwrap();
        assert!(status.tokens_available >= 70.0 && status.tokens_available <= 71.0);
        assert_eq!(status.budget_remaining, 15.0);
        assert_eq!(status.active_connections, 1);
    }
}
