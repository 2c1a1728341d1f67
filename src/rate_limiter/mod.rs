//! Distributed-aware rate limiter.
//!
//! Each admission requires two things to agree: the in-process [`ExchangeGate`] paces retries
//! so concurrent callers in this process don't busy-poll the database, and
//! [`ConnectorRepository::acquire_rate_limit_token`] is the authoritative, persisted gate that
//! actually grants the token — it's a single atomic `UPDATE ... RETURNING` against the
//! connector's `rate_limit_usage`/`rate_limit_period_start`/`last_api_call_at` columns, so any
//! number of `RateLimiter` instances across processes stay correct even though each one caches
//! its own view of the admission schedule, per Design Note "Shared rate-limit state" in
//! `SPEC_FULL.md` §4.2.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::db::models::RateLimit;
use crate::db::repositories::ConnectorRepository;

pub mod error;

use error::{RateLimiterError, Result};

struct ExchangeGate {
    rate_limit: RateLimit,
    window_start: Instant,
    count_in_window: u32,
    last_admission: Option<Instant>,
}

impl ExchangeGate {
    fn new(rate_limit: RateLimit) -> Self {
        Self { rate_limit, window_start: Instant::now(), count_in_window: 0, last_admission: None }
    }

    /// Returns the earliest `Instant` at which a new admission is allowed, and whether that
    /// instant is now (i.e. admission can proceed immediately).
    fn next_admission(&mut self, now: Instant) -> Instant {
        let period = Duration::from_millis(self.rate_limit.period_ms);
        if now.duration_since(self.window_start) >= period {
            self.window_start = now;
            self.count_in_window = 0;
        }

        let window_ready_at = if self.count_in_window >= self.rate_limit.limit {
            self.window_start + period
        } else {
            now
        };

        let min_delay_ready_at = self
            .last_admission
            .map(|t| t + Duration::from_millis(self.rate_limit.min_delay_ms))
            .unwrap_or(now);

        window_ready_at.max(min_delay_ready_at)
    }

    fn record_admission(&mut self, at: Instant) {
        self.count_in_window += 1;
        self.last_admission = Some(at);
    }
}

pub struct RateLimiter {
    connectors: Arc<dyn ConnectorRepository>,
    gates: Mutex<HashMap<String, ExchangeGate>>,
}

impl RateLimiter {
    pub fn new(connectors: Arc<dyn ConnectorRepository>) -> Self {
        Self { connectors, gates: Mutex::new(HashMap::new()) }
    }

    /// Blocks until a slot opens for `connector_id` **and** the database grants a token, or
    /// returns [`RateLimiterError::Cancelled`] if `token` fires first. Call this once per
    /// exchange call, not once per job run, so the admission gate actually bounds per-call
    /// traffic.
    pub async fn wait_for_slot(
        &self,
        connector_id: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        loop {
            let ready_at = {
                let mut gates = self.gates.lock().await;
                if !gates.contains_key(connector_id) {
                    let connector = self.connectors.get(connector_id).await?;
                    gates.insert(connector_id.to_string(), ExchangeGate::new(connector.rate_limit));
                }
                let gate = gates.get_mut(connector_id).expect("just inserted");
                gate.next_admission(Instant::now())
            };

            let now = Instant::now();
            if ready_at > now {
                tokio::select! {
                    _ = tokio::time::sleep_until(ready_at.into()) => continue,
                    _ = token.cancelled() => {
                        return Err(RateLimiterError::Cancelled(connector_id.to_string()));
                    }
                }
            }

            if self.connectors.acquire_rate_limit_token(connector_id).await? {
                let mut gates = self.gates.lock().await;
                if let Some(gate) = gates.get_mut(connector_id) {
                    gate.record_admission(Instant::now());
                }
                return Ok(());
            }

            // The in-process pacing thought a slot was open but the persisted gate (shared
            // across processes) disagreed. Back off briefly and retry rather than busy-loop.
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
                _ = token.cancelled() => {
                    return Err(RateLimiterError::Cancelled(connector_id.to_string()));
                }
            }
        }
    }

    /// Invalidates the cached gate, forcing the next `wait_for_slot` call to re-fetch the
    /// connector's current `RateLimit` from storage. Call after an admin updates it.
    pub async fn refresh(&self, connector_id: &str) {
        self.gates.lock().await.remove(connector_id);
    }
}
