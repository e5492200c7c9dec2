use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::info;

/// Engine counters for observability
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Poll cycles that ran to completion or were cut short
    pub cycles: AtomicU64,
    /// Ticks skipped during a rate-limit cooldown
    pub cycles_skipped: AtomicU64,
    /// Gateway requests issued
    pub orders_polled: AtomicU64,
    /// Transitions handed to the update pipeline
    pub transitions_queued: AtomicU64,
    /// Transitions written to the ledger
    pub updates_applied: AtomicU64,
    /// Transitions the ledger skipped as stale
    pub updates_skipped: AtomicU64,
    /// Transitions that failed to write
    pub update_failures: AtomicU64,
    /// Gateway requests that failed
    pub gateway_failures: AtomicU64,
    /// Cycles stopped by a 429
    pub rate_limited: AtomicU64,
    last_cycle: RwLock<Option<DateTime<Utc>>>,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub cycles_skipped: u64,
    pub orders_polled: u64,
    pub transitions_queued: u64,
    pub updates_applied: u64,
    pub updates_skipped: u64,
    pub update_failures: u64,
    pub gateway_failures: u64,
    pub rate_limited: u64,
    pub last_cycle: Option<DateTime<Utc>>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub async fn mark_cycle(&self) {
        Self::inc(&self.cycles);
        *self.last_cycle.write().await = Some(Utc::now());
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            orders_polled: self.orders_polled.load(Ordering::Relaxed),
            transitions_queued: self.transitions_queued.load(Ordering::Relaxed),
            updates_applied: self.updates_applied.load(Ordering::Relaxed),
            updates_skipped: self.updates_skipped.load(Ordering::Relaxed),
            update_failures: self.update_failures.load(Ordering::Relaxed),
            gateway_failures: self.gateway_failures.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            last_cycle: *self.last_cycle.read().await,
        }
    }

    /// Export counters in Prometheus text format
    pub fn prometheus(&self) -> String {
        let counters = [
            ("loyalty_cycles_total", "Poll cycles run", &self.cycles),
            ("loyalty_cycles_skipped_total", "Ticks skipped while rate limited", &self.cycles_skipped),
            ("loyalty_orders_polled_total", "Accrual status requests issued", &self.orders_polled),
            ("loyalty_transitions_queued_total", "Transitions queued for writing", &self.transitions_queued),
            ("loyalty_updates_applied_total", "Transitions written", &self.updates_applied),
            ("loyalty_updates_skipped_total", "Stale transitions skipped", &self.updates_skipped),
            ("loyalty_update_failures_total", "Transitions that failed to write", &self.update_failures),
            ("loyalty_gateway_failures_total", "Failed accrual requests", &self.gateway_failures),
            ("loyalty_rate_limited_total", "Cycles stopped by rate limiting", &self.rate_limited),
        ];

        counters
            .iter()
            .map(|(name, help, counter)| {
                format!(
                    "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
                    counter.load(Ordering::Relaxed)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Log periodic status
    pub async fn log_status(&self) {
        let s = self.snapshot().await;
        info!(
            cycles = s.cycles,
            polled = s.orders_polled,
            applied = s.updates_applied,
            failures = s.update_failures + s.gateway_failures,
            rate_limited = s.rate_limited,
            "Engine status"
        );
    }
}
