//! Reconciliation Scheduler
//!
//! Each cycle reads every unresolved order, asks the accrual system about
//! each one with bounded fan-out, and hands the orders whose status changed
//! to the update pipeline as one batch.

use crate::accrual::{AccrualReply, AccrualSource};
use crate::domain::{decide_transition, Order};
use crate::error::{GatewayError, LoyaltyError, Result};
use crate::services::EngineStats;
use crate::store::LedgerStore;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Concurrent accrual requests per cycle
    pub fan_out: usize,
    /// Upper bound for one order's status fetch, retries included
    pub fetch_timeout: Duration,
    /// Pause after a 429 that carried no `Retry-After`
    pub rate_limit_cooldown: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fan_out: 4,
            fetch_timeout: Duration::from_secs(5),
            rate_limit_cooldown: Duration::from_secs(60),
        }
    }
}

/// Summary of one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Accrual requests whose reply was consumed
    pub polled: usize,
    /// Transitions handed to the update pipeline
    pub changed: usize,
    /// The cycle was cut short by a 429
    pub rate_limited: bool,
    /// Requests that failed (transport, timeout, unexpected status, bad body)
    pub failures: usize,
    /// The tick fell inside a rate-limit cooldown and nothing was polled
    pub cooling_down: bool,
}

pub struct Scheduler {
    store: Arc<dyn LedgerStore>,
    source: Arc<dyn AccrualSource>,
    stats: Arc<EngineStats>,
    config: SchedulerConfig,
    cooldown_until: Option<Instant>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        source: Arc<dyn AccrualSource>,
        stats: Arc<EngineStats>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            source,
            stats,
            config,
            cooldown_until: None,
        }
    }

    /// Remaining rate-limit cooldown, if any
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        self.cooldown_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .filter(|left| !left.is_zero())
    }

    /// Compute the transitions for every unresolved order.
    ///
    /// Stops issuing requests at the first rate-limit reply; transitions
    /// decided before it are still returned.
    pub async fn poll(&mut self) -> Result<(Vec<Order>, CycleReport)> {
        let mut report = CycleReport::default();

        if let Some(left) = self.cooldown_remaining() {
            debug!("Rate-limit cooldown active, {:?} left; skipping cycle", left);
            EngineStats::inc(&self.stats.cycles_skipped);
            report.cooling_down = true;
            return Ok((Vec::new(), report));
        }

        let orders = self.store.list_unresolved_orders().await?;
        if orders.is_empty() {
            return Ok((Vec::new(), report));
        }
        debug!("Polling accrual status for {} orders", orders.len());

        let mut changed = Vec::new();
        let mut limited: Option<Option<Duration>> = None;
        let source = Arc::clone(&self.source);
        let fetch_timeout = self.config.fetch_timeout;

        // Results come back in store order regardless of completion order
        let mut replies = stream::iter(orders)
            .map(move |order| {
                let source = Arc::clone(&source);
                async move {
                    let reply =
                        match tokio::time::timeout(fetch_timeout, source.fetch_status(&order.id))
                            .await
                        {
                            Ok(reply) => reply,
                            Err(_) => Err(GatewayError::Timeout {
                                elapsed_ms: duration_millis(fetch_timeout),
                            }),
                        };
                    (order, reply)
                }
            })
            .buffered(self.config.fan_out.max(1));

        while let Some((order, reply)) = replies.next().await {
            report.polled += 1;
            match reply {
                Ok(AccrualReply::Known(accrual)) => {
                    if let Some(next) = decide_transition(&order, &accrual) {
                        debug!("Order {}: {} -> {}", order.id, order.status, next.status);
                        changed.push(next);
                    }
                }
                Ok(AccrualReply::NotRegistered) => {
                    debug!("Order {} not registered with accrual system", order.id);
                }
                Ok(AccrualReply::RateLimited { retry_after }) => {
                    limited = Some(retry_after);
                    break;
                }
                Err(e) => {
                    report.failures += 1;
                    warn!("Accrual status for order {} failed: {}", order.id, e);
                }
            }
        }
        drop(replies);

        EngineStats::add(&self.stats.orders_polled, report.polled as u64);
        EngineStats::add(&self.stats.gateway_failures, report.failures as u64);

        if let Some(retry_after) = limited {
            let cooldown = retry_after.unwrap_or(self.config.rate_limit_cooldown);
            warn!(
                "Accrual system rate limited after {} requests; pausing polls for {:?}",
                report.polled, cooldown
            );
            self.cooldown_until = Some(Instant::now() + cooldown);
            report.rate_limited = true;
            EngineStats::inc(&self.stats.rate_limited);
        }

        report.changed = changed.len();
        Ok((changed, report))
    }

    /// One full cycle: poll, then enqueue the changed subset for writing
    pub async fn run_cycle(&mut self, updates: &mpsc::Sender<Vec<Order>>) -> Result<CycleReport> {
        let (changed, report) = self.poll().await?;
        if !report.cooling_down {
            self.stats.mark_cycle().await;
        }

        if changed.is_empty() {
            return Ok(report);
        }

        let count = changed.len() as u64;
        updates
            .send(changed)
            .await
            .map_err(|_| LoyaltyError::Internal("update pipeline closed".to_string()))?;
        EngineStats::add(&self.stats.transitions_queued, count);

        info!(
            polled = report.polled,
            changed = report.changed,
            failures = report.failures,
            rate_limited = report.rate_limited,
            "Queued accrual transitions"
        );
        Ok(report)
    }

    /// Run a cycle, logging instead of propagating failures
    pub async fn tick(&mut self, updates: &mpsc::Sender<Vec<Order>>) -> Option<CycleReport> {
        match self.run_cycle(updates).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!("Poll cycle aborted: {}", e);
                None
            }
        }
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accrual::MockAccrualSource;
    use crate::domain::{AccrualReport, AccrualStatus, OrderStatus};
    use crate::store::InMemoryLedger;
    use mockall::predicate::eq;
    use rust_decimal_macros::dec;

    async fn ledger(orders: &[&str]) -> Arc<InMemoryLedger> {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.create_user("alice", "token").await.unwrap();
        for id in orders {
            ledger.create_order("alice", id).await.unwrap();
        }
        ledger
    }

    fn scheduler(ledger: Arc<InMemoryLedger>, source: MockAccrualSource) -> Scheduler {
        Scheduler::new(
            ledger,
            Arc::new(source),
            Arc::new(EngineStats::new()),
            SchedulerConfig {
                fan_out: 1,
                fetch_timeout: Duration::from_secs(1),
                rate_limit_cooldown: Duration::from_secs(60),
            },
        )
    }

    #[tokio::test]
    async fn test_only_changed_orders_are_returned() {
        let ledger = ledger(&["1", "2", "3"]).await;
        let mut source = MockAccrualSource::new();
        source
            .expect_fetch_status()
            .with(eq("1"))
            .returning(|id| Ok(AccrualReply::Known(AccrualReport::processed(id, dec!(500)))));
        source
            .expect_fetch_status()
            .with(eq("2"))
            .returning(|id| Ok(AccrualReply::Known(AccrualReport::new(id, AccrualStatus::Processing))));
        source
            .expect_fetch_status()
            .with(eq("3"))
            .returning(|_| Ok(AccrualReply::NotRegistered));

        let mut scheduler = scheduler(ledger, source);
        let (changed, report) = scheduler.poll().await.unwrap();

        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, "1");
        assert_eq!(changed[0].status, OrderStatus::Processed);
        assert_eq!(report.polled, 3);
        assert_eq!(report.changed, 1);
        assert!(!report.rate_limited);
    }

    #[tokio::test]
    async fn test_rate_limit_stops_cycle_and_starts_cooldown() {
        let ledger = ledger(&["1", "2", "3"]).await;
        let mut source = MockAccrualSource::new();
        source
            .expect_fetch_status()
            .with(eq("1"))
            .times(1)
            .returning(|id| Ok(AccrualReply::Known(AccrualReport::new(id, AccrualStatus::Invalid))));
        source
            .expect_fetch_status()
            .with(eq("2"))
            .times(1)
            .returning(|_| {
                Ok(AccrualReply::RateLimited {
                    retry_after: Some(Duration::from_secs(30)),
                })
            });
        source.expect_fetch_status().with(eq("3")).never();

        let mut scheduler = scheduler(ledger, source);
        let (changed, report) = scheduler.poll().await.unwrap();

        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, OrderStatus::Invalid);
        assert!(report.rate_limited);
        assert_eq!(report.polled, 2);
        assert!(scheduler.cooldown_remaining().unwrap() > Duration::from_secs(25));

        // Next tick is skipped without touching the gateway
        let (changed, report) = scheduler.poll().await.unwrap();
        assert!(changed.is_empty());
        assert!(report.cooling_down);
        assert_eq!(report.polled, 0);
    }

    #[tokio::test]
    async fn test_gateway_failure_leaves_order_eligible() {
        let ledger = ledger(&["1"]).await;
        let mut source = MockAccrualSource::new();
        source
            .expect_fetch_status()
            .returning(|_| Err(GatewayError::UnknownStatus(500)));

        let mut scheduler = scheduler(ledger.clone(), source);
        let (changed, report) = scheduler.poll().await.unwrap();

        assert!(changed.is_empty());
        assert_eq!(report.failures, 1);
        assert_eq!(
            ledger.list_unresolved_orders().await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_store_failure_aborts_cycle() {
        let ledger = ledger(&["1"]).await;
        ledger.set_unavailable(true).await;
        let mut source = MockAccrualSource::new();
        source.expect_fetch_status().never();

        let mut scheduler = scheduler(ledger, source);
        let (tx, _rx) = mpsc::channel(1);
        assert!(scheduler.tick(&tx).await.is_none());
    }

    struct StalledSource;

    #[async_trait::async_trait]
    impl AccrualSource for StalledSource {
        async fn fetch_status(
            &self,
            _order_id: &str,
        ) -> std::result::Result<AccrualReply, GatewayError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(AccrualReply::NotRegistered)
        }
    }

    #[tokio::test]
    async fn test_cycle_runs_on_spawned_task() {
        let ledger = ledger(&["1", "2"]).await;
        let mut source = MockAccrualSource::new();
        source
            .expect_fetch_status()
            .times(2)
            .returning(|id| Ok(AccrualReply::Known(AccrualReport::processed(id, dec!(5)))));

        let mut scheduler = scheduler(ledger, source);
        let (tx, mut rx) = mpsc::channel(1);
        let report = tokio::spawn(async move { scheduler.run_cycle(&tx).await })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.polled, 2);
        assert_eq!(report.changed, 2);
        let batch = rx.recv().await.unwrap();
        assert_eq!(
            batch.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(),
            vec!["1", "2"]
        );
    }

    #[tokio::test]
    async fn test_stalled_fetch_times_out() {
        let ledger = ledger(&["1"]).await;
        let mut scheduler = Scheduler::new(
            ledger.clone(),
            Arc::new(StalledSource),
            Arc::new(EngineStats::new()),
            SchedulerConfig {
                fan_out: 1,
                fetch_timeout: Duration::from_millis(20),
                rate_limit_cooldown: Duration::from_secs(60),
            },
        );

        let (changed, report) = scheduler.poll().await.unwrap();
        assert!(changed.is_empty());
        assert_eq!(report.failures, 1);
        assert_eq!(ledger.list_unresolved_orders().await.unwrap().len(), 1);
    }

    #[test]
    fn test_timeout_millis_saturate() {
        assert_eq!(duration_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_empty_subset_enqueues_nothing() {
        let ledger = ledger(&["1"]).await;
        let mut source = MockAccrualSource::new();
        source
            .expect_fetch_status()
            .returning(|_| Ok(AccrualReply::NotRegistered));

        let mut scheduler = scheduler(ledger, source);
        let (tx, mut rx) = mpsc::channel(1);
        let report = scheduler.run_cycle(&tx).await.unwrap();

        assert_eq!(report.changed, 0);
        assert!(rx.try_recv().is_err());
    }
}
