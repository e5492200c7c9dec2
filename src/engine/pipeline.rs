//! Update Pipeline
//!
//! The single writer of accrual transitions. Batches arrive over a
//! capacity-1 channel, so a slow ledger pushes back on the scheduler instead
//! of letting work pile up in memory.

use crate::coordination::ShutdownToken;
use crate::domain::Order;
use crate::services::EngineStats;
use crate::store::{AccrualOutcome, LedgerStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Hand-off queue capacity between scheduler and pipeline
pub const PIPELINE_CAPACITY: usize = 1;

pub fn channel() -> (mpsc::Sender<Vec<Order>>, mpsc::Receiver<Vec<Order>>) {
    mpsc::channel(PIPELINE_CAPACITY)
}

/// Result of writing one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct UpdatePipeline {
    store: Arc<dyn LedgerStore>,
    stats: Arc<EngineStats>,
    write_delay: Duration,
}

impl UpdatePipeline {
    pub fn new(store: Arc<dyn LedgerStore>, stats: Arc<EngineStats>, write_delay: Duration) -> Self {
        Self {
            store,
            stats,
            write_delay,
        }
    }

    /// Write every order of `batch` in order; a failing order does not stop the rest
    pub async fn apply_batch(&self, batch: Vec<Order>) -> BatchReport {
        self.write_batch(batch, || false).await
    }

    async fn write_batch<F>(&self, batch: Vec<Order>, should_stop: F) -> BatchReport
    where
        F: Fn() -> bool,
    {
        let mut report = BatchReport::default();
        let total = batch.len();

        for (i, order) in batch.into_iter().enumerate() {
            if i > 0 {
                if should_stop() {
                    warn!("Stopping mid-batch, {} of {} transitions not written", total - i, total);
                    break;
                }
                tokio::time::sleep(self.write_delay).await;
            }

            match self.store.apply_accrual_update(&order).await {
                Ok(AccrualOutcome::Applied { credited }) => {
                    report.applied += 1;
                    EngineStats::inc(&self.stats.updates_applied);
                    debug!("Order {} now {} (credited {})", order.id, order.status, credited);
                }
                Ok(AccrualOutcome::Skipped) => {
                    report.skipped += 1;
                    EngineStats::inc(&self.stats.updates_skipped);
                    debug!("Order {} already advanced, {} not written", order.id, order.status);
                }
                Err(e) => {
                    report.failed += 1;
                    EngineStats::inc(&self.stats.update_failures);
                    error!("Failed to write order {} as {}: {}", order.id, order.status, e);
                }
            }
        }

        report
    }

    /// Consume batches until shutdown or until every sender is gone
    pub async fn run(self, mut updates: mpsc::Receiver<Vec<Order>>, mut token: ShutdownToken) {
        info!("Update pipeline started");

        loop {
            tokio::select! {
                _ = token.wait_for_shutdown() => {
                    debug!("Update pipeline received shutdown");
                    break;
                }
                batch = updates.recv() => {
                    let Some(batch) = batch else {
                        debug!("Update channel closed");
                        break;
                    };
                    let report = self
                        .write_batch(batch, || token.is_shutdown_requested())
                        .await;
                    if report.failed > 0 {
                        warn!(
                            "Batch finished with {} failures ({} applied, {} skipped)",
                            report.failed, report.applied, report.skipped
                        );
                    }
                }
            }
        }

        info!("Update pipeline stopped");
        token.complete().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderStatus;
    use crate::store::InMemoryLedger;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    async fn seeded(ids: &[&str]) -> Arc<InMemoryLedger> {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.create_user("alice", "token").await.unwrap();
        for id in ids {
            ledger.create_order("alice", id).await.unwrap();
        }
        ledger
    }

    fn transition(id: &str, status: OrderStatus, accrual: Decimal) -> Order {
        Order {
            status,
            accrual,
            ..Order::new("alice", id)
        }
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_batch() {
        let ledger = seeded(&["1", "2", "3"]).await;
        ledger.inject_update_failure("2").await;
        let stats = Arc::new(EngineStats::new());
        let pipeline = UpdatePipeline::new(ledger.clone(), stats.clone(), Duration::from_millis(1));

        let report = pipeline
            .apply_batch(vec![
                transition("1", OrderStatus::Processed, dec!(10)),
                transition("2", OrderStatus::Processed, dec!(20)),
                transition("3", OrderStatus::Invalid, Decimal::ZERO),
            ])
            .await;

        assert_eq!(
            report,
            BatchReport {
                applied: 2,
                skipped: 0,
                failed: 1
            }
        );
        assert_eq!(
            ledger.applied_updates().await,
            vec![
                ("1".to_string(), OrderStatus::Processed),
                ("3".to_string(), OrderStatus::Invalid)
            ]
        );
        assert_eq!(ledger.find_user("alice").await.unwrap().balance, dec!(10));
        assert_eq!(stats.snapshot().await.update_failures, 1);
    }

    #[tokio::test]
    async fn test_write_delay_spaces_writes() {
        let ledger = seeded(&["1", "2", "3"]).await;
        let pipeline = UpdatePipeline::new(
            ledger,
            Arc::new(EngineStats::new()),
            Duration::from_millis(30),
        );

        let started = std::time::Instant::now();
        pipeline
            .apply_batch(vec![
                transition("1", OrderStatus::Processing, Decimal::ZERO),
                transition("2", OrderStatus::Processing, Decimal::ZERO),
                transition("3", OrderStatus::Processing, Decimal::ZERO),
            ])
            .await;

        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_run_exits_when_channel_closes() {
        let ledger = seeded(&["1"]).await;
        let shutdown = crate::coordination::GracefulShutdown::new();
        let pipeline = UpdatePipeline::new(
            ledger.clone(),
            Arc::new(EngineStats::new()),
            Duration::from_millis(1),
        );
        let (tx, rx) = channel();

        let worker = tokio::spawn(pipeline.run(rx, shutdown.token("pipeline")));
        tx.send(vec![transition("1", OrderStatus::Processing, Decimal::ZERO)])
            .await
            .unwrap();
        drop(tx);

        worker.await.unwrap();
        assert_eq!(
            ledger.find_order("1").await.unwrap().status,
            OrderStatus::Processing
        );
        shutdown
            .wait_for_completion(&["pipeline"], Duration::from_secs(1))
            .await
            .unwrap();
    }
}
