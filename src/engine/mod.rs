//! Order Accrual Reconciliation Engine
//!
//! Two background tasks joined by a capacity-1 channel: the poller runs the
//! [`Scheduler`] on a fixed interval, the [`UpdatePipeline`] writes what it
//! finds. Both watch one shutdown signal and report back when they exit.

pub mod pipeline;
pub mod scheduler;

pub use pipeline::{BatchReport, UpdatePipeline, PIPELINE_CAPACITY};
pub use scheduler::{CycleReport, Scheduler, SchedulerConfig};

use crate::accrual::AccrualSource;
use crate::coordination::{GracefulShutdown, ShutdownError, ShutdownSignal, ShutdownToken};
use crate::domain::Order;
use crate::services::EngineStats;
use crate::store::LedgerStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

const POLLER_TASK: &str = "poller";
const PIPELINE_TASK: &str = "pipeline";

/// Engine timing and fan-out
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub scheduler: SchedulerConfig,
    /// Pause between two ledger writes of the pipeline
    pub write_delay: Duration,
    /// How long `stop` waits for both tasks
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            scheduler: SchedulerConfig::default(),
            write_delay: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

pub struct Engine;

impl Engine {
    /// Spawn the poller and the pipeline; returns immediately
    pub fn start(
        store: Arc<dyn LedgerStore>,
        source: Arc<dyn AccrualSource>,
        stats: Arc<EngineStats>,
        config: EngineConfig,
    ) -> EngineHandle {
        info!(
            "Starting accrual engine (interval: {:?}, fan-out: {}, write delay: {:?})",
            config.poll_interval, config.scheduler.fan_out, config.write_delay
        );

        let shutdown = Arc::new(GracefulShutdown::new());
        let (tx, rx) = pipeline::channel();

        let pipeline =
            UpdatePipeline::new(Arc::clone(&store), Arc::clone(&stats), config.write_delay);
        let pipeline_task = tokio::spawn(pipeline.run(rx, shutdown.token(PIPELINE_TASK)));

        let scheduler = Scheduler::new(store, source, stats, config.scheduler.clone());
        let poller_task = tokio::spawn(poll_loop(
            scheduler,
            tx,
            config.poll_interval,
            shutdown.token(POLLER_TASK),
        ));

        EngineHandle {
            shutdown,
            tasks: vec![poller_task, pipeline_task],
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

async fn poll_loop(
    mut scheduler: Scheduler,
    updates: mpsc::Sender<Vec<Order>>,
    poll_interval: Duration,
    mut token: ShutdownToken,
) {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.wait_for_shutdown() => break,
            _ = interval.tick() => {
                // Cancelling a cycle only drops reads and in-flight requests
                tokio::select! {
                    _ = token.wait_for_shutdown() => break,
                    report = scheduler.tick(&updates) => {
                        if let Some(report) = report {
                            debug!(?report, "Poll cycle finished");
                        }
                    }
                }
            }
        }
    }

    info!("Accrual poller stopped");
    drop(updates);
    token.complete().await;
}

/// Running engine
pub struct EngineHandle {
    shutdown: Arc<GracefulShutdown>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl EngineHandle {
    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_shutdown_requested()
    }

    /// Signal both tasks and wait for them, up to the shutdown timeout
    pub async fn stop(self) -> Result<(), ShutdownError> {
        self.stop_with(ShutdownSignal::Graceful).await
    }

    pub async fn stop_with(self, signal: ShutdownSignal) -> Result<(), ShutdownError> {
        self.shutdown.request_shutdown(signal);

        let result = self
            .shutdown
            .wait_for_completion(&[POLLER_TASK, PIPELINE_TASK], self.shutdown_timeout)
            .await;

        if result.is_err() {
            for task in &self.tasks {
                task.abort();
            }
        }
        info!("Accrual engine stopped");
        result
    }
}
