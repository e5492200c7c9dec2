//! Graceful Shutdown Handler
//!
//! One broadcast signal fans out to every background task; each task reports
//! back on a completion channel once it has left its loop. The owner waits for
//! the expected completions up to a deadline and then proceeds regardless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT, or an explicit stop)
    Graceful,
    /// SIGQUIT: same sequence, logged loudly
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

/// Shutdown errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    #[error("shutdown timed out after {timeout:?}; still running: {}", .pending.join(", "))]
    Timeout {
        timeout: Duration,
        pending: Vec<&'static str>,
    },
}

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    shutdown_requested: Arc<AtomicBool>,
    signal_tx: broadcast::Sender<ShutdownSignal>,
    completion_tx: mpsc::Sender<&'static str>,
    completion_rx: Mutex<mpsc::Receiver<&'static str>>,
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (signal_tx, _) = broadcast::channel(8);
        let (completion_tx, completion_rx) = mpsc::channel(8);

        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            signal_tx,
            completion_tx,
            completion_rx: Mutex::new(completion_rx),
        }
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Request shutdown with specified signal type
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }

        info!("Shutdown requested: {}", signal);
        let _ = self.signal_tx.send(signal);
    }

    /// Token for one background task, identified by `task` in completion reports
    pub fn token(&self, task: &'static str) -> ShutdownToken {
        ShutdownToken {
            task,
            shutdown_requested: Arc::clone(&self.shutdown_requested),
            signal_rx: self.signal_tx.subscribe(),
            completion_tx: self.completion_tx.clone(),
        }
    }

    /// Wait until every task in `tasks` has reported completion, or `timeout` passes
    pub async fn wait_for_completion(
        &self,
        tasks: &[&'static str],
        timeout: Duration,
    ) -> Result<(), ShutdownError> {
        let mut pending: Vec<&'static str> = tasks.to_vec();
        let mut rx = self.completion_rx.lock().await;

        let drain = async {
            while !pending.is_empty() {
                match rx.recv().await {
                    Some(task) => {
                        debug!("Task {} finished", task);
                        pending.retain(|t| *t != task);
                    }
                    None => break,
                }
            }
        };

        if tokio::time::timeout(timeout, drain).await.is_err() || !pending.is_empty() {
            warn!(
                "Shutdown timeout after {:?}, proceeding anyway (pending: {:?})",
                timeout, pending
            );
            return Err(ShutdownError::Timeout { timeout, pending });
        }

        info!("All background tasks stopped");
        Ok(())
    }
}

/// Token for checking shutdown status in async tasks
pub struct ShutdownToken {
    task: &'static str,
    shutdown_requested: Arc<AtomicBool>,
    signal_rx: broadcast::Receiver<ShutdownSignal>,
    completion_tx: mpsc::Sender<&'static str>,
}

impl ShutdownToken {
    pub fn task(&self) -> &'static str {
        self.task
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Wait for shutdown signal
    pub async fn wait_for_shutdown(&mut self) -> ShutdownSignal {
        match self.signal_rx.try_recv() {
            Ok(signal) => return signal,
            Err(_) if self.is_shutdown_requested() => return ShutdownSignal::Graceful,
            Err(_) => {}
        }
        match self.signal_rx.recv().await {
            Ok(signal) => signal,
            // Coordinator dropped or we lagged behind: either way, stop
            Err(_) => ShutdownSignal::Graceful,
        }
    }

    /// Report that this task has left its loop
    pub async fn complete(self) {
        if self.completion_tx.send(self.task).await.is_err() {
            debug!("Shutdown coordinator gone before {} completed", self.task);
        }
    }
}

/// Resolve on the first of SIGINT, SIGTERM or SIGQUIT (Ctrl+C elsewhere)
pub async fn wait_for_os_signal() -> std::io::Result<ShutdownSignal> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigquit = signal(SignalKind::quit())?;

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                info!("Received SIGINT");
                Ok(ShutdownSignal::Graceful)
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                Ok(ShutdownSignal::Graceful)
            }
            _ = sigquit.recv() => {
                warn!("Received SIGQUIT - urgent shutdown");
                Ok(ShutdownSignal::Urgent)
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
        Ok(ShutdownSignal::Graceful)
    }
}
