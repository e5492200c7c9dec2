//! Bounded retry with a fixed delay schedule
//!
//! One policy object shared by every caller that talks to an unreliable peer:
//! the accrual gateway retries transport failures, the ledger store retries
//! connection exceptions and serialization conflicts. Each caller supplies its
//! own predicate for which errors are worth another attempt.

use crate::error::RetryError;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy: one initial attempt plus one retry per configured delay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    name: &'static str,
    delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(name: &'static str, delays: Vec<Duration>) -> Self {
        Self { name, delays }
    }

    /// Build a policy from a millisecond schedule (used by config)
    pub fn from_millis(name: &'static str, delays_ms: &[u64]) -> Self {
        Self::new(
            name,
            delays_ms.iter().copied().map(Duration::from_millis).collect(),
        )
    }

    /// 100ms, 200ms, 300ms between accrual requests
    pub fn accrual_gateway() -> Self {
        Self::from_millis("accrual_gateway", &[100, 200, 300])
    }

    /// 100ms, 300ms, 500ms between store attempts
    pub fn ledger_store() -> Self {
        Self::from_millis("ledger_store", &[100, 300, 500])
    }

    /// A policy that never retries
    pub fn none(name: &'static str) -> Self {
        Self::new(name, Vec::new())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Run `op` until it succeeds, fails permanently, or the schedule runs out.
    ///
    /// Errors rejected by `is_retriable` are returned at once as
    /// [`RetryError::Permanent`]. When every attempt fails with a retriable
    /// error, [`RetryError::Exhausted`] carries the cause of each attempt in order.
    pub async fn run<T, E, F, Fut, P>(&self, mut op: F, is_retriable: P) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let mut causes = Vec::new();

        for attempt in 0..self.max_attempts() {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("{} succeeded on attempt {}", self.name, attempt + 1);
                    }
                    return Ok(value);
                }
                Err(e) if is_retriable(&e) => {
                    causes.push(e.to_string());
                    match self.delays.get(attempt) {
                        Some(delay) => {
                            debug!(
                                "{} attempt {} failed: {}, retrying in {:?}",
                                self.name,
                                attempt + 1,
                                e,
                                delay
                            );
                            tokio::time::sleep(*delay).await;
                        }
                        None => break,
                    }
                }
                Err(e) => return Err(RetryError::Permanent(e)),
            }
        }

        warn!(
            "{} gave up after {} attempts",
            self.name,
            causes.len()
        );
        Err(RetryError::Exhausted {
            attempts: causes.len(),
            causes,
        })
    }
}
