#![allow(dead_code)]

use async_trait::async_trait;
use loyalty::domain::{AccrualReport, AccrualStatus, Order, OrderStatus};
use loyalty::{AccrualReply, AccrualSource, GatewayError, InMemoryLedger, LedgerStore};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Accrual source that replays a per-order script, then repeats a fallback reply
pub struct ScriptedSource {
    scripts: Mutex<HashMap<String, VecDeque<Result<AccrualReply, GatewayError>>>>,
    fallback: Result<AccrualReply, GatewayError>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(fallback: Result<AccrualReply, GatewayError>) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn not_registered() -> Self {
        Self::new(Ok(AccrualReply::NotRegistered))
    }

    pub fn script(self, order_id: &str, replies: Vec<Result<AccrualReply, GatewayError>>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(order_id.to_string(), replies.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccrualSource for ScriptedSource {
    async fn fetch_status(&self, order_id: &str) -> Result<AccrualReply, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(order_id)
            .and_then(|replies| replies.pop_front());
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

pub fn known(order_id: &str, status: AccrualStatus) -> Result<AccrualReply, GatewayError> {
    Ok(AccrualReply::Known(AccrualReport::new(order_id, status)))
}

pub fn processed(order_id: &str, accrual: Decimal) -> Result<AccrualReply, GatewayError> {
    Ok(AccrualReply::Known(AccrualReport::processed(order_id, accrual)))
}

pub fn rate_limited() -> Result<AccrualReply, GatewayError> {
    Ok(AccrualReply::RateLimited { retry_after: None })
}

/// Ledger with one user per login and the given `NEW` orders owned by the first user
pub async fn ledger(logins: &[&str], orders: &[&str]) -> InMemoryLedger {
    let ledger = InMemoryLedger::new();
    for login in logins {
        ledger.create_user(login, "token").await.unwrap();
    }
    for id in orders {
        ledger.create_order(logins[0], id).await.unwrap();
    }
    ledger
}

/// Credit `amount` to `owner` through a processed order, the only way balance grows
pub async fn credit(ledger: &InMemoryLedger, owner: &str, order_id: &str, amount: Decimal) {
    ledger.create_order(owner, order_id).await.unwrap();
    let processed = Order {
        status: OrderStatus::Processed,
        accrual: amount,
        ..Order::new(owner, order_id)
    };
    ledger.apply_accrual_update(&processed).await.unwrap();
}

/// Poll `check` until it returns true or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
