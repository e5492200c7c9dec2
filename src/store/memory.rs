//! In-memory ledger for tests and local runs.
//!
//! One mutex guards the whole ledger, so every operation observes and
//! mutates a consistent snapshot the way a store transaction would.

use super::{validate_accrual_update, validate_withdrawal, AccrualOutcome, LedgerStore};
use crate::domain::{Balance, Order, OrderStatus, User, Withdrawal};
use crate::error::{LoyaltyError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct LedgerState {
    users: HashMap<String, User>,
    /// Insertion order doubles as upload order
    orders: Vec<Order>,
    withdrawals: Vec<Withdrawal>,
    failing_updates: HashSet<String>,
    unavailable: bool,
    applied: Vec<(String, OrderStatus)>,
}

impl LedgerState {
    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(LoyaltyError::Unavailable {
                attempts: 1,
                causes: vec!["in-memory ledger marked unavailable".to_string()],
            });
        }
        Ok(())
    }

    fn order_mut(&mut self, id: &str) -> Option<&mut Order> {
        self.orders.iter_mut().find(|o| o.id == id)
    }
}

/// In-memory implementation of [`LedgerStore`].
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an order in any status (for test setup).
    pub async fn insert_order(&self, order: Order) {
        let mut state = self.state.lock().await;
        state.orders.retain(|o| o.id != order.id);
        state.orders.push(order);
    }

    /// Make every subsequent accrual write for `order_id` fail.
    pub async fn inject_update_failure(&self, order_id: &str) {
        self.state
            .lock()
            .await
            .failing_updates
            .insert(order_id.to_string());
    }

    /// Toggle a simulated outage: every operation fails with `Unavailable`.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Number of accrual writes that changed a row
    pub async fn accrual_writes(&self) -> usize {
        self.state.lock().await.applied.len()
    }

    /// Applied accrual writes in commit order
    pub async fn applied_updates(&self) -> Vec<(String, OrderStatus)> {
        self.state.lock().await.applied.clone()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn create_user(&self, login: &str, token: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        if state.users.contains_key(login) {
            return Err(LoyaltyError::AlreadyExists(format!("user {}", login)));
        }
        state.users.insert(
            login.to_string(),
            User {
                login: login.to_string(),
                token: token.to_string(),
                balance: Decimal::ZERO,
            },
        );
        Ok(())
    }

    async fn find_user(&self, login: &str) -> Result<User> {
        let state = self.state.lock().await;
        state.check_available()?;

        state
            .users
            .get(login)
            .cloned()
            .ok_or_else(|| LoyaltyError::NotFound(format!("user {}", login)))
    }

    async fn find_order(&self, id: &str) -> Result<Order> {
        let state = self.state.lock().await;
        state.check_available()?;

        state
            .orders
            .iter()
            .find(|o| o.id == id)
            .cloned()
            .ok_or_else(|| LoyaltyError::NotFound(format!("order {}", id)))
    }

    async fn create_order(&self, owner: &str, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        if !state.users.contains_key(owner) {
            return Err(LoyaltyError::NotFound(format!("user {}", owner)));
        }
        if state.orders.iter().any(|o| o.id == id) {
            return Err(LoyaltyError::AlreadyExists(format!("order {}", id)));
        }
        state.orders.push(Order::new(owner, id));
        Ok(())
    }

    async fn list_unresolved_orders(&self) -> Result<Vec<Order>> {
        let state = self.state.lock().await;
        state.check_available()?;

        let mut orders: Vec<Order> = state
            .orders
            .iter()
            .filter(|o| o.is_unresolved())
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        orders.sort_by_key(|o| o.uploaded_at);
        Ok(orders)
    }

    async fn list_user_orders(&self, owner: &str) -> Result<Vec<Order>> {
        let state = self.state.lock().await;
        state.check_available()?;

        let mut orders: Vec<Order> = state
            .orders
            .iter()
            .filter(|o| o.owner == owner)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.uploaded_at);
        Ok(orders)
    }

    async fn apply_accrual_update(&self, order: &Order) -> Result<AccrualOutcome> {
        validate_accrual_update(order)?;

        let mut state = self.state.lock().await;
        state.check_available()?;

        if state.failing_updates.contains(&order.id) {
            return Err(LoyaltyError::Internal(format!(
                "injected write failure for order {}",
                order.id
            )));
        }

        let Some(stored) = state.orders.iter().find(|o| o.id == order.id) else {
            return Err(LoyaltyError::NotFound(format!("order {}", order.id)));
        };
        if !order.status.predecessors().contains(&stored.status) {
            return Ok(AccrualOutcome::Skipped);
        }
        let owner = stored.owner.clone();
        if !state.users.contains_key(&owner) {
            return Err(LoyaltyError::NotFound(format!("user {}", owner)));
        }

        if let Some(stored) = state.order_mut(&order.id) {
            stored.status = order.status;
            stored.accrual = order.accrual;
        }
        if let Some(user) = state.users.get_mut(&owner) {
            user.balance += order.accrual;
        }

        state.applied.push((order.id.clone(), order.status));
        Ok(AccrualOutcome::Applied {
            credited: order.accrual,
        })
    }

    async fn withdraw(&self, owner: &str, spend_id: &str, amount: Decimal) -> Result<()> {
        validate_withdrawal(spend_id, amount)?;

        let mut state = self.state.lock().await;
        state.check_available()?;

        if state.withdrawals.iter().any(|w| w.order_id == spend_id) {
            return Err(LoyaltyError::AlreadyExists(format!("withdrawal {}", spend_id)));
        }

        let user = state
            .users
            .get_mut(owner)
            .ok_or_else(|| LoyaltyError::NotFound(format!("user {}", owner)))?;
        if user.balance < amount {
            return Err(LoyaltyError::InsufficientFunds {
                requested: amount,
                available: user.balance,
            });
        }
        user.balance -= amount;

        state.withdrawals.push(Withdrawal {
            order_id: spend_id.to_string(),
            owner: owner.to_string(),
            amount,
            processed_at: Utc::now(),
        });
        Ok(())
    }

    async fn user_statistic(&self, owner: &str) -> Result<Balance> {
        let state = self.state.lock().await;
        state.check_available()?;

        let user = state
            .users
            .get(owner)
            .ok_or_else(|| LoyaltyError::NotFound(format!("user {}", owner)))?;
        let withdrawn = state
            .withdrawals
            .iter()
            .filter(|w| w.owner == owner)
            .map(|w| w.amount)
            .sum();

        Ok(Balance {
            current: user.balance,
            withdrawn,
        })
    }

    async fn list_withdrawals(&self, owner: &str) -> Result<Vec<Withdrawal>> {
        let state = self.state.lock().await;
        state.check_available()?;

        Ok(state
            .withdrawals
            .iter()
            .filter(|w| w.owner == owner)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        self.state.lock().await.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn ledger_with_user() -> InMemoryLedger {
        let ledger = InMemoryLedger::new();
        ledger.create_user("alice", "token").await.unwrap();
        ledger
    }

    fn snapshot(id: &str, status: OrderStatus, accrual: Decimal) -> Order {
        Order {
            status,
            accrual,
            ..Order::new("alice", id)
        }
    }

    #[tokio::test]
    async fn test_create_order_is_unique() {
        let ledger = ledger_with_user().await;
        ledger.create_order("alice", "12345678903").await.unwrap();

        let err = ledger.create_order("alice", "12345678903").await.unwrap_err();
        assert!(matches!(err, LoyaltyError::AlreadyExists(_)));

        let err = ledger.create_order("bob", "79927398713").await.unwrap_err();
        assert!(matches!(err, LoyaltyError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_processed_update_credits_owner() {
        let ledger = ledger_with_user().await;
        ledger.create_order("alice", "1").await.unwrap();

        let outcome = ledger
            .apply_accrual_update(&snapshot("1", OrderStatus::Processed, dec!(500)))
            .await
            .unwrap();
        assert_eq!(outcome, AccrualOutcome::Applied { credited: dec!(500) });

        let balance = ledger.user_statistic("alice").await.unwrap();
        assert_eq!(balance.current, dec!(500));
        assert_eq!(balance.withdrawn, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_replayed_update_is_skipped() {
        let ledger = ledger_with_user().await;
        ledger.create_order("alice", "1").await.unwrap();

        let update = snapshot("1", OrderStatus::Processed, dec!(500));
        ledger.apply_accrual_update(&update).await.unwrap();
        let outcome = ledger.apply_accrual_update(&update).await.unwrap();

        assert_eq!(outcome, AccrualOutcome::Skipped);
        assert_eq!(ledger.find_user("alice").await.unwrap().balance, dec!(500));
        assert_eq!(ledger.accrual_writes().await, 1);
    }

    #[tokio::test]
    async fn test_backward_update_is_skipped() {
        let ledger = ledger_with_user().await;
        ledger
            .insert_order(snapshot("1", OrderStatus::Invalid, Decimal::ZERO))
            .await;

        let outcome = ledger
            .apply_accrual_update(&snapshot("1", OrderStatus::Processing, Decimal::ZERO))
            .await
            .unwrap();
        assert_eq!(outcome, AccrualOutcome::Skipped);
        assert_eq!(
            ledger.find_order("1").await.unwrap().status,
            OrderStatus::Invalid
        );
    }

    #[tokio::test]
    async fn test_update_to_new_is_rejected() {
        let ledger = ledger_with_user().await;
        ledger.create_order("alice", "1").await.unwrap();

        let err = ledger
            .apply_accrual_update(&snapshot("1", OrderStatus::New, Decimal::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, LoyaltyError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_withdraw_requires_funds() {
        let ledger = ledger_with_user().await;
        ledger.create_order("alice", "1").await.unwrap();
        ledger
            .apply_accrual_update(&snapshot("1", OrderStatus::Processed, dec!(100)))
            .await
            .unwrap();

        let err = ledger
            .withdraw("alice", "2377225624", dec!(150))
            .await
            .unwrap_err();
        assert!(matches!(err, LoyaltyError::InsufficientFunds { .. }));

        ledger.withdraw("alice", "2377225624", dec!(60)).await.unwrap();
        let balance = ledger.user_statistic("alice").await.unwrap();
        assert_eq!(balance.current, dec!(40));
        assert_eq!(balance.withdrawn, dec!(60));
        assert_eq!(balance.total_accrued(), dec!(100));

        let err = ledger
            .withdraw("alice", "2377225624", dec!(10))
            .await
            .unwrap_err();
        assert!(matches!(err, LoyaltyError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_sub_cent_amounts_are_rejected() {
        let ledger = ledger_with_user().await;
        ledger.create_order("alice", "1").await.unwrap();

        let err = ledger
            .apply_accrual_update(&snapshot("1", OrderStatus::Processed, dec!(1.005)))
            .await
            .unwrap_err();
        assert!(matches!(err, LoyaltyError::Validation(_)));
        assert_eq!(ledger.accrual_writes().await, 0);

        ledger
            .apply_accrual_update(&snapshot("1", OrderStatus::Processed, dec!(1.00)))
            .await
            .unwrap();
        let err = ledger
            .withdraw("alice", "2377225624", dec!(0.995))
            .await
            .unwrap_err();
        assert!(matches!(err, LoyaltyError::Validation(_)));

        let balance = ledger.user_statistic("alice").await.unwrap();
        assert_eq!(balance.current, dec!(1));
        assert_eq!(balance.withdrawn, Decimal::ZERO);
        assert!(ledger.list_withdrawals("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_ledger_fails_every_call() {
        let ledger = ledger_with_user().await;
        ledger.set_unavailable(true).await;

        assert!(matches!(
            ledger.list_unresolved_orders().await,
            Err(LoyaltyError::Unavailable { .. })
        ));
        assert!(ledger.ping().await.is_err());

        ledger.set_unavailable(false).await;
        assert!(ledger.ping().await.is_ok());
    }
}
