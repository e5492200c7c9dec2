//! Client-facing operations on the ledger: the calls an HTTP layer makes on
//! behalf of an authenticated user.

use crate::domain::{Balance, Order, Withdrawal};
use crate::error::{LoyaltyError, Result};
use crate::store::LedgerStore;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Result of uploading an order number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// New order, queued for accrual
    Accepted,
    /// The same user already uploaded this order
    AlreadyUploaded,
}

#[derive(Clone)]
pub struct LoyaltyService {
    store: Arc<dyn LedgerStore>,
}

impl LoyaltyService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, token))]
    pub async fn register_user(&self, login: &str, token: &str) -> Result<()> {
        if login.trim().is_empty() {
            return Err(LoyaltyError::Validation("login must not be empty".to_string()));
        }
        self.store.create_user(login, token).await?;
        info!("Registered user {}", login);
        Ok(())
    }

    /// Upload an order number for accrual.
    ///
    /// The insert is attempted first; only when the store reports a duplicate
    /// is the existing row read to tell a re-upload from someone else's order.
    #[instrument(skip(self))]
    pub async fn submit_order(&self, owner: &str, order_id: &str) -> Result<SubmitOutcome> {
        if order_id.trim().is_empty() {
            return Err(LoyaltyError::Validation("order number must not be empty".to_string()));
        }

        match self.store.create_order(owner, order_id).await {
            Ok(()) => {
                info!("Accepted order {} from {}", order_id, owner);
                Ok(SubmitOutcome::Accepted)
            }
            Err(LoyaltyError::AlreadyExists(_)) => {
                let existing = self.store.find_order(order_id).await?;
                if existing.owner == owner {
                    debug!("Order {} already uploaded by {}", order_id, owner);
                    Ok(SubmitOutcome::AlreadyUploaded)
                } else {
                    Err(LoyaltyError::OrderOwnedByOther {
                        order_id: order_id.to_string(),
                    })
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn orders(&self, owner: &str) -> Result<Vec<Order>> {
        self.store.list_user_orders(owner).await
    }

    pub async fn balance(&self, owner: &str) -> Result<Balance> {
        self.store.user_statistic(owner).await
    }

    #[instrument(skip(self))]
    pub async fn withdraw(&self, owner: &str, spend_id: &str, amount: Decimal) -> Result<()> {
        self.store.withdraw(owner, spend_id, amount).await
    }

    pub async fn withdrawals(&self, owner: &str) -> Result<Vec<Withdrawal>> {
        self.store.list_withdrawals(owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLedger;
    use rust_decimal_macros::dec;

    async fn service() -> LoyaltyService {
        let service = LoyaltyService::new(Arc::new(InMemoryLedger::new()));
        service.register_user("alice", "a-token").await.unwrap();
        service.register_user("bob", "b-token").await.unwrap();
        service
    }

    #[tokio::test]
    async fn test_submit_order_outcomes() {
        let service = service().await;

        assert_eq!(
            service.submit_order("alice", "12345678903").await.unwrap(),
            SubmitOutcome::Accepted
        );
        assert_eq!(
            service.submit_order("alice", "12345678903").await.unwrap(),
            SubmitOutcome::AlreadyUploaded
        );

        let err = service.submit_order("bob", "12345678903").await.unwrap_err();
        assert!(matches!(err, LoyaltyError::OrderOwnedByOther { .. }));
        assert_eq!(err.status_hint(), 409);
    }

    #[tokio::test]
    async fn test_duplicate_registration_conflicts() {
        let service = service().await;
        let err = service.register_user("alice", "other").await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_withdraw_without_balance() {
        let service = service().await;
        let err = service
            .withdraw("alice", "2377225624", dec!(751))
            .await
            .unwrap_err();
        assert_eq!(err.status_hint(), 402);
        assert!(service.withdrawals("alice").await.unwrap().is_empty());
        assert_eq!(service.balance("alice").await.unwrap(), Balance::default());
    }
}
