//! Ledger Store: durable users, orders and withdrawals
//!
//! Every operation that touches more than one row runs in a single store
//! transaction. Cross-row invariants (balance vs. accrual, balance vs.
//! withdrawals) are enforced here and nowhere else.

pub mod memory;
pub mod postgres;
pub mod transaction;

pub use memory::InMemoryLedger;
pub use postgres::PostgresLedger;
pub use transaction::{ManagedTransaction, TransactionScope};

use crate::domain::{fits_money_scale, Balance, Order, User, Withdrawal, MONEY_SCALE};
use crate::error::{LoyaltyError, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Result of writing one computed transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccrualOutcome {
    /// Status written; `credited` added to the owner's balance
    Applied { credited: Decimal },
    /// The persisted row was no longer in a predecessor state; nothing written
    Skipped,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn create_user(&self, login: &str, token: &str) -> Result<()>;

    async fn find_user(&self, login: &str) -> Result<User>;

    async fn find_order(&self, id: &str) -> Result<Order>;

    /// Insert a `NEW` order. Uniqueness is enforced by the store:
    /// a second insert of the same id fails with `AlreadyExists`.
    async fn create_order(&self, owner: &str, id: &str) -> Result<()>;

    /// Orders in `NEW` or `PROCESSING`, oldest first
    async fn list_unresolved_orders(&self) -> Result<Vec<Order>>;

    /// Orders uploaded by `owner`, oldest first
    async fn list_user_orders(&self, owner: &str) -> Result<Vec<Order>>;

    /// Write the order's new status and accrual and credit its owner, atomically
    async fn apply_accrual_update(&self, order: &Order) -> Result<AccrualOutcome>;

    /// Spend `amount` of `owner`'s balance against `spend_id`
    async fn withdraw(&self, owner: &str, spend_id: &str, amount: Decimal) -> Result<()>;

    async fn user_statistic(&self, owner: &str) -> Result<Balance>;

    /// Withdrawals of `owner`, oldest first
    async fn list_withdrawals(&self, owner: &str) -> Result<Vec<Withdrawal>>;

    /// Cheap liveness probe
    async fn ping(&self) -> Result<()>;
}

/// Checks shared by every store before an accrual write
pub(crate) fn validate_accrual_update(order: &Order) -> Result<()> {
    if order.status.predecessors().is_empty() {
        return Err(LoyaltyError::InvalidStateTransition {
            from: "any".to_string(),
            to: order.status.to_string(),
        });
    }
    if order.accrual < Decimal::ZERO {
        return Err(LoyaltyError::Validation(format!(
            "negative accrual {} for order {}",
            order.accrual, order.id
        )));
    }
    if !fits_money_scale(order.accrual) {
        return Err(LoyaltyError::Validation(format!(
            "accrual {} for order {} has more than {} decimal places",
            order.accrual, order.id, MONEY_SCALE
        )));
    }
    if !order.accrual.is_zero() && order.status != crate::domain::OrderStatus::Processed {
        return Err(LoyaltyError::Validation(format!(
            "accrual on order {} in status {}",
            order.id, order.status
        )));
    }
    Ok(())
}

/// Checks shared by every store before a withdrawal
pub(crate) fn validate_withdrawal(spend_id: &str, amount: Decimal) -> Result<()> {
    if spend_id.trim().is_empty() {
        return Err(LoyaltyError::Validation("empty withdrawal order".to_string()));
    }
    if amount <= Decimal::ZERO {
        return Err(LoyaltyError::Validation(format!(
            "withdrawal amount must be positive, got {}",
            amount
        )));
    }
    if !fits_money_scale(amount) {
        return Err(LoyaltyError::Validation(format!(
            "withdrawal amount {} has more than {} decimal places",
            amount, MONEY_SCALE
        )));
    }
    Ok(())
}
