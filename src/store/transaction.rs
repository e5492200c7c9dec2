//! Scoped transactions for multi-row ledger writes

use crate::error::{LoyaltyError, Result};
use sqlx::postgres::PgPool;
use sqlx::{PgConnection, Postgres, Transaction};
use tracing::{debug, warn};

/// Transaction scope identifier for tracking and debugging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionScope {
    /// Order status/accrual write with owner credit
    AccrualUpdate,
    /// Balance debit with withdrawal record
    Withdrawal,
}

impl std::fmt::Display for TransactionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AccrualUpdate => write!(f, "accrual_update"),
            Self::Withdrawal => write!(f, "withdrawal"),
        }
    }
}

/// Transaction wrapper that logs its scope and warns on implicit rollback
pub struct ManagedTransaction {
    tx: Option<Transaction<'static, Postgres>>,
    scope: TransactionScope,
    committed: bool,
}

impl ManagedTransaction {
    /// Begin a new transaction with scope tracking
    pub async fn begin(pool: &PgPool, scope: TransactionScope) -> Result<Self> {
        let tx = pool.begin().await?;
        debug!("Started transaction for scope: {}", scope);
        Ok(Self {
            tx: Some(tx),
            scope,
            committed: false,
        })
    }

    /// Connection for executing queries: `.execute(tx.executor()?)`
    pub fn executor(&mut self) -> Result<&mut PgConnection> {
        let scope = self.scope;
        let tx = self.tx.as_mut().ok_or_else(|| {
            LoyaltyError::Internal(format!("transaction {} already finished", scope))
        })?;
        Ok(&mut **tx)
    }

    /// Commit the transaction
    pub async fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
            self.committed = true;
            debug!("Committed transaction for scope: {}", self.scope);
        }
        Ok(())
    }

    /// Rollback the transaction explicitly
    pub async fn rollback(mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
            debug!("Rolled back transaction for scope: {}", self.scope);
        }
        Ok(())
    }
}

impl Drop for ManagedTransaction {
    fn drop(&mut self) {
        if self.tx.is_some() && !self.committed {
            // sqlx rolls back a dropped transaction
            warn!(
                "Transaction for scope {} was dropped without commit - rolling back",
                self.scope
            );
        }
    }
}
