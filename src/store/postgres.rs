use super::transaction::{ManagedTransaction, TransactionScope};
use super::{validate_accrual_update, validate_withdrawal, AccrualOutcome, LedgerStore};
use crate::domain::{Balance, Order, OrderStatus, User, Withdrawal};
use crate::error::{LoyaltyError, Result, RetryError};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// PostgreSQL ledger
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresLedger {
    /// Connect a new pool
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self::from_pool(pool))
    }

    /// Reuse an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::ledger_store(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run one store operation under the retry policy, surfacing exhaustion as `Unavailable`
    async fn retrying<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry
            .run(op, is_transient)
            .await
            .map_err(|e| match e {
                RetryError::Exhausted { attempts, causes } => {
                    LoyaltyError::Unavailable { attempts, causes }
                }
                RetryError::Permanent(e) => e,
            })
    }

    async fn insert_user(&self, login: &str, token: &str) -> Result<()> {
        sqlx::query(r#"INSERT INTO users (login, token) VALUES ($1, $2)"#)
            .bind(login)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, || format!("user {}", login), || login.to_string()))?;
        Ok(())
    }

    async fn select_user(&self, login: &str) -> Result<User> {
        let row = sqlx::query(r#"SELECT login, token, balance FROM users WHERE login = $1"#)
            .bind(login)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(User {
                login: r.try_get("login")?,
                token: r.try_get("token")?,
                balance: r.try_get("balance")?,
            }),
            None => Err(LoyaltyError::NotFound(format!("user {}", login))),
        }
    }

    async fn select_order(&self, id: &str) -> Result<Order> {
        let row = sqlx::query(
            r#"
            SELECT id, owner, status, accrual, uploaded_at
            FROM orders WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => order_from_row(&r),
            None => Err(LoyaltyError::NotFound(format!("order {}", id))),
        }
    }

    async fn insert_order(&self, owner: &str, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (id, owner, status, accrual, uploaded_at)
            VALUES ($1, $2, 'NEW', 0, NOW())
            "#,
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, || format!("order {}", id), || format!("user {}", owner)))?;

        debug!("Inserted order {} for {}", id, owner);
        Ok(())
    }

    async fn select_orders(&self, owner: Option<&str>) -> Result<Vec<Order>> {
        let rows = match owner {
            Some(owner) => {
                sqlx::query(
                    r#"
                    SELECT id, owner, status, accrual, uploaded_at
                    FROM orders
                    WHERE owner = $1
                    ORDER BY uploaded_at ASC, id ASC
                    "#,
                )
                .bind(owner)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, owner, status, accrual, uploaded_at
                    FROM orders
                    WHERE status IN ('NEW', 'PROCESSING')
                    ORDER BY uploaded_at ASC, id ASC
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(order_from_row).collect()
    }

    async fn update_accrual(&self, order: &Order) -> Result<AccrualOutcome> {
        let predecessors: Vec<String> = order
            .status
            .predecessors()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let mut tx = ManagedTransaction::begin(&self.pool, TransactionScope::AccrualUpdate).await?;

        // Guarded on the persisted status so a replayed or stale snapshot is a no-op
        let owner: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE orders SET status = $2, accrual = $3
            WHERE id = $1 AND status = ANY($4)
            RETURNING owner
            "#,
        )
        .bind(&order.id)
        .bind(order.status.as_str())
        .bind(order.accrual)
        .bind(&predecessors)
        .fetch_optional(tx.executor()?)
        .await?;

        let Some(owner) = owner else {
            tx.rollback().await?;
            debug!(
                "Order {} no longer in {:?}, skipping {} write",
                order.id, predecessors, order.status
            );
            return Ok(AccrualOutcome::Skipped);
        };

        if !order.accrual.is_zero() {
            let credited = sqlx::query(
                r#"UPDATE users SET balance = balance + $2 WHERE login = $1"#,
            )
            .bind(&owner)
            .bind(order.accrual)
            .execute(tx.executor()?)
            .await?;

            if credited.rows_affected() == 0 {
                return Err(LoyaltyError::NotFound(format!("user {}", owner)));
            }
        }

        tx.commit().await?;
        info!(
            "Order {} -> {} (credited {} to {})",
            order.id, order.status, order.accrual, owner
        );
        Ok(AccrualOutcome::Applied {
            credited: order.accrual,
        })
    }

    async fn debit(&self, owner: &str, spend_id: &str, amount: Decimal) -> Result<()> {
        let mut tx = ManagedTransaction::begin(&self.pool, TransactionScope::Withdrawal).await?;

        // Row lock serializes concurrent withdrawals for the same user
        let balance: Option<Decimal> =
            sqlx::query_scalar(r#"SELECT balance FROM users WHERE login = $1 FOR UPDATE"#)
                .bind(owner)
                .fetch_optional(tx.executor()?)
                .await?;

        let Some(balance) = balance else {
            tx.rollback().await?;
            return Err(LoyaltyError::NotFound(format!("user {}", owner)));
        };

        if balance < amount {
            tx.rollback().await?;
            return Err(LoyaltyError::InsufficientFunds {
                requested: amount,
                available: balance,
            });
        }

        sqlx::query(r#"UPDATE users SET balance = balance - $2 WHERE login = $1"#)
            .bind(owner)
            .bind(amount)
            .execute(tx.executor()?)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO withdrawals (order_id, owner, amount, processed_at)
            VALUES ($1, $2, $3, NOW())
            "#,
        )
        .bind(spend_id)
        .bind(owner)
        .bind(amount)
        .execute(tx.executor()?)
        .await
        .map_err(|e| {
            classify(
                e,
                || format!("withdrawal {}", spend_id),
                || format!("user {}", owner),
            )
        })?;

        tx.commit().await?;
        info!("Withdrew {} from {} for order {}", amount, owner, spend_id);
        Ok(())
    }

    async fn select_balance(&self, owner: &str) -> Result<Balance> {
        // One statement, one snapshot
        let row = sqlx::query(
            r#"
            SELECT u.balance AS current,
                   COALESCE((SELECT SUM(w.amount) FROM withdrawals w WHERE w.owner = u.login), 0)
                       AS withdrawn
            FROM users u
            WHERE u.login = $1
            "#,
        )
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Balance {
                current: r.try_get("current")?,
                withdrawn: r.try_get("withdrawn")?,
            }),
            None => Err(LoyaltyError::NotFound(format!("user {}", owner))),
        }
    }

    async fn select_withdrawals(&self, owner: &str) -> Result<Vec<Withdrawal>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, owner, amount, processed_at
            FROM withdrawals
            WHERE owner = $1
            ORDER BY processed_at ASC
            "#,
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                Ok(Withdrawal {
                    order_id: r.try_get("order_id")?,
                    owner: r.try_get("owner")?,
                    amount: r.try_get("amount")?,
                    processed_at: r.try_get("processed_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl LedgerStore for PostgresLedger {
    #[instrument(skip(self, token))]
    async fn create_user(&self, login: &str, token: &str) -> Result<()> {
        self.retrying(move || self.insert_user(login, token)).await
    }

    async fn find_user(&self, login: &str) -> Result<User> {
        self.retrying(move || self.select_user(login)).await
    }

    async fn find_order(&self, id: &str) -> Result<Order> {
        self.retrying(move || self.select_order(id)).await
    }

    #[instrument(skip(self))]
    async fn create_order(&self, owner: &str, id: &str) -> Result<()> {
        self.retrying(move || self.insert_order(owner, id)).await
    }

    async fn list_unresolved_orders(&self) -> Result<Vec<Order>> {
        self.retrying(move || self.select_orders(None)).await
    }

    async fn list_user_orders(&self, owner: &str) -> Result<Vec<Order>> {
        self.retrying(move || self.select_orders(Some(owner))).await
    }

    #[instrument(skip(self, order), fields(order_id = %order.id, status = %order.status))]
    async fn apply_accrual_update(&self, order: &Order) -> Result<AccrualOutcome> {
        validate_accrual_update(order)?;
        self.retrying(move || self.update_accrual(order)).await
    }

    #[instrument(skip(self))]
    async fn withdraw(&self, owner: &str, spend_id: &str, amount: Decimal) -> Result<()> {
        validate_withdrawal(spend_id, amount)?;
        self.retrying(move || self.debit(owner, spend_id, amount)).await
    }

    async fn user_statistic(&self, owner: &str) -> Result<Balance> {
        self.retrying(move || self.select_balance(owner)).await
    }

    async fn list_withdrawals(&self, owner: &str) -> Result<Vec<Withdrawal>> {
        self.retrying(move || self.select_withdrawals(owner)).await
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn order_from_row(row: &PgRow) -> Result<Order> {
    let status: String = row.try_get("status")?;
    Ok(Order {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        status: OrderStatus::try_from(status.as_str()).map_err(LoyaltyError::Internal)?,
        accrual: row.try_get("accrual")?,
        uploaded_at: row.try_get("uploaded_at")?,
    })
}

/// Map constraint violations onto ledger conflicts; everything else stays a database error
fn classify(
    err: sqlx::Error,
    duplicate: impl FnOnce() -> String,
    missing: impl FnOnce() -> String,
) -> LoyaltyError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return LoyaltyError::AlreadyExists(duplicate());
        }
        if db.is_foreign_key_violation() {
            return LoyaltyError::NotFound(missing());
        }
    }
    LoyaltyError::Database(err)
}

/// Connection exceptions and serialization conflicts are worth another attempt
fn is_transient(err: &LoyaltyError) -> bool {
    let LoyaltyError::Database(err) = err else {
        return false;
    };

    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| is_transient_sqlstate(&code))
            .unwrap_or(false),
        _ => false,
    }
}

fn is_transient_sqlstate(code: &str) -> bool {
    // 08xxx connection exception, 40001 serialization failure, 40P01 deadlock
    code.starts_with("08") || code == "40001" || code == "40P01"
}
