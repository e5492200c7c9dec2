use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Registered user and their spendable balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub login: String,
    /// Opaque credential, issued and checked outside the ledger
    #[serde(skip_serializing, default)]
    pub token: String,
    pub balance: Decimal,
}

/// Spending of accrued balance against an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawal {
    /// Spending reference, unrelated to accrual order numbers
    #[serde(rename = "order")]
    pub order_id: String,
    #[serde(skip_serializing, default)]
    pub owner: String,
    #[serde(rename = "sum")]
    pub amount: Decimal,
    pub processed_at: DateTime<Utc>,
}

/// Decimal places the ledger stores for every amount (`NUMERIC(14, 2)`)
pub const MONEY_SCALE: u32 = 2;

/// Whether `amount` is representable at ledger precision without rounding
pub fn fits_money_scale(amount: Decimal) -> bool {
    amount.normalize().scale() <= MONEY_SCALE
}

/// Consistent balance snapshot for one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Balance {
    pub current: Decimal,
    pub withdrawn: Decimal,
}

impl Balance {
    /// Lifetime accrual credited to the user
    pub fn total_accrued(&self) -> Decimal {
        self.current + self.withdrawn
    }
}
