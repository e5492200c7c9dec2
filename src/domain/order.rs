use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Local order status
///
/// `NEW -> PROCESSING -> {INVALID | PROCESSED}`; the last two are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Uploaded, not yet seen by the accrual system
    New,
    /// Registered by the accrual system, not yet priced
    Processing,
    /// Rejected by the accrual system
    Invalid,
    /// Priced; the accrual has been credited
    Processed,
}

impl OrderStatus {
    pub const UNRESOLVED: [OrderStatus; 2] = [OrderStatus::New, OrderStatus::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }

    /// Check if this status can move forward to `target`
    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        use OrderStatus::*;

        match (self, target) {
            (New, Processing) => true,
            (New, Invalid) | (Processing, Invalid) => true,
            (New, Processed) | (Processing, Processed) => true,
            _ => false,
        }
    }

    /// Statuses a row may hold for a write of `self` to be legal
    pub fn predecessors(&self) -> &'static [OrderStatus] {
        match self {
            OrderStatus::New => &[],
            OrderStatus::Processing => &[OrderStatus::New],
            OrderStatus::Invalid | OrderStatus::Processed => &OrderStatus::UNRESOLVED,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for OrderStatus {
    type Error = String;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        match raw {
            "NEW" => Ok(OrderStatus::New),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "INVALID" => Ok(OrderStatus::Invalid),
            "PROCESSED" => Ok(OrderStatus::Processed),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// Order uploaded by a user for accrual
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Externally supplied order number
    pub id: String,
    /// Login of the uploading user
    pub owner: String,
    pub status: OrderStatus,
    /// Credited amount; zero unless `status == PROCESSED`
    pub accrual: Decimal,
    pub uploaded_at: DateTime<Utc>,
}

impl Order {
    /// A freshly uploaded order
    pub fn new(owner: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            status: OrderStatus::New,
            accrual: Decimal::ZERO,
            uploaded_at: Utc::now(),
        }
    }

    pub fn is_unresolved(&self) -> bool {
        !self.status.is_terminal()
    }
}
