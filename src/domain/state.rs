//! Accrual-driven order state machine
//!
//! Maps the status the accrual system reports for an order onto the local
//! status table. The decision is a pure function of the persisted order
//! snapshot and the report, so a cycle that re-reads the latest row always
//! computes the next legal step and never a backward one.

use super::{Order, OrderStatus, MONEY_SCALE};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Order status as reported by the accrual system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccrualStatus {
    /// Known to the accrual system, not yet priced
    Registered,
    /// Rejected; no accrual will be granted
    Invalid,
    /// Being priced
    Processing,
    /// Priced; `accrual` holds the amount
    Processed,
    /// Anything the accrual system added after this client was written
    #[serde(other)]
    Unknown,
}

impl AccrualStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccrualStatus::Registered => "REGISTERED",
            AccrualStatus::Invalid => "INVALID",
            AccrualStatus::Processing => "PROCESSING",
            AccrualStatus::Processed => "PROCESSED",
            AccrualStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for AccrualStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Body of a successful accrual status response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccrualReport {
    pub order: String,
    pub status: AccrualStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Decimal>,
}

impl AccrualReport {
    pub fn new(order: impl Into<String>, status: AccrualStatus) -> Self {
        Self {
            order: order.into(),
            status,
            accrual: None,
        }
    }

    pub fn processed(order: impl Into<String>, accrual: Decimal) -> Self {
        Self {
            order: order.into(),
            status: AccrualStatus::Processed,
            accrual: Some(accrual),
        }
    }
}

/// Compute the next snapshot of `order` given the accrual system's report.
///
/// Returns `None` when nothing changes this cycle, so callers only queue
/// real transitions for writing.
pub fn decide_transition(order: &Order, report: &AccrualReport) -> Option<Order> {
    if order.status.is_terminal() {
        return None;
    }

    let (status, accrual) = match report.status {
        AccrualStatus::Registered if order.status == OrderStatus::New => {
            (OrderStatus::Processing, Decimal::ZERO)
        }
        AccrualStatus::Registered | AccrualStatus::Processing => return None,
        AccrualStatus::Invalid => (OrderStatus::Invalid, Decimal::ZERO),
        AccrualStatus::Processed => {
            let amount = report.accrual.unwrap_or(Decimal::ZERO);
            if amount < Decimal::ZERO {
                warn!(
                    "Refusing negative accrual {} for order {}",
                    amount, order.id
                );
                return None;
            }
            let credited =
                amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);
            if credited != amount {
                warn!(
                    "Accrual {} for order {} rounded to {}",
                    amount, order.id, credited
                );
            }
            (OrderStatus::Processed, credited)
        }
        AccrualStatus::Unknown => {
            warn!("Unknown accrual status for order {}", order.id);
            return None;
        }
    };

    debug_assert!(order.status.can_transition_to(status));

    Some(Order {
        status,
        accrual,
        ..order.clone()
    })
}
