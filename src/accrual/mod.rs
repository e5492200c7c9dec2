//! Accrual Gateway: the external service that prices orders
//!
//! [`AccrualSource`] is the seam the scheduler polls through; [`AccrualClient`]
//! is the HTTP implementation.

mod client;

pub use client::AccrualClient;

use crate::domain::AccrualReport;
use crate::error::GatewayError;
use async_trait::async_trait;
use std::time::Duration;

/// What the accrual system said about one order
#[derive(Debug, Clone, PartialEq)]
pub enum AccrualReply {
    /// The order is known; the report carries its status
    Known(AccrualReport),
    /// The order is not registered with the accrual system (yet)
    NotRegistered,
    /// Too many requests; stop polling for a while
    RateLimited { retry_after: Option<Duration> },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccrualSource: Send + Sync {
    /// Query the accrual status of one order
    async fn fetch_status(&self, order_id: &str) -> Result<AccrualReply, GatewayError>;
}
