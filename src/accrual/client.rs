use super::{AccrualReply, AccrualSource};
use crate::domain::AccrualReport;
use crate::error::{GatewayError, LoyaltyError, Result, RetryError};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// HTTP client for the accrual system's `GET /api/orders/{number}`
#[derive(Clone)]
pub struct AccrualClient {
    http: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl AccrualClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(LoyaltyError::InvalidConfig(
                "accrual system address is empty".to_string(),
            ));
        }

        let http = Client::builder()
            .user_agent(concat!("loyalty/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .map_err(|e| {
                LoyaltyError::Internal(format!("failed to build accrual HTTP client: {}", e))
            })?;

        Ok(Self {
            http,
            base_url,
            retry: RetryPolicy::accrual_gateway(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn order_url(&self, order_id: &str) -> String {
        format!("{}/api/orders/{}", self.base_url, order_id)
    }

    async fn fetch_once(&self, url: &str) -> std::result::Result<AccrualReply, GatewayError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = resp.status();
        match status {
            StatusCode::OK => {
                let body = resp
                    .bytes()
                    .await
                    .map_err(|e| GatewayError::Transport(e.to_string()))?;
                let report: AccrualReport = serde_json::from_slice(&body)
                    .map_err(|e| GatewayError::Decode(e.to_string()))?;
                Ok(AccrualReply::Known(report))
            }
            StatusCode::NO_CONTENT => Ok(AccrualReply::NotRegistered),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = resp
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                Ok(AccrualReply::RateLimited { retry_after })
            }
            other => Err(GatewayError::UnknownStatus(other.as_u16())),
        }
    }
}

#[async_trait]
impl AccrualSource for AccrualClient {
    #[instrument(skip(self))]
    async fn fetch_status(
        &self,
        order_id: &str,
    ) -> std::result::Result<AccrualReply, GatewayError> {
        let url = self.order_url(order_id);

        let reply = self
            .retry
            .run(
                || self.fetch_once(&url),
                |e| matches!(e, GatewayError::Transport(_)),
            )
            .await
            .map_err(|e| match e {
                RetryError::Exhausted { attempts, causes } => {
                    GatewayError::Exhausted { attempts, causes }
                }
                RetryError::Permanent(e) => e,
            })?;

        match &reply {
            AccrualReply::Known(report) => {
                debug!("Order {} reported {}", order_id, report.status)
            }
            AccrualReply::NotRegistered => debug!("Order {} not registered", order_id),
            AccrualReply::RateLimited { retry_after } => {
                warn!("Accrual system rate limited us (retry after {:?})", retry_after)
            }
        }
        Ok(reply)
    }
}

/// `Retry-After` in delta-seconds form; HTTP dates are ignored
fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}
