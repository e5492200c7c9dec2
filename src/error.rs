use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for the loyalty backend
#[derive(Error, Debug)]
pub enum LoyaltyError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Accrual gateway error: {0}")]
    Gateway(#[from] GatewayError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Ledger conflicts, returned to callers as typed results
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Order {order_id} was uploaded by another user")]
    OrderOwnedByOther { order_id: String },

    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: Decimal,
        available: Decimal,
    },

    #[error("Store unavailable after {attempts} attempts: {}", .causes.join("; "))]
    Unavailable { attempts: usize, causes: Vec<String> },

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl LoyaltyError {
    /// Data-integrity conflicts: non-retriable, reported to the caller, not logged as failures.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            LoyaltyError::AlreadyExists(_)
                | LoyaltyError::OrderOwnedByOther { .. }
                | LoyaltyError::InsufficientFunds { .. }
        )
    }

    /// HTTP status the API layer should answer with for this error.
    pub fn status_hint(&self) -> u16 {
        match self {
            LoyaltyError::NotFound(_) => 404,
            LoyaltyError::AlreadyExists(_) | LoyaltyError::OrderOwnedByOther { .. } => 409,
            LoyaltyError::InsufficientFunds { .. } => 402,
            LoyaltyError::Validation(_) => 422,
            LoyaltyError::Unavailable { .. } => 503,
            _ => 500,
        }
    }
}

/// Result type alias for LoyaltyError
pub type Result<T> = std::result::Result<T, LoyaltyError>;

/// Failures of a single accrual status request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unknown status code from accrual system: {0}")]
    UnknownStatus(u16),

    #[error("Malformed accrual response: {0}")]
    Decode(String),

    #[error("Request limit exceeded after {attempts} attempts: {}", .causes.join("; "))]
    Exhausted { attempts: usize, causes: Vec<String> },

    #[error("Accrual request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
}

/// Outcome of an operation run under a [`crate::retry::RetryPolicy`]
#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {}", .causes.join("; "))]
    Exhausted { attempts: usize, causes: Vec<String> },

    #[error(transparent)]
    Permanent(E),
}

impl<E> RetryError<E> {
    pub fn map_permanent<F, T>(self, f: F) -> RetryError<T>
    where
        F: FnOnce(E) -> T,
    {
        match self {
            RetryError::Exhausted { attempts, causes } => RetryError::Exhausted { attempts, causes },
            RetryError::Permanent(e) => RetryError::Permanent(f(e)),
        }
    }
}
