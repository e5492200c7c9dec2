pub mod accrual;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod engine;
pub mod error;
pub mod retry;
pub mod services;
pub mod store;

pub use accrual::{AccrualClient, AccrualReply, AccrualSource};
pub use config::AppConfig;
pub use coordination::{GracefulShutdown, ShutdownSignal};
pub use engine::{Engine, EngineConfig, EngineHandle};
pub use error::{GatewayError, LoyaltyError, Result};
pub use retry::RetryPolicy;
pub use services::{EngineStats, LoyaltyService, SubmitOutcome};
pub use store::{InMemoryLedger, LedgerStore, PostgresLedger};
