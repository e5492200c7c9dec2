pub mod health;
pub mod loyalty;
pub mod stats;

pub use health::{ComponentHealth, HealthResponse, HealthServer, HealthState, HealthStatus};
pub use loyalty::{LoyaltyService, SubmitOutcome};
pub use stats::{EngineStats, StatsSnapshot};
