pub mod balance;
pub mod breaker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod state;
pub mod upstream;

// Re-export the types tests and the binary wire together.
pub use crate::config::GatewayConfig;
pub use crate::dispatch::router;
pub use crate::error::{ConfigError, GatewayError};
pub use crate::metrics::GatewayMetrics;
pub use crate::state::AppState;
