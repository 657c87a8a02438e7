// Core infrastructure shared by every component

pub mod config;
pub mod errors;
pub mod logging;

// Re-export commonly used types
pub use config::{ConfigOverrides, EngineConfig, EngineConfigBuilder, RetryStrategy};
pub use errors::{JobGraphError, Result};
pub use logging::init_logging;
