//! Domain-driven configuration management for drover
//!
//! Configuration is split by functional domain (cluster lifecycle, logging),
//! loaded from YAML, overridden by `DROVER_*` environment variables and
//! validated before use.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    cluster::ClusterConfig,
    logging::{LogFormat, LoggingConfig},
    DroverConfig,
};

// Re-export utilities
pub use domains::utils::serde_duration_ms;
