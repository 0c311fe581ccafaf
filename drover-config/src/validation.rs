//! Configuration validation traits and utilities

use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Trait for validatable configuration
pub trait Validatable {
    /// Validate the configuration
    fn validate(&self) -> ConfigResult<()>;

    /// Get the domain name for error reporting
    fn domain_name(&self) -> &'static str;

    /// Helper to create a domain-specific validation error
    fn validation_error(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::DomainError {
            domain: self.domain_name().to_string(),
            message: message.into(),
        }
    }
}

/// Validate a positive number
pub fn validate_positive<T>(value: T, field_name: &str, domain: &str) -> ConfigResult<()>
where
    T: PartialOrd + Default + std::fmt::Display,
{
    if value <= T::default() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} must be greater than 0, got {}", field_name, value),
        });
    }
    Ok(())
}

/// Validate a timeout is non-zero and not absurdly long
pub fn validate_timeout(value: Duration, field_name: &str, domain: &str) -> ConfigResult<()> {
    validate_positive(value.as_millis(), field_name, domain)?;

    if value > Duration::from_secs(3600) {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} must not exceed one hour, got {:?}", field_name, value),
        });
    }

    Ok(())
}
