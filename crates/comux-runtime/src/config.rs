//! Machine configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```ignore
//! use comux_runtime::MachineConfig;
//!
//! // Defaults with env overrides
//! let config = MachineConfig::from_env();
//!
//! // Or customized programmatically
//! let config = MachineConfig::from_env()
//!     .default_stack_size(64 * 1024)
//!     .max_coroutines(128);
//! ```

use comux_core::constants::{DEFAULT_MAX_COROUTINES, DEFAULT_STACK_SIZE};
use comux_core::env::env_get;

/// Machine configuration with builder-style setters.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Stack size for coroutines that don't override it
    pub default_stack_size: usize,
    /// Ceiling on live coroutine ids
    pub max_coroutines: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl MachineConfig {
    /// Create config from compile-time defaults with environment
    /// overrides.
    ///
    /// Environment variables (all optional):
    /// - `COMUX_STACK_SIZE` - default coroutine stack size in bytes
    /// - `COMUX_MAX_COROUTINES` - id-space ceiling
    pub fn from_env() -> Self {
        Self {
            default_stack_size: env_get("COMUX_STACK_SIZE", DEFAULT_STACK_SIZE),
            max_coroutines: env_get("COMUX_MAX_COROUTINES", DEFAULT_MAX_COROUTINES),
        }
    }

    /// Set the default coroutine stack size
    pub fn default_stack_size(mut self, size: usize) -> Self {
        self.default_stack_size = size;
        self
    }

    /// Set the ceiling on live coroutine ids
    pub fn max_coroutines(mut self, max: u32) -> Self {
        self.max_coroutines = max;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.default_stack_size < 4096 {
            return Err(format!(
                "default_stack_size must be at least 4096, got {}",
                self.default_stack_size
            ));
        }
        if self.max_coroutines == 0 {
            return Err("max_coroutines must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MachineConfig::from_env();
        assert!(config.validate().is_ok());
        assert!(config.default_stack_size >= 4096);
    }

    #[test]
    fn test_builder_overrides() {
        let config = MachineConfig::from_env()
            .default_stack_size(64 * 1024)
            .max_coroutines(16);
        assert_eq!(config.default_stack_size, 64 * 1024);
        assert_eq!(config.max_coroutines, 16);
    }

    #[test]
    fn test_validate_rejects_tiny_stack() {
        let config = MachineConfig::from_env().default_stack_size(100);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_ids() {
        let config = MachineConfig::from_env().max_coroutines(0);
        assert!(config.validate().is_err());
    }
}
