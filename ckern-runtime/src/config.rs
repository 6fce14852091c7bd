//! Runtime Configuration
//!
//! Sizes and thresholds of the per-thread services. Configuration can be set
//! programmatically or loaded from environment variables, and is owned by the
//! [`ProcessContext`](crate::process::ProcessContext).
//!
//! # Environment Variables
//!
//! All environment variables use the `CKERN_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `CKERN_PAGECACHE_SUBBLOCKS` | 1 MiB sub-blocks per cache block | 1024 (64-bit), 32 (32-bit) |
//! | `CKERN_TESTMM_PAGE_SIZE` | Data region of a test heap page in bytes | 1048576 (1MB) |
//! | `CKERN_TESTMM_MAX_BLOCK` | Largest test heap allocation in bytes | 16777216 (16MB) |
//! | `CKERN_LOG_BUFFER_SIZE` | Log buffer size of a thread in bytes | 8192 |
//! | `CKERN_LOG_FLUSH_THRESHOLD` | Free bytes below which a channel is flushed | 512 |
//! | `CKERN_SIGNAL_STACK_SIZE` | Signal stack of a thread in bytes | 65536 |
//! | `CKERN_STATIC_SIZE` | Static memory of a thread in bytes | 65536 |
//!
//! # Example
//!
//! ```rust,ignore
//! use ckern_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .subblocks_per_block(64)
//!     .log_buffer_size(16 * 1024)
//!     .build()?;
//! ```

use std::env;

use thiserror::Error;

/// Page cache configuration.
#[derive(Debug, Clone)]
pub struct PageCacheConfig {
    /// Number of 1 MiB sub-blocks mapped at once.
    /// Default: 1024 on 64-bit targets, 32 otherwise.
    pub subblocks_per_block: usize,
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self {
            subblocks_per_block: if cfg!(target_pointer_width = "64") {
                1024
            } else {
                32
            },
        }
    }
}

/// Test heap configuration.
#[derive(Debug, Clone)]
pub struct TestMmConfig {
    /// Data region of a test heap page in bytes; larger requests get a
    /// larger page.
    /// Default: 1MB.
    pub page_size: usize,

    /// Largest single allocation in bytes.
    /// Default: 16MB.
    pub max_block_size: usize,
}

impl Default for TestMmConfig {
    fn default() -> Self {
        Self {
            page_size: 1024 * 1024,            // 1 MB
            max_block_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Size of the log buffer of a thread, shared by all channels.
    /// Default: 8KB.
    pub buffer_size: usize,

    /// A buffered channel is flushed when fewer bytes than this remain.
    /// Default: 512.
    pub flush_threshold: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8 * 1024,
            flush_threshold: 512,
        }
    }
}

/// Thread-local store configuration.
#[derive(Debug, Clone)]
pub struct ThreadConfig {
    /// Signal stack size in bytes.
    /// Default: 64KB.
    pub signal_stack_size: usize,

    /// Size of the static memory region in bytes.
    /// Default: 64KB.
    pub static_size: usize,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            signal_stack_size: 64 * 1024,
            static_size: 64 * 1024,
        }
    }
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Page cache configuration.
    pub pagecache: PageCacheConfig,

    /// Test heap configuration.
    pub testmm: TestMmConfig,

    /// Logging configuration.
    pub log: LogConfig,

    /// Thread-local store configuration.
    pub thread: ThreadConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set or do not hold a usable value leave the
    /// default in place.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("CKERN_PAGECACHE_SUBBLOCKS") {
            if val > 0 {
                config.pagecache.subblocks_per_block = val;
            }
        }

        if let Some(val) = parse_env_usize("CKERN_TESTMM_PAGE_SIZE") {
            if val >= 4096 {
                config.testmm.page_size = val;
            }
        }

        if let Some(val) = parse_env_usize("CKERN_TESTMM_MAX_BLOCK") {
            if val > 0 {
                config.testmm.max_block_size = val;
            }
        }

        if let Some(val) = parse_env_usize("CKERN_LOG_BUFFER_SIZE") {
            if val >= MIN_LOG_BUFFER_SIZE {
                config.log.buffer_size = val;
            }
        }

        if let Some(val) = parse_env_usize("CKERN_LOG_FLUSH_THRESHOLD") {
            config.log.flush_threshold = val;
        }

        if let Some(val) = parse_env_usize("CKERN_SIGNAL_STACK_SIZE") {
            if val >= 4096 {
                config.thread.signal_stack_size = val;
            }
        }

        if let Some(val) = parse_env_usize("CKERN_STATIC_SIZE") {
            if val >= 4096 {
                config.thread.static_size = val;
            }
        }

        if let Err(err) = config.validate() {
            tracing::warn!(%err, "invalid configuration from environment, using defaults");
            return Self::default();
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pagecache.subblocks_per_block == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pagecache.subblocks_per_block".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.testmm.page_size < 4096 {
            return Err(ConfigError::InvalidValue {
                field: "testmm.page_size".into(),
                message: "must be at least 4096 bytes".into(),
            });
        }

        if self.testmm.max_block_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "testmm.max_block_size".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.log.buffer_size < MIN_LOG_BUFFER_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "log.buffer_size".into(),
                message: format!("must be at least {} bytes", MIN_LOG_BUFFER_SIZE),
            });
        }

        if self.log.flush_threshold >= self.log.buffer_size / 4 {
            return Err(ConfigError::InvalidValue {
                field: "log.flush_threshold".into(),
                message: "must be less than a quarter of log.buffer_size".into(),
            });
        }

        if self.thread.signal_stack_size < 4096 {
            return Err(ConfigError::InvalidValue {
                field: "thread.signal_stack_size".into(),
                message: "must be at least 4096 bytes".into(),
            });
        }

        if self.thread.static_size < 4096 || self.log.buffer_size > self.thread.static_size / 2 {
            return Err(ConfigError::InvalidValue {
                field: "thread.static_size".into(),
                message: "must be at least 4096 bytes and twice log.buffer_size".into(),
            });
        }

        Ok(())
    }
}

/// Smallest log buffer: four channels of 256 bytes.
const MIN_LOG_BUFFER_SIZE: usize = 1024;

/// Configuration error.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of sub-blocks per cache block.
    pub fn subblocks_per_block(mut self, n: usize) -> Self {
        self.config.pagecache.subblocks_per_block = n;
        self
    }

    /// Set the data region size of a test heap page.
    pub fn testmm_page_size(mut self, size: usize) -> Self {
        self.config.testmm.page_size = size;
        self
    }

    /// Set the largest test heap allocation.
    pub fn testmm_max_block_size(mut self, size: usize) -> Self {
        self.config.testmm.max_block_size = size;
        self
    }

    /// Set the log buffer size.
    pub fn log_buffer_size(mut self, size: usize) -> Self {
        self.config.log.buffer_size = size;
        self
    }

    /// Set the log flush threshold.
    pub fn log_flush_threshold(mut self, size: usize) -> Self {
        self.config.log.flush_threshold = size;
        self
    }

    /// Set the signal stack size.
    pub fn signal_stack_size(mut self, size: usize) -> Self {
        self.config.thread.signal_stack_size = size;
        self
    }

    /// Set the static memory size.
    pub fn static_size(mut self, size: usize) -> Self {
        self.config.thread.static_size = size;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.pagecache.subblocks_per_block >= 32);
        assert_eq!(config.testmm.page_size, 1024 * 1024);
        assert_eq!(config.testmm.max_block_size, 16 * 1024 * 1024);
        assert_eq!(config.log.buffer_size, 8192);
        assert_eq!(config.log.flush_threshold, 512);
        assert_eq!(config.thread.signal_stack_size, 64 * 1024);
        assert_eq!(config.thread.static_size, 64 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .subblocks_per_block(8)
            .log_buffer_size(16 * 1024)
            .log_flush_threshold(1024)
            .build()
            .unwrap();

        assert_eq!(config.pagecache.subblocks_per_block, 8);
        assert_eq!(config.log.buffer_size, 16 * 1024);
        assert_eq!(config.log.flush_threshold, 1024);
    }

    #[test]
    fn test_builder_validation() {
        let result = RuntimeConfig::builder().subblocks_per_block(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_flush_threshold_too_large() {
        let result = RuntimeConfig::builder()
            .log_buffer_size(4096)
            .log_flush_threshold(1024)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_log_buffer_exceeds_static() {
        let result = RuntimeConfig::builder()
            .static_size(8192)
            .log_buffer_size(8192)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "log.buffer_size".into(),
            message: "must be positive".into(),
        };
        assert!(err.to_string().contains("log.buffer_size"));
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn test_from_env_with_no_vars() {
        env::remove_var("CKERN_PAGECACHE_SUBBLOCKS");
        env::remove_var("CKERN_LOG_BUFFER_SIZE");

        let config = RuntimeConfig::from_env();
        assert!(config.pagecache.subblocks_per_block >= 32);
        assert_eq!(config.log.buffer_size, 8192);
    }
}
