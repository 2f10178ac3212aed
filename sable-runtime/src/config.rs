//! Runtime Configuration
//!
//! Configuration for the sable runtime. It can be set programmatically or
//! loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `SABLE_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SABLE_NUM_WORKERS` | Number of worker threads | CPU count |
//! | `SABLE_YIELD_OP_COUNT` | Steps a fiber runs before yielding its worker | 2048 |
//! | `SABLE_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `SABLE_REPORT_UNHANDLED` | Log fibers that die with nobody observing ("true"/"false") | true |
//! | `SABLE_HANDLE_SIGNALS` | Interrupt the main fiber on SIGINT/SIGTERM ("true"/"false") | true |
//!
//! # Example
//!
//! ```rust,ignore
//! use sable_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env()?;
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .num_workers(4)
//!     .yield_op_count(512)
//!     .build()?;
//! ```

use std::env;

use thiserror::Error;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    /// Default: number of available CPUs.
    pub num_workers: usize,

    /// Synchronous steps a fiber may take before it is re-submitted so
    /// siblings get a turn.
    /// Default: 2048.
    pub yield_op_count: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            yield_op_count: 2048,
        }
    }
}

/// Signal handling configuration.
#[derive(Debug, Clone)]
pub struct SignalConfig {
    /// Interrupt the main fiber on SIGTERM.
    /// Default: true.
    pub handle_sigterm: bool,

    /// Interrupt the main fiber on SIGINT (Ctrl+C).
    /// Default: true.
    pub handle_sigint: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            handle_sigterm: true,
            handle_sigint: true,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Log the cause of fibers that die while nobody observes them.
    /// Default: true.
    pub report_unhandled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            report_unhandled: true,
        }
    }
}

/// Which clock the runtime drives `sleep` with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockMode {
    /// Wall-clock timers on a dedicated thread.
    #[default]
    Live,
    /// Manual time, advanced with `TestClock::adjust`.
    Test,
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,

    /// Signal handling configuration.
    pub signals: SignalConfig,

    /// Logging configuration.
    pub log: LogConfig,

    /// Clock selection.
    pub clock: ClockMode,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set keep their defaults. A variable that is set
    /// but cannot be parsed is an error, as is a resulting invalid config.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("SABLE_NUM_WORKERS")? {
            config.scheduler.num_workers = val;
        }

        if let Some(val) = parse_env_usize("SABLE_YIELD_OP_COUNT")? {
            config.scheduler.yield_op_count = val;
        }

        if let Ok(val) = env::var("SABLE_LOG_LEVEL") {
            config.log.level = LogLevel::parse(&val).ok_or_else(|| ConfigError::EnvParseError {
                var: "SABLE_LOG_LEVEL".into(),
                message: format!("unknown log level '{}'", val),
            })?;
        }

        if let Some(val) = parse_env_bool("SABLE_REPORT_UNHANDLED")? {
            config.log.report_unhandled = val;
        }

        if let Some(val) = parse_env_bool("SABLE_HANDLE_SIGNALS")? {
            config.signals.handle_sigint = val;
            config.signals.handle_sigterm = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.num_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.num_workers".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.scheduler.yield_op_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.yield_op_count".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParseError {
        /// Variable name.
        var: String,
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

    /// Set the number of worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.scheduler.num_workers = n;
        self
    }

    /// Set the fairness budget.
    pub fn yield_op_count(mut self, n: usize) -> Self {
        self.config.scheduler.yield_op_count = n;
        self
    }

    /// Enable or disable SIGTERM handling.
    pub fn handle_sigterm(mut self, enabled: bool) -> Self {
        self.config.signals.handle_sigterm = enabled;
        self
    }

    /// Enable or disable SIGINT handling.
    pub fn handle_sigint(mut self, enabled: bool) -> Self {
        self.config.signals.handle_sigint = enabled;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Enable or disable reporting of unobserved defects.
    pub fn report_unhandled(mut self, enabled: bool) -> Self {
        self.config.log.report_unhandled = enabled;
        self
    }

    /// Select the clock.
    pub fn clock(mut self, mode: ClockMode) -> Self {
        self.config.clock = mode;
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
fn parse_env_usize(name: &str) -> Result<Option<usize>, ConfigError> {
    match env::var(name) {
        Ok(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::EnvParseError {
                var: name.into(),
                message: format!("{}", e),
            }),
        Err(_) => Ok(None),
    }
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(name) {
        Ok(s) => match s.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            other => Err(ConfigError::EnvParseError {
                var: name.into(),
                message: format!("expected a boolean, got '{}'", other),
            }),
        },
        Err(_) => Ok(None),
    }
}

/// Get the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.scheduler.num_workers >= 1);
        assert_eq!(config.scheduler.yield_op_count, 2048);
        assert!(config.log.report_unhandled);
        assert!(config.signals.handle_sigint);
        assert_eq!(config.clock, ClockMode::Live);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .num_workers(4)
            .yield_op_count(64)
            .log_level(LogLevel::Debug)
            .clock(ClockMode::Test)
            .build()
            .unwrap();

        assert_eq!(config.scheduler.num_workers, 4);
        assert_eq!(config.scheduler.yield_op_count, 64);
        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.clock, ClockMode::Test);
    }

    #[test]
    fn test_builder_validation() {
        assert!(RuntimeConfig::builder().num_workers(0).build().is_err());
        let err = RuntimeConfig::builder().yield_op_count(0).build().unwrap_err();
        assert!(err.to_string().contains("yield_op_count"));
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("off"), Some(LogLevel::Off));
        assert_eq!(LogLevel::parse("ERROR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("warn"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("TRACE"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("invalid"), None);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "num_workers".into(),
            message: "must be positive".into(),
        };
        assert!(err.to_string().contains("num_workers"));
        assert!(err.to_string().contains("must be positive"));
    }

    // All env-driven cases live in one test so parallel tests never race on
    // the process environment.
    #[test]
    fn test_from_env() {
        env::remove_var("SABLE_NUM_WORKERS");
        env::remove_var("SABLE_YIELD_OP_COUNT");
        env::remove_var("SABLE_LOG_LEVEL");
        env::remove_var("SABLE_REPORT_UNHANDLED");
        env::remove_var("SABLE_HANDLE_SIGNALS");
        let config = RuntimeConfig::from_env().unwrap();
        assert!(config.scheduler.num_workers >= 1);

        env::set_var("SABLE_NUM_WORKERS", "3");
        env::set_var("SABLE_LOG_LEVEL", "trace");
        env::set_var("SABLE_HANDLE_SIGNALS", "off");
        let config = RuntimeConfig::from_env().unwrap();
        assert_eq!(config.scheduler.num_workers, 3);
        assert_eq!(config.log.level, LogLevel::Trace);
        assert!(!config.signals.handle_sigint);
        assert!(!config.signals.handle_sigterm);

        env::set_var("SABLE_NUM_WORKERS", "many");
        assert!(matches!(
            RuntimeConfig::from_env(),
            Err(ConfigError::EnvParseError { .. })
        ));

        env::set_var("SABLE_NUM_WORKERS", "0");
        assert!(matches!(
            RuntimeConfig::from_env(),
            Err(ConfigError::InvalidValue { .. })
        ));

        env::remove_var("SABLE_NUM_WORKERS");
        env::remove_var("SABLE_LOG_LEVEL");
        env::remove_var("SABLE_HANDLE_SIGNALS");
    }
}
