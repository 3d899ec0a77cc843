//! Error types, grouped by the stage at which they can occur.
//!
//! - [`ConfigError`]: rejected before any rule is published
//! - [`SetupError`]: interface lookup, attach, publish; fatal to startup
//! - [`EngineError`]: lifecycle misuse of the filter engine
//!
//! Classification never produces an error: malformed input resolves to PASS.

/// Top-level portwarden error.
#[derive(Debug, thiserror::Error)]
pub enum PortwardenError {
    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Setup (attach / publish) error
    #[error("setup error: {0}")]
    Setup(#[from] SetupError),

    /// Engine lifecycle error
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file does not exist
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// Config file could not be parsed
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// A field holds an invalid value
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    /// Shorthand for [`ConfigError::InvalidValue`].
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while bringing the filter up.
///
/// Any of these leaves no classifier attached.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// Interface name could not be resolved
    #[error("interface not found: {name}")]
    InterfaceNotFound { name: String },

    /// Hook refused or failed to attach
    #[error("attach to '{interface}' failed: {reason}")]
    AttachFailed { interface: String, reason: String },

    /// Hook failed to detach
    #[error("detach from '{interface}' failed: {reason}")]
    DetachFailed { interface: String, reason: String },

    /// Hook is already attached somewhere
    #[error("hook is already attached to '{interface}'")]
    AlreadyAttached { interface: String },

    /// Ingress hooks are not available on this platform
    #[error("unsupported platform: {0}")]
    Unsupported(String),
}

/// Filter engine lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// start() on a running engine
    #[error("engine is already running")]
    AlreadyRunning,

    /// stop() on a stopped engine
    #[error("engine is not running")]
    NotRunning,

    /// Builder is missing a required part
    #[error("engine init failed: {0}")]
    InitFailed(String),

    /// Operation does not apply to the engine's filter mode
    #[error("operation requires {expected} mode, engine runs in {actual} mode")]
    WrongMode {
        expected: &'static str,
        actual: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_converts_into_top_level() {
        let err: PortwardenError =
            ConfigError::invalid("filter.port_block.port", "must be 1-65535").into();
        assert!(matches!(err, PortwardenError::Config(_)));
        assert_eq!(
            err.to_string(),
            "config error: invalid config value for 'filter.port_block.port': must be 1-65535"
        );
    }

    #[test]
    fn setup_error_display_names_interface() {
        let err = SetupError::InterfaceNotFound {
            name: "eth9".to_owned(),
        };
        assert_eq!(err.to_string(), "interface not found: eth9");
    }

    #[test]
    fn wrong_mode_display() {
        let err = EngineError::WrongMode {
            expected: "process-aware",
            actual: "port-block",
        };
        assert!(err.to_string().contains("process-aware"));
        assert!(err.to_string().contains("port-block"));
    }
}
