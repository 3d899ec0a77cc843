//! # portwarden-core
//!
//! Shared foundation for the portwarden workspace:
//!
//! - [`error`]: error taxonomy rooted at [`PortwardenError`]
//! - [`config`]: `portwarden.toml` loading, env overrides and validation
//! - [`metrics`]: Prometheus metric names
//!
//! The filter engine and the daemon both depend on this crate; it depends on
//! neither.

pub mod config;
pub mod error;
pub mod metrics;

// --- re-exports ---

pub use config::{FilterMode, HookKind, PortwardenConfig};
pub use error::{ConfigError, EngineError, PortwardenError, SetupError};
