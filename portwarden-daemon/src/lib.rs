//! portwarden daemon library.
//!
//! Exposes the control-plane modules for integration testing. In production
//! `portwarden-daemon` is used as a binary (main.rs).

pub mod cli;
pub mod logging;
pub mod metrics_server;
pub mod orchestrator;
pub mod reporter;
