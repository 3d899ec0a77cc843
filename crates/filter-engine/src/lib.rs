//! # portwarden-filter
//!
//! Ingress packet classification with lock-free shared tables.
//!
//! # Modules
//! - [`packet`]: bounded header parsing into a [`HeaderView`]
//! - [`rule`]: rule types and the atomically replaceable [`RuleStore`]
//! - [`registry`]: pid → [`ProcessRecord`] table
//! - [`procfs`]: registry population from `/proc`
//! - [`stats`]: per-mode [`CounterTable`]
//! - [`attribution`]: packet → pid providers
//! - [`classifier`]: port-blocking and process-aware decisions
//! - [`hook`]: attaching a classifier to an interface
//! - [`config`]: validated engine settings from `portwarden.toml`
//! - [`engine`]: [`FilterEngine`] lifecycle

pub mod attribution;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod hook;
pub mod packet;
pub mod procfs;
pub mod registry;
pub mod rule;
pub mod stats;

// --- re-exports ---

// engine
pub use engine::{FilterEngine, FilterEngineBuilder, HealthStatus};

// config
pub use config::{EngineConfig, PolicyConfig};

// classification
pub use classifier::{
    Action, Classify, PortBlockClassifier, ProcessAwareClassifier, ProcessVerdict,
};
pub use packet::{HeaderView, LinkType, ParseFault, TcpPorts};

// tables
pub use registry::{ProcessRecord, ProcessRegistry};
pub use rule::{PortRule, ProcessFilterRule, ProcessName, RuleStore};
pub use stats::{CounterSnapshot, CounterTable};

// collaborators
pub use attribution::{
    AttributionProvider, NoAttribution, PortMapAttribution, PortRangeAttribution,
};
#[cfg(target_os = "linux")]
pub use hook::{AfPacketHook, NfQueueHook};
pub use hook::{HookTap, InProcessHook, IngressHook};
