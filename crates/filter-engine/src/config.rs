//! Filter engine configuration -- validated rules from the core config
//!
//! [`EngineConfig`] is the engine-side view of `[filter]`: the interface, the
//! framing, and the one rule the active mode enforces, already narrowed to
//! wire types. Building it is where operator input is checked, so nothing
//! invalid can reach the rule store.
//!
//! The same module turns `[attribution]` and `[[filter.process.registry]]`
//! into an [`AttributionProvider`] and initial [`ProcessRecord`]s.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use portwarden_core::config::{
    AttributionConfig, AttributionKind, FilterMode, PortwardenConfig, ProcessFilterConfig,
    valid_port,
};
use portwarden_core::error::ConfigError;

use crate::attribution::{
    AttributionProvider, NoAttribution, PortMapAttribution, PortRangeAttribution,
};
use crate::packet::LinkType;
use crate::procfs;
use crate::registry::ProcessRecord;
use crate::rule::{PortRule, ProcessFilterRule, ProcessName};

/// The rule the engine publishes at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyConfig {
    PortBlock(PortRule),
    ProcessAware(ProcessFilterRule),
}

impl PolicyConfig {
    pub fn mode(&self) -> FilterMode {
        match self {
            Self::PortBlock(_) => FilterMode::PortBlock,
            Self::ProcessAware(_) => FilterMode::ProcessAware,
        }
    }
}

/// Validated engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Interface to attach to
    pub interface: String,
    /// Framing of delivered frames
    pub link_type: LinkType,
    /// Initial rule
    pub policy: PolicyConfig,
}

impl EngineConfig {
    /// Port-blocking engine on `interface`.
    pub fn port_block(interface: impl Into<String>, port: u16) -> Self {
        Self {
            interface: interface.into(),
            link_type: LinkType::Ethernet,
            policy: PolicyConfig::PortBlock(PortRule { port }),
        }
    }

    /// Process-aware engine on `interface`.
    pub fn process_aware(interface: impl Into<String>, rule: ProcessFilterRule) -> Self {
        Self {
            interface: interface.into(),
            link_type: LinkType::Ethernet,
            policy: PolicyConfig::ProcessAware(rule),
        }
    }

    pub fn with_link_type(mut self, link_type: LinkType) -> Self {
        self.link_type = link_type;
        self
    }

    /// Builds engine settings from `[filter]`.
    pub fn from_core(config: &PortwardenConfig) -> Result<Self, ConfigError> {
        let filter = &config.filter;
        if filter.interface.is_empty() {
            return Err(ConfigError::invalid("filter.interface", "must not be empty"));
        }

        let engine = match filter.mode {
            FilterMode::PortBlock => {
                let port = valid_port("filter.port_block.port", filter.port_block.port)?;
                Self::port_block(&filter.interface, port)
            }
            FilterMode::ProcessAware => {
                let rule = process_rule(&filter.process)?;
                Self::process_aware(&filter.interface, rule)
            }
        };
        Ok(engine)
    }

    pub fn mode(&self) -> FilterMode {
        self.policy.mode()
    }
}

/// The process-aware rule described by `[filter.process]`.
pub fn process_rule(config: &ProcessFilterConfig) -> Result<ProcessFilterRule, ConfigError> {
    let target = ProcessName::new(&config.name).map_err(|e| match e {
        ConfigError::InvalidValue { reason, .. } => {
            ConfigError::invalid("filter.process.name", reason)
        }
        other => other,
    })?;
    let allowed_port = valid_port("filter.process.allowed_port", config.allowed_port)?;
    Ok(ProcessFilterRule {
        target,
        allowed_port,
    })
}

/// The attribution provider described by `[attribution]`.
pub fn attribution_from_config(
    config: &AttributionConfig,
) -> Result<Arc<dyn AttributionProvider>, ConfigError> {
    let provider: Arc<dyn AttributionProvider> = match config.kind {
        AttributionKind::None => Arc::new(NoAttribution),
        AttributionKind::PortRange => {
            let first = valid_port("attribution.range_first", config.range_first)?;
            let last = valid_port("attribution.range_last", config.range_last)?;
            if first > last {
                return Err(ConfigError::invalid(
                    "attribution.range_last",
                    format!("range {first}-{last} is empty"),
                ));
            }
            Arc::new(PortRangeAttribution {
                first,
                last,
                pid: config.pid,
            })
        }
        AttributionKind::PortMap => {
            let mut owners = Vec::with_capacity(config.ports.len());
            for (i, owner) in config.ports.iter().enumerate() {
                let port = valid_port(&format!("attribution.ports[{i}].port"), owner.port)?;
                owners.push((port, owner.pid));
            }
            Arc::new(PortMapAttribution::from_owners(owners))
        }
    };
    Ok(provider)
}

/// Initial registry contents: listed entries, plus a procfs scan when enabled.
///
/// Entries without `comm` take the target name. A failed procfs scan is
/// logged and skipped.
pub fn initial_records(config: &ProcessFilterConfig) -> Result<Vec<ProcessRecord>, ConfigError> {
    let target = process_rule(config)?.target;
    let mut records = Vec::with_capacity(config.registry.len());

    for (i, entry) in config.registry.iter().enumerate() {
        let command_name = match &entry.comm {
            Some(comm) => ProcessName::new(comm).map_err(|_| {
                ConfigError::invalid(
                    format!("filter.process.registry[{i}].comm"),
                    "must be 1-16 bytes",
                )
            })?,
            None => target,
        };
        records.push(ProcessRecord {
            command_name,
            pid: entry.pid,
            tgid: entry.tgid.unwrap_or(entry.pid),
        });
    }

    if config.scan_procfs {
        match procfs::scan_by_comm(Path::new(&config.proc_root), &target) {
            Ok(found) => {
                info!(
                    proc_root = config.proc_root.as_str(),
                    process = %target,
                    matches = found.len(),
                    "procfs scan complete"
                );
                records.extend(found);
            }
            Err(e) => warn!(
                proc_root = config.proc_root.as_str(),
                error = %e,
                "procfs scan failed, continuing with configured registry"
            ),
        }
    }

    Ok(records)
}
