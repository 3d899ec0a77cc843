//! Configuration -- `portwarden.toml` parsing, env overrides and validation
//!
//! [`PortwardenConfig`] is the top-level structure; each crate reads only its
//! own section.
//!
//! # Load order (later wins)
//! 1. `Default` values
//! 2. Config file (`portwarden.toml`)
//! 3. Environment (`PORTWARDEN_FILTER_INTERFACE=eth0` style)
//! 4. CLI arguments (applied by the daemon)
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), portwarden_core::error::PortwardenError> {
//! use portwarden_core::config::PortwardenConfig;
//!
//! let config = PortwardenConfig::load("portwarden.toml").await?;
//! let config = PortwardenConfig::parse("[filter]\ninterface = \"eth0\"")?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, PortwardenError};

/// Width of a process command name buffer, in bytes.
pub const PROCESS_NAME_LEN: usize = 16;

/// portwarden configuration root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortwardenConfig {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,
    /// Filter settings
    #[serde(default)]
    pub filter: FilterConfig,
    /// Packet-to-process attribution settings
    #[serde(default)]
    pub attribution: AttributionConfig,
    /// Prometheus exporter settings
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl PortwardenConfig {
    /// Loads a TOML file, applies environment overrides and validates.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, PortwardenError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file without environment overrides.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, PortwardenError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PortwardenError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                PortwardenError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parses a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, PortwardenError> {
        toml::from_str(toml_str).map_err(|e| {
            PortwardenError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// Applies `PORTWARDEN_{SECTION}_{FIELD}` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "PORTWARDEN_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "PORTWARDEN_GENERAL_LOG_FORMAT");
        override_string(&mut self.general.pid_file, "PORTWARDEN_GENERAL_PID_FILE");

        // Filter
        override_string(&mut self.filter.interface, "PORTWARDEN_FILTER_INTERFACE");
        override_parsed(&mut self.filter.mode, "PORTWARDEN_FILTER_MODE");
        override_parsed(
            &mut self.filter.sample_interval_secs,
            "PORTWARDEN_FILTER_SAMPLE_INTERVAL_SECS",
        );
        override_parsed(&mut self.filter.hook, "PORTWARDEN_FILTER_HOOK");
        override_parsed(&mut self.filter.queue_num, "PORTWARDEN_FILTER_QUEUE_NUM");

        // Filter policies: nested sections keep their section in the key
        override_parsed(
            &mut self.filter.port_block.port,
            "PORTWARDEN_FILTER_PORT_BLOCK_PORT",
        );
        override_string(&mut self.filter.process.name, "PORTWARDEN_FILTER_PROCESS_NAME");
        override_parsed(
            &mut self.filter.process.allowed_port,
            "PORTWARDEN_FILTER_PROCESS_ALLOWED_PORT",
        );
        override_parsed(
            &mut self.filter.process.scan_procfs,
            "PORTWARDEN_FILTER_PROCESS_SCAN_PROCFS",
        );

        // Attribution
        override_parsed(&mut self.attribution.kind, "PORTWARDEN_ATTRIBUTION_KIND");
        override_parsed(&mut self.attribution.pid, "PORTWARDEN_ATTRIBUTION_PID");

        // Metrics
        override_parsed(&mut self.metrics.enabled, "PORTWARDEN_METRICS_ENABLED");
        override_string(
            &mut self.metrics.listen_addr,
            "PORTWARDEN_METRICS_LISTEN_ADDR",
        );
        override_parsed(&mut self.metrics.port, "PORTWARDEN_METRICS_PORT");
    }

    /// Validates every field. Nothing may be published before this passes.
    pub fn validate(&self) -> Result<(), PortwardenError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(ConfigError::invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            )
            .into());
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(ConfigError::invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            )
            .into());
        }

        if self.filter.interface.is_empty() {
            return Err(ConfigError::invalid("filter.interface", "must not be empty").into());
        }

        if self.filter.sample_interval_secs == 0 {
            return Err(
                ConfigError::invalid("filter.sample_interval_secs", "must be at least 1").into(),
            );
        }

        match self.filter.mode {
            FilterMode::PortBlock => {
                valid_port("filter.port_block.port", self.filter.port_block.port)?;
            }
            FilterMode::ProcessAware => {
                validate_process_name("filter.process.name", &self.filter.process.name)?;
                valid_port(
                    "filter.process.allowed_port",
                    self.filter.process.allowed_port,
                )?;
                for (i, entry) in self.filter.process.registry.iter().enumerate() {
                    if let Some(comm) = &entry.comm {
                        validate_process_name(&format!("filter.process.registry[{i}].comm"), comm)?;
                    }
                }
                self.attribution.validate()?;
            }
        }

        Ok(())
    }
}

/// Checks a configured port value and narrows it to `u16`.
///
/// Ports must lie in `[1, 65535]`.
pub fn valid_port(field: &str, value: u32) -> Result<u16, ConfigError> {
    match u16::try_from(value) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ConfigError::invalid(
            field,
            format!("port {value} out of range, must be 1-65535"),
        )),
    }
}

/// Checks that a configured process name fits the fixed-width buffer.
pub fn validate_process_name(field: &str, name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::invalid(field, "process name must not be empty"));
    }
    if name.len() > PROCESS_NAME_LEN {
        return Err(ConfigError::invalid(
            field,
            format!(
                "process name is {} bytes, at most {PROCESS_NAME_LEN} allowed",
                name.len()
            ),
        ));
    }
    Ok(())
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log format (json, pretty)
    pub log_format: String,
    /// PID file path, empty disables
    pub pid_file: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "pretty".to_owned(),
            pid_file: String::new(),
        }
    }
}

/// Which policy the classifier enforces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterMode {
    /// Drop TCP traffic to one destination port
    #[default]
    PortBlock,
    /// Restrict one process to one destination port
    ProcessAware,
}

impl FilterMode {
    /// Config spelling of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PortBlock => "port-block",
            Self::ProcessAware => "process-aware",
        }
    }
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "port-block" => Ok(Self::PortBlock),
            "process-aware" => Ok(Self::ProcessAware),
            other => Err(ConfigError::invalid(
                "filter.mode",
                format!("unknown mode '{other}', expected 'port-block' or 'process-aware'"),
            )),
        }
    }
}

/// Packet source the daemon attaches on Linux.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookKind {
    /// Netfilter queue; verdicts are enforced
    #[default]
    Nfqueue,
    /// Raw packet socket; sees copies, verdicts are only counted
    AfPacket,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nfqueue => "nfqueue",
            Self::AfPacket => "af-packet",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nfqueue" => Ok(Self::Nfqueue),
            "af-packet" => Ok(Self::AfPacket),
            other => Err(ConfigError::invalid(
                "filter.hook",
                format!("unknown hook '{other}', expected 'nfqueue' or 'af-packet'"),
            )),
        }
    }
}

/// Filter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Interface to attach to
    pub interface: String,
    /// Active policy
    pub mode: FilterMode,
    /// Packet source
    pub hook: HookKind,
    /// Netfilter queue number (nfqueue hook)
    pub queue_num: u16,
    /// Counter sampling period (seconds)
    pub sample_interval_secs: u64,
    /// Port-blocking policy
    pub port_block: PortBlockConfig,
    /// Process-aware policy
    pub process: ProcessFilterConfig,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            interface: "lo".to_owned(),
            mode: FilterMode::default(),
            hook: HookKind::default(),
            queue_num: 0,
            sample_interval_secs: 5,
            port_block: PortBlockConfig::default(),
            process: ProcessFilterConfig::default(),
        }
    }
}

/// Port-blocking policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortBlockConfig {
    /// TCP destination port to drop
    pub port: u32,
}

impl Default for PortBlockConfig {
    fn default() -> Self {
        Self { port: 4040 }
    }
}

/// Process-aware policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessFilterConfig {
    /// Target process command name (at most 16 bytes)
    pub name: String,
    /// The only destination port the target may use
    pub allowed_port: u32,
    /// Populate the registry from procfs at startup
    pub scan_procfs: bool,
    /// procfs mount point
    pub proc_root: String,
    /// Processes registered at startup
    pub registry: Vec<ProcessEntry>,
}

impl Default for ProcessFilterConfig {
    fn default() -> Self {
        Self {
            name: "myprocess".to_owned(),
            allowed_port: 4040,
            scan_procfs: false,
            proc_root: "/proc".to_owned(),
            registry: vec![ProcessEntry {
                pid: 1000,
                tgid: None,
                comm: None,
            }],
        }
    }
}

/// One statically registered process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEntry {
    /// Process id
    pub pid: u32,
    /// Thread-group id, defaults to `pid`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tgid: Option<u32>,
    /// Command name, defaults to `filter.process.name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comm: Option<String>,
}

/// How packets are mapped to process ids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttributionKind {
    /// Never attribute
    None,
    /// Destination ports in a range belong to one pid
    #[default]
    PortRange,
    /// Explicit destination port to pid table
    PortMap,
}

impl FromStr for AttributionKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "port-range" => Ok(Self::PortRange),
            "port-map" => Ok(Self::PortMap),
            other => Err(ConfigError::invalid(
                "attribution.kind",
                format!("unknown kind '{other}', expected 'none', 'port-range' or 'port-map'"),
            )),
        }
    }
}

/// Attribution settings (process-aware mode only).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    /// Attribution strategy
    pub kind: AttributionKind,
    /// First destination port of the range (port-range)
    pub range_first: u32,
    /// Last destination port of the range, inclusive (port-range)
    pub range_last: u32,
    /// pid the range is attributed to (port-range)
    pub pid: u32,
    /// Port owners (port-map)
    pub ports: Vec<PortOwner>,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            kind: AttributionKind::default(),
            range_first: 4000,
            range_last: 5000,
            pid: 1000,
            ports: Vec::new(),
        }
    }
}

impl AttributionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.kind {
            AttributionKind::None => {}
            AttributionKind::PortRange => {
                let first = valid_port("attribution.range_first", self.range_first)?;
                let last = valid_port("attribution.range_last", self.range_last)?;
                if first > last {
                    return Err(ConfigError::invalid(
                        "attribution.range_last",
                        format!("range {first}-{last} is empty"),
                    ));
                }
            }
            AttributionKind::PortMap => {
                for (i, owner) in self.ports.iter().enumerate() {
                    valid_port(&format!("attribution.ports[{i}].port"), owner.port)?;
                }
            }
        }
        Ok(())
    }
}

/// Destination port owned by a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortOwner {
    /// Destination port
    pub port: u32,
    /// Owning process id
    pub pid: u32,
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether the exporter runs
    pub enabled: bool,
    /// Listen address
    pub listen_addr: String,
    /// Listen port
    pub port: u16,
    /// Scrape path
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9100,
            endpoint: "/metrics".to_owned(),
        }
    }
}

// --- env override helpers ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_parsed<T: FromStr>(target: &mut T, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse env var, ignoring"
            ),
        }
    }
}
