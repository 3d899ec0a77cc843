//! CLI argument definitions for portwarden-daemon.
//!
//! Uses `clap` v4 derive macros. Values given here override the config file
//! and `PORTWARDEN_*` environment variables.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use portwarden_core::config::{FilterMode, PortwardenConfig};

/// portwarden ingress packet filter.
///
/// Publishes one filtering rule, attaches the classifier to an interface and
/// prints counters until SIGINT or SIGTERM.
#[derive(Parser, Debug)]
#[command(name = "portwarden-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to portwarden.toml. Built-in defaults are used when omitted.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    #[arg(long)]
    pub log_format: Option<String>,

    /// Override PID file path.
    #[arg(long)]
    pub pid_file: Option<String>,

    /// Override the counter sampling period, in seconds.
    #[arg(long)]
    pub sample_interval: Option<u64>,

    /// Validate configuration and exit without attaching.
    #[arg(long)]
    pub validate: bool,

    /// Filter policy. Falls back to `[filter].mode` when omitted.
    #[command(subcommand)]
    pub command: Option<FilterCommand>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum FilterCommand {
    /// Drop TCP traffic to one destination port.
    BlockPort {
        /// Interface to attach to
        #[arg(short, long)]
        interface: Option<String>,

        /// Destination port to drop (1-65535)
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
    },

    /// Allow one process to use only one destination port.
    ProcessFilter {
        /// Command name of the target process (at most 16 bytes)
        #[arg(short, long)]
        name: String,

        /// The one destination port the process may use (1-65535)
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
        allowed_port: u16,

        /// Interface to attach to
        #[arg(short, long)]
        interface: Option<String>,
    },
}

impl DaemonCli {
    /// Builds the effective configuration.
    ///
    /// Defaults (or `--config`), then `PORTWARDEN_*` environment, then the
    /// command line, then validation.
    pub async fn resolve_config(&self) -> Result<PortwardenConfig> {
        let mut config = match &self.config {
            Some(path) => PortwardenConfig::from_file(path)
                .await
                .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?,
            None => PortwardenConfig::default(),
        };
        config.apply_env_overrides();
        self.apply_overrides(&mut config);
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;
        Ok(config)
    }

    /// Applies every override given on the command line.
    ///
    /// Call after `apply_env_overrides` and before `validate`.
    pub fn apply_overrides(&self, config: &mut PortwardenConfig) {
        if let Some(level) = &self.log_level {
            config.general.log_level.clone_from(level);
        }
        if let Some(format) = &self.log_format {
            config.general.log_format.clone_from(format);
        }
        if let Some(pid_file) = &self.pid_file {
            config.general.pid_file.clone_from(pid_file);
        }
        if let Some(secs) = self.sample_interval {
            config.filter.sample_interval_secs = secs;
        }

        match &self.command {
            Some(FilterCommand::BlockPort { interface, port }) => {
                config.filter.mode = FilterMode::PortBlock;
                config.filter.port_block.port = u32::from(*port);
                if let Some(interface) = interface {
                    config.filter.interface.clone_from(interface);
                }
            }
            Some(FilterCommand::ProcessFilter {
                name,
                allowed_port,
                interface,
            }) => {
                config.filter.mode = FilterMode::ProcessAware;
                config.filter.process.name.clone_from(name);
                config.filter.process.allowed_port = u32::from(*allowed_port);
                if let Some(interface) = interface {
                    config.filter.interface.clone_from(interface);
                }
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> DaemonCli {
        DaemonCli::try_parse_from(args).expect("args should parse")
    }

    #[test]
    fn no_arguments_keeps_config() {
        let cli = parse(&["portwarden-daemon"]);
        let mut config = PortwardenConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.filter.mode, FilterMode::PortBlock);
        assert_eq!(config.filter.port_block.port, 4040);
        assert_eq!(config.filter.interface, "lo");
    }

    #[test]
    fn block_port_overrides_mode_and_port() {
        let cli = parse(&["portwarden-daemon", "block-port", "-i", "eth0", "-p", "8080"]);
        let mut config = PortwardenConfig::default();
        config.filter.mode = FilterMode::ProcessAware;
        cli.apply_overrides(&mut config);

        assert_eq!(config.filter.mode, FilterMode::PortBlock);
        assert_eq!(config.filter.port_block.port, 8080);
        assert_eq!(config.filter.interface, "eth0");
    }

    #[test]
    fn process_filter_overrides() {
        let cli = parse(&[
            "portwarden-daemon",
            "process-filter",
            "--name",
            "nginx",
            "--allowed-port",
            "443",
        ]);
        let mut config = PortwardenConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.filter.mode, FilterMode::ProcessAware);
        assert_eq!(config.filter.process.name, "nginx");
        assert_eq!(config.filter.process.allowed_port, 443);
        assert_eq!(config.filter.interface, "lo");
    }

    #[test]
    fn port_out_of_range_is_rejected() {
        for port in ["0", "65536", "-1", "http"] {
            let result =
                DaemonCli::try_parse_from(["portwarden-daemon", "block-port", "--port", port]);
            assert!(result.is_err(), "port {port} should be rejected");
        }
    }

    #[test]
    fn general_overrides() {
        let cli = parse(&[
            "portwarden-daemon",
            "--log-level",
            "debug",
            "--log-format",
            "json",
            "--pid-file",
            "/run/portwarden.pid",
            "--sample-interval",
            "1",
        ]);
        let mut config = PortwardenConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.general.log_format, "json");
        assert_eq!(config.general.pid_file, "/run/portwarden.pid");
        assert_eq!(config.filter.sample_interval_secs, 1);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn resolve_config_layers_file_then_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portwarden.toml");
        std::fs::write(
            &path,
            "[filter]\ninterface = \"eth0\"\n[filter.port_block]\nport = 22\n",
        )
        .unwrap();

        let path_arg = path.display().to_string();
        let cli = parse(&["portwarden-daemon", "-c", &path_arg, "block-port", "-p", "8080"]);
        let config = cli.resolve_config().await.unwrap();

        assert_eq!(config.filter.interface, "eth0");
        assert_eq!(config.filter.port_block.port, 8080);
    }

    #[tokio::test]
    async fn resolve_config_missing_file() {
        let cli = parse(&["portwarden-daemon", "--config", "/nonexistent/portwarden.toml"]);
        let err = cli.resolve_config().await.unwrap_err();
        assert!(err.to_string().contains("failed to load config"));
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn resolve_config_rejects_bad_log_level() {
        let cli = parse(&["portwarden-daemon", "--log-level", "loud"]);
        let err = cli.resolve_config().await.unwrap_err();
        assert!(err.to_string().contains("validation failed"));
    }

    #[test]
    fn oversized_name_fails_validation_not_parsing() {
        let cli = parse(&[
            "portwarden-daemon",
            "process-filter",
            "-n",
            "a-very-long-process-name",
            "-a",
            "4040",
        ]);
        let mut config = PortwardenConfig::default();
        cli.apply_overrides(&mut config);
        assert!(config.validate().is_err());
    }
}
