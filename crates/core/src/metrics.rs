//! Metric name constants and descriptions
//!
//! Every Prometheus metric is named here; callers pass these constants to
//! `metrics::counter!()` / `metrics::gauge!()`.
//!
//! # Naming
//!
//! - prefix: `portwarden_`
//! - component: `filter_`, `daemon_`
//! - suffix: `_total` (counter), `_seconds` (duration), none (gauge)
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(
//!     portwarden_core::metrics::FILTER_PACKETS_TOTAL,
//!     portwarden_core::metrics::LABEL_COUNTER => "dropped",
//! )
//! .absolute(7);
//! ```

// ─── label keys ─────────────────────────────────────────────────────

/// Counter-table cell name (total, dropped, allowed, blocked, other_process)
pub const LABEL_COUNTER: &str = "counter";

/// Filter mode (port-block, process-aware)
pub const LABEL_MODE: &str = "mode";

/// Interface the classifier is attached to
pub const LABEL_INTERFACE: &str = "interface";

// ─── filter engine ──────────────────────────────────────────────────

/// Counter-table cells, one series per cell (counter, labels: counter, mode)
pub const FILTER_PACKETS_TOTAL: &str = "portwarden_filter_packets_total";

/// Rule publications since startup (gauge)
pub const FILTER_RULE_GENERATION: &str = "portwarden_filter_rule_generation";

/// Process registry size (gauge)
pub const FILTER_REGISTERED_PROCESSES: &str = "portwarden_filter_registered_processes";

/// 1 while a classifier is attached, 0 otherwise (gauge, label: interface)
pub const FILTER_ATTACHED: &str = "portwarden_filter_attached";

// ─── daemon ─────────────────────────────────────────────────────────

/// Daemon uptime (gauge, seconds)
pub const DAEMON_UPTIME_SECONDS: &str = "portwarden_daemon_uptime_seconds";

/// Build info (gauge, always 1, label: version)
pub const DAEMON_BUILD_INFO: &str = "portwarden_daemon_build_info";

/// Registers HELP text for every metric.
///
/// Call once, after the global recorder is installed.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge};

    describe_counter!(
        FILTER_PACKETS_TOTAL,
        "Classifier counter-table cells, labelled by cell name and filter mode"
    );
    describe_gauge!(
        FILTER_RULE_GENERATION,
        "Number of rule publications since startup"
    );
    describe_gauge!(
        FILTER_REGISTERED_PROCESSES,
        "Number of processes in the attribution registry"
    );
    describe_gauge!(
        FILTER_ATTACHED,
        "Whether a classifier is attached to the interface (1) or not (0)"
    );

    describe_gauge!(DAEMON_UPTIME_SECONDS, "portwarden daemon uptime in seconds");
    describe_gauge!(
        DAEMON_BUILD_INFO,
        "Build information (always 1, with version label)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_METRIC_NAMES: &[&str] = &[
        FILTER_PACKETS_TOTAL,
        FILTER_RULE_GENERATION,
        FILTER_REGISTERED_PROCESSES,
        FILTER_ATTACHED,
        DAEMON_UPTIME_SECONDS,
        DAEMON_BUILD_INFO,
    ];

    #[test]
    fn all_metrics_start_with_prefix() {
        for name in ALL_METRIC_NAMES {
            assert!(
                name.starts_with("portwarden_"),
                "Metric '{}' does not start with 'portwarden_' prefix",
                name
            );
        }
    }

    #[test]
    fn counters_end_with_total() {
        assert!(FILTER_PACKETS_TOTAL.ends_with("_total"));
    }

    #[test]
    fn describe_all_does_not_panic() {
        // no recorder installed
        describe_all();
    }

    #[test]
    fn label_keys_are_lowercase() {
        for label in [LABEL_COUNTER, LABEL_MODE, LABEL_INTERFACE] {
            assert_eq!(label.to_lowercase(), label);
        }
    }
}
