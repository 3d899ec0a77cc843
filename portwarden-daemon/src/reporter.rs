//! Console rendering of counter snapshots.
//!
//! One line per sample. Text lines carry the per-interval increase next to
//! each cell; JSON lines (selected with `log_format = "json"`) carry the
//! absolute values and the deltas as separate objects.

use std::collections::BTreeMap;

use serde::Serialize;

use portwarden_core::config::FilterMode;
use portwarden_filter::{CounterSnapshot, EngineConfig, PolicyConfig};

/// Output style of a report line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Text,
    Json,
}

impl ReportFormat {
    /// `json` log format selects JSON reports; anything else is text.
    pub fn from_log_format(log_format: &str) -> Self {
        if log_format == "json" {
            Self::Json
        } else {
            Self::Text
        }
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    kind: &'static str,
    interface: &'a str,
    mode: &'static str,
    counters: BTreeMap<&'static str, u64>,
    delta: BTreeMap<&'static str, u64>,
}

/// Renders samples for one engine, remembering the previous sample.
#[derive(Debug)]
pub struct Reporter {
    interface: String,
    policy: PolicyConfig,
    format: ReportFormat,
    enforcing: bool,
    previous: CounterSnapshot,
}

impl Reporter {
    pub fn new(config: &EngineConfig, format: ReportFormat) -> Self {
        Self {
            interface: config.interface.clone(),
            policy: config.policy,
            format,
            enforcing: true,
            previous: CounterSnapshot::default(),
        }
    }

    /// Whether the hook discards dropped packets. Defaults to `true`.
    pub fn with_enforcement(mut self, enforcing: bool) -> Self {
        self.enforcing = enforcing;
        self
    }

    pub fn mode(&self) -> FilterMode {
        self.policy.mode()
    }

    /// Lines printed once the classifier is attached.
    pub fn banner(&self) -> Vec<String> {
        match (self.policy, self.enforcing) {
            (PolicyConfig::PortBlock(rule), true) => vec![
                format!(
                    "packet filter attached to {}, blocking TCP port {}",
                    self.interface, rule.port
                ),
                format!("packets to port {} are dropped", rule.port),
            ],
            (PolicyConfig::PortBlock(rule), false) => vec![
                format!(
                    "packet monitor attached to {}, watching TCP port {}",
                    self.interface, rule.port
                ),
                format!(
                    "packets to port {} are counted as dropped but still delivered",
                    rule.port
                ),
            ],
            (PolicyConfig::ProcessAware(rule), enforcing) => vec![
                format!(
                    "process {} attached to {}",
                    if enforcing { "filter" } else { "monitor" },
                    self.interface
                ),
                format!("target process: '{}'", rule.target),
                format!("allowed port: {}", rule.allowed_port),
                if enforcing {
                    format!("all other ports for '{}' are blocked", rule.target)
                } else {
                    format!(
                        "other ports for '{}' are counted as blocked but still delivered",
                        rule.target
                    )
                },
            ],
        }
    }

    /// Renders a periodic sample.
    pub fn render(&mut self, snapshot: &CounterSnapshot) -> String {
        self.render_as("sample", snapshot)
    }

    /// Renders the sample taken at shutdown.
    pub fn render_final(&mut self, snapshot: &CounterSnapshot) -> String {
        self.render_as("final", snapshot)
    }

    fn render_as(&mut self, kind: &'static str, snapshot: &CounterSnapshot) -> String {
        let delta = snapshot.delta_since(&self.previous);
        let line = match self.format {
            ReportFormat::Text => self.text_line(kind, snapshot, &delta),
            ReportFormat::Json => self.json_line(kind, snapshot, &delta),
        };
        self.previous = snapshot.clone();
        line
    }

    fn text_line(&self, kind: &str, now: &CounterSnapshot, delta: &CounterSnapshot) -> String {
        let cell = |name: &str| format!("{} (+{})", now.get(name), delta.get(name));
        let prefix = if kind == "final" { "final stats" } else { "stats" };

        match self.policy {
            PolicyConfig::PortBlock(rule) => format!(
                "{prefix}: total={} | dropped(port {})={}",
                cell("total"),
                rule.port,
                cell("dropped"),
            ),
            PolicyConfig::ProcessAware(rule) => format!(
                "{prefix}: total={} | {}: allowed={}, blocked={} | other processes={}",
                cell("total"),
                rule.target,
                cell("allowed"),
                cell("blocked"),
                cell("other_process"),
            ),
        }
    }

    fn json_line(&self, kind: &'static str, now: &CounterSnapshot, delta: &CounterSnapshot) -> String {
        let report = JsonReport {
            kind,
            interface: &self.interface,
            mode: self.mode().as_str(),
            counters: now.iter().map(|e| (e.name, e.value)).collect(),
            delta: delta.iter().map(|e| (e.name, e.value)).collect(),
        };
        // a map of integers cannot fail to serialize
        serde_json::to_string(&report).unwrap_or_default()
    }
}
