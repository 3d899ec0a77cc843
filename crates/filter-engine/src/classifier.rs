//! Per-packet classification.
//!
//! A classifier turns one frame into [`Action::Pass`] or [`Action::Drop`] and
//! bumps the matching counters. It runs on whatever thread received the
//! packet, concurrently with every other thread, so it never blocks, never
//! allocates and never panics. Anything it cannot parse passes.
//!
//! The decision itself lives in the pure functions [`port_verdict`] and
//! [`process_verdict`]; the classifier types wire them to the shared tables.

use std::sync::Arc;

use crate::attribution::AttributionProvider;
use crate::packet::{self, LinkType};
use crate::registry::ProcessRegistry;
use crate::rule::{PortRule, ProcessFilterRule, RuleStore};
use crate::stats::{
    CounterTable, IDX_ALLOWED, IDX_BLOCKED, IDX_DROPPED, IDX_OTHER_PROCESS, IDX_TOTAL,
};

/// Verdict for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Pass,
    Drop,
}

/// Outcome of the process-aware table for a TCP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessVerdict {
    /// Target process, allowed port
    Allowed,
    /// Target process, any other port
    Blocked,
    /// Not attributed to the target
    OtherProcess,
}

impl ProcessVerdict {
    pub fn action(self) -> Action {
        match self {
            Self::Allowed | Self::OtherProcess => Action::Pass,
            Self::Blocked => Action::Drop,
        }
    }

    /// Counter cell this verdict increments.
    pub fn counter_index(self) -> usize {
        match self {
            Self::Allowed => IDX_ALLOWED,
            Self::Blocked => IDX_BLOCKED,
            Self::OtherProcess => IDX_OTHER_PROCESS,
        }
    }
}

/// Port-blocking decision for a TCP destination port.
///
/// No rule published blocks nothing.
#[inline]
pub fn port_verdict(dst_port: u16, rule: Option<&PortRule>) -> Action {
    match rule {
        Some(rule) if rule.port == dst_port => Action::Drop,
        _ => Action::Pass,
    }
}

/// Process-aware decision for a TCP destination port.
///
/// `is_target` is whether attribution resolved the packet to a registered
/// process whose name equals the rule's target.
#[inline]
pub fn process_verdict(dst_port: u16, is_target: bool, rule: &ProcessFilterRule) -> ProcessVerdict {
    if !is_target {
        ProcessVerdict::OtherProcess
    } else if dst_port == rule.allowed_port {
        ProcessVerdict::Allowed
    } else {
        ProcessVerdict::Blocked
    }
}

/// Anything that can decide on a raw frame.
pub trait Classify: Send + Sync {
    fn classify(&self, frame: &[u8]) -> Action;
}

/// Drops TCP traffic to the published port.
pub struct PortBlockClassifier {
    link: LinkType,
    rule: Arc<RuleStore<PortRule>>,
    counters: Arc<CounterTable>,
}

impl PortBlockClassifier {
    pub fn new(link: LinkType, rule: Arc<RuleStore<PortRule>>, counters: Arc<CounterTable>) -> Self {
        Self {
            link,
            rule,
            counters,
        }
    }
}

impl Classify for PortBlockClassifier {
    fn classify(&self, frame: &[u8]) -> Action {
        self.counters.increment(IDX_TOTAL);

        let Ok(view) = packet::parse(frame, self.link) else {
            return Action::Pass;
        };
        let Some(dst_port) = view.tcp_dst_port() else {
            return Action::Pass;
        };

        let action = self.rule.with(|rule| port_verdict(dst_port, rule));
        if action == Action::Drop {
            self.counters.increment(IDX_DROPPED);
        }
        action
    }
}

/// Restricts one named process to one destination port.
pub struct ProcessAwareClassifier {
    link: LinkType,
    rule: Arc<RuleStore<ProcessFilterRule>>,
    registry: Arc<ProcessRegistry>,
    attribution: Arc<dyn AttributionProvider>,
    counters: Arc<CounterTable>,
}

impl ProcessAwareClassifier {
    pub fn new(
        link: LinkType,
        rule: Arc<RuleStore<ProcessFilterRule>>,
        registry: Arc<ProcessRegistry>,
        attribution: Arc<dyn AttributionProvider>,
        counters: Arc<CounterTable>,
    ) -> Self {
        Self {
            link,
            rule,
            registry,
            attribution,
            counters,
        }
    }
}

impl Classify for ProcessAwareClassifier {
    fn classify(&self, frame: &[u8]) -> Action {
        self.counters.increment(IDX_TOTAL);

        // Malformed and non-TCP packets never reach the table.
        let Ok(view) = packet::parse(frame, self.link) else {
            return Action::Pass;
        };
        let Some(dst_port) = view.tcp_dst_port() else {
            return Action::Pass;
        };

        let verdict = self.rule.with(|rule| match rule {
            Some(rule) => {
                let is_target = self
                    .attribution
                    .attribute(&view)
                    .is_some_and(|pid| self.registry.matches(pid, &rule.target));
                process_verdict(dst_port, is_target, rule)
            }
            None => ProcessVerdict::OtherProcess,
        });

        self.counters.increment(verdict.counter_index());
        verdict.action()
    }
}
