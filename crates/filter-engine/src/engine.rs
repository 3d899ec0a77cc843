//! Filter engine -- rule publication, attach/detach and counters
//!
//! [`FilterEngine`] owns the shared tables for one filter mode and the hook
//! that feeds packets to the classifier. It is built with
//! [`FilterEngineBuilder`].
//!
//! # Architecture
//! ```text
//!  control plane                         packet path (any thread)
//! ┌──────────────┐  publish   ┌───────────┐
//! │ FilterEngine │──────────▶│ RuleStore │◀─┐
//! │              │  register  ├───────────┤  │   ┌────────────┐
//! │              │──────────▶│ Registry  │◀─┼───│ Classifier │◀── IngressHook
//! │              │  snapshot  ├───────────┤  │   └────────────┘
//! │              │◀──────────│ Counters  │◀─┘
//! └──────────────┘            └───────────┘
//! ```
//!
//! # Example
//! ```
//! use portwarden_filter::{EngineConfig, FilterEngine, InProcessHook};
//!
//! let hook = InProcessHook::new();
//! let tap = hook.tap();
//! let mut engine = FilterEngine::builder()
//!     .config(EngineConfig::port_block("lo", 8080))
//!     .hook(Box::new(hook))
//!     .build()?;
//!
//! engine.start()?;
//! # let frame = portwarden_filter::packet::testing::tcp_ipv4_frame(1, 8080);
//! tap.deliver(&frame);
//! assert_eq!(engine.sample().get("dropped"), 1);
//! engine.stop()?;
//! # Ok::<(), portwarden_core::PortwardenError>(())
//! ```

use std::sync::Arc;

use tracing::{info, warn};

use portwarden_core::config::FilterMode;
use portwarden_core::error::{EngineError, PortwardenError};

use crate::attribution::{AttributionProvider, NoAttribution};
use crate::classifier::{Classify, PortBlockClassifier, ProcessAwareClassifier};
use crate::config::{EngineConfig, PolicyConfig};
use crate::hook::IngressHook;
use crate::registry::{ProcessRecord, ProcessRegistry};
use crate::rule::{PortRule, ProcessFilterRule, RuleStore};
use crate::stats::{CounterSnapshot, CounterTable};

/// Engine health as seen by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Attached and counting
    Healthy,
    /// Running, but something needs attention
    Degraded(String),
    /// Not running or lost its hook
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Rule and counters as they were before a start attempt.
struct Checkpoint {
    counters: CounterSnapshot,
    rule: SavedRule,
}

enum SavedRule {
    Port(Option<Arc<PortRule>>, u64),
    Process(Option<Arc<ProcessFilterRule>>, u64),
}

/// Shared tables for the active mode.
enum Policy {
    PortBlock {
        rule: Arc<RuleStore<PortRule>>,
    },
    ProcessAware {
        rule: Arc<RuleStore<ProcessFilterRule>>,
        registry: Arc<ProcessRegistry>,
        attribution: Arc<dyn AttributionProvider>,
    },
}

/// Packet filter for one interface and one mode.
///
/// # Fields
/// - `config`: interface, framing and initial rule
/// - `hook`: delivers packets to the classifier
/// - `counters`: per-mode counter table
/// - `policy`: rule store (and registry, attribution in process-aware mode)
pub struct FilterEngine {
    config: EngineConfig,
    hook: Box<dyn IngressHook>,
    counters: Arc<CounterTable>,
    policy: Policy,
    running: bool,
}

/// [`FilterEngine`] builder.
pub struct FilterEngineBuilder {
    config: Option<EngineConfig>,
    hook: Option<Box<dyn IngressHook>>,
    registry: Option<Arc<ProcessRegistry>>,
    attribution: Option<Arc<dyn AttributionProvider>>,
}

impl FilterEngineBuilder {
    fn new() -> Self {
        Self {
            config: None,
            hook: None,
            registry: None,
            attribution: None,
        }
    }

    /// Engine settings (required).
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Packet source (required).
    pub fn hook(mut self, hook: Box<dyn IngressHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Shared process registry. A fresh one is created if not given.
    pub fn registry(mut self, registry: Arc<ProcessRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Attribution provider. Defaults to [`NoAttribution`].
    pub fn attribution(mut self, attribution: Arc<dyn AttributionProvider>) -> Self {
        self.attribution = Some(attribution);
        self
    }

    /// A hook that dictates its framing overrides `config.link_type`.
    ///
    /// # Errors
    /// - `EngineError::InitFailed`: config or hook missing
    pub fn build(self) -> Result<FilterEngine, PortwardenError> {
        let mut config = self
            .config
            .ok_or_else(|| EngineError::InitFailed("config is required".to_owned()))?;
        let hook = self
            .hook
            .ok_or_else(|| EngineError::InitFailed("hook is required".to_owned()))?;
        if let Some(link_type) = hook.link_type() {
            config.link_type = link_type;
        }

        let policy = match config.mode() {
            FilterMode::PortBlock => Policy::PortBlock {
                rule: Arc::new(RuleStore::new()),
            },
            FilterMode::ProcessAware => Policy::ProcessAware {
                rule: Arc::new(RuleStore::new()),
                registry: self.registry.unwrap_or_default(),
                attribution: self
                    .attribution
                    .unwrap_or_else(|| Arc::new(NoAttribution)),
            },
        };

        Ok(FilterEngine {
            counters: Arc::new(CounterTable::for_mode(config.mode())),
            config,
            hook,
            policy,
            running: false,
        })
    }
}

impl FilterEngine {
    pub fn builder() -> FilterEngineBuilder {
        FilterEngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn mode(&self) -> FilterMode {
        self.config.mode()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether the hook discards dropped packets, rather than only counting
    /// them.
    pub fn enforces_verdicts(&self) -> bool {
        self.hook.enforces_verdicts()
    }

    /// Name of the packet source.
    pub fn hook_kind(&self) -> &'static str {
        self.hook.kind()
    }

    /// Shared counter table.
    pub fn counters(&self) -> &Arc<CounterTable> {
        &self.counters
    }

    /// Reads every counter once.
    pub fn sample(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Zeroes the counters, publishes the configured rule and attaches.
    ///
    /// On failure nothing is attached, the engine stays stopped, and the
    /// counters and rule are put back as they were.
    pub fn start(&mut self) -> Result<(), PortwardenError> {
        if self.running {
            return Err(EngineError::AlreadyRunning.into());
        }

        info!(
            interface = self.config.interface.as_str(),
            mode = %self.mode(),
            hook = self.hook.kind(),
            "starting filter engine"
        );

        let checkpoint = self.checkpoint();
        self.counters.reset();
        self.publish_initial_rule();

        let classifier = self.classifier();
        if let Err(e) = self.hook.attach(&self.config.interface, classifier) {
            // attach is all-or-nothing, but make sure
            if self.hook.is_attached()
                && let Err(detach_err) = self.hook.detach()
            {
                warn!(error = %detach_err, "rollback detach failed");
            }
            self.rollback(checkpoint);
            return Err(e.into());
        }

        self.running = true;
        Ok(())
    }

    /// Detaches the classifier. Counters keep their values.
    pub fn stop(&mut self) -> Result<(), PortwardenError> {
        if !self.running {
            return Err(EngineError::NotRunning.into());
        }

        info!(interface = self.config.interface.as_str(), "stopping filter engine");
        self.hook.detach()?;
        self.running = false;
        Ok(())
    }

    /// Replaces the port-blocking rule.
    pub fn publish_port_rule(&self, rule: PortRule) -> Result<(), EngineError> {
        match &self.policy {
            Policy::PortBlock { rule: store } => {
                store.publish(rule);
                info!(port = rule.port, generation = store.generation(), "port rule published");
                Ok(())
            }
            Policy::ProcessAware { .. } => Err(self.wrong_mode(FilterMode::PortBlock)),
        }
    }

    /// Replaces the process-aware rule.
    pub fn publish_process_rule(&self, rule: ProcessFilterRule) -> Result<(), EngineError> {
        match &self.policy {
            Policy::ProcessAware { rule: store, .. } => {
                store.publish(rule);
                info!(
                    process = %rule.target,
                    allowed_port = rule.allowed_port,
                    generation = store.generation(),
                    "process rule published"
                );
                Ok(())
            }
            Policy::PortBlock { .. } => Err(self.wrong_mode(FilterMode::ProcessAware)),
        }
    }

    /// Adds or overwrites one registry entry.
    pub fn register_process(&self, record: ProcessRecord) -> Result<(), EngineError> {
        self.registry()?.register(record);
        Ok(())
    }

    /// Adds a batch of registry entries in one swap.
    pub fn register_processes(
        &self,
        records: impl IntoIterator<Item = ProcessRecord>,
    ) -> Result<(), EngineError> {
        self.registry()?.register_all(records);
        Ok(())
    }

    /// Process registry (process-aware mode only).
    pub fn registry(&self) -> Result<&Arc<ProcessRegistry>, EngineError> {
        match &self.policy {
            Policy::ProcessAware { registry, .. } => Ok(registry),
            Policy::PortBlock { .. } => Err(self.wrong_mode(FilterMode::ProcessAware)),
        }
    }

    /// Number of rule publications since the engine was built.
    pub fn rule_generation(&self) -> u64 {
        match &self.policy {
            Policy::PortBlock { rule } => rule.generation(),
            Policy::ProcessAware { rule, .. } => rule.generation(),
        }
    }

    /// Name of the attribution provider, if the mode uses one.
    pub fn attribution_name(&self) -> Option<&'static str> {
        match &self.policy {
            Policy::PortBlock { .. } => None,
            Policy::ProcessAware { attribution, .. } => Some(attribution.name()),
        }
    }

    /// A classifier over this engine's tables.
    pub fn classifier(&self) -> Arc<dyn Classify> {
        let link = self.config.link_type;
        let counters = Arc::clone(&self.counters);
        match &self.policy {
            Policy::PortBlock { rule } => {
                Arc::new(PortBlockClassifier::new(link, Arc::clone(rule), counters))
            }
            Policy::ProcessAware {
                rule,
                registry,
                attribution,
            } => Arc::new(ProcessAwareClassifier::new(
                link,
                Arc::clone(rule),
                Arc::clone(registry),
                Arc::clone(attribution),
                counters,
            )),
        }
    }

    pub fn health(&self) -> HealthStatus {
        if !self.running {
            return HealthStatus::Unhealthy("not running".to_owned());
        }
        if !self.hook.is_attached() {
            return HealthStatus::Unhealthy("hook detached".to_owned());
        }
        if let Policy::ProcessAware { registry, .. } = &self.policy
            && registry.is_empty()
        {
            return HealthStatus::Degraded("process registry is empty".to_owned());
        }
        HealthStatus::Healthy
    }

    fn checkpoint(&self) -> Checkpoint {
        let rule = match &self.policy {
            Policy::PortBlock { rule } => SavedRule::Port(rule.current(), rule.generation()),
            Policy::ProcessAware { rule, .. } => {
                SavedRule::Process(rule.current(), rule.generation())
            }
        };
        Checkpoint {
            counters: self.counters.snapshot(),
            rule,
        }
    }

    fn rollback(&self, checkpoint: Checkpoint) {
        self.counters.restore(&checkpoint.counters);
        match (&self.policy, checkpoint.rule) {
            (Policy::PortBlock { rule }, SavedRule::Port(saved, generation)) => {
                rule.restore(saved, generation);
            }
            (Policy::ProcessAware { rule, .. }, SavedRule::Process(saved, generation)) => {
                rule.restore(saved, generation);
            }
            // taken from the same policy
            _ => {}
        }
    }

    fn publish_initial_rule(&self) {
        let result = match self.config.policy {
            PolicyConfig::PortBlock(rule) => self.publish_port_rule(rule),
            PolicyConfig::ProcessAware(rule) => self.publish_process_rule(rule),
        };
        // policy and config share a mode by construction
        debug_assert!(result.is_ok());
    }

    fn wrong_mode(&self, expected: FilterMode) -> EngineError {
        EngineError::WrongMode {
            expected: expected.as_str(),
            actual: self.mode().as_str(),
        }
    }
}

impl Drop for FilterEngine {
    fn drop(&mut self) {
        if self.running
            && let Err(e) = self.hook.detach()
        {
            warn!(error = %e, "detach on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::PortRangeAttribution;
    use crate::classifier::Action;
    use crate::hook::InProcessHook;
    use crate::packet::{LinkType, testing};
    use crate::rule::ProcessName;
    use portwarden_core::error::SetupError;

    fn port_engine(port: u16) -> (FilterEngine, crate::hook::HookTap) {
        let hook = InProcessHook::new();
        let tap = hook.tap();
        let engine = FilterEngine::builder()
            .config(EngineConfig::port_block("lo", port))
            .hook(Box::new(hook))
            .build()
            .unwrap();
        (engine, tap)
    }

    fn process_rule() -> ProcessFilterRule {
        ProcessFilterRule {
            target: ProcessName::new("myprocess").unwrap(),
            allowed_port: 4040,
        }
    }

    // =========================================================================
    // builder
    // =========================================================================

    #[test]
    fn build_requires_config_and_hook() {
        let err = FilterEngine::builder()
            .hook(Box::new(InProcessHook::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, PortwardenError::Engine(EngineError::InitFailed(_))));

        let err = FilterEngine::builder()
            .config(EngineConfig::port_block("lo", 1))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, PortwardenError::Engine(EngineError::InitFailed(_))));
    }

    #[test]
    fn counter_layout_follows_mode() {
        let (engine, _) = port_engine(80);
        assert_eq!(engine.counters().len(), 2);

        let engine = FilterEngine::builder()
            .config(EngineConfig::process_aware("lo", process_rule()))
            .hook(Box::new(InProcessHook::new()))
            .build()
            .unwrap();
        assert_eq!(engine.counters().len(), 4);
        assert_eq!(engine.attribution_name(), Some("none"));
    }

    // =========================================================================
    // lifecycle
    // =========================================================================

    #[test]
    fn start_publishes_and_attaches() {
        let (mut engine, tap) = port_engine(8080);
        assert_eq!(engine.rule_generation(), 0);

        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(tap.is_attached());
        assert_eq!(engine.rule_generation(), 1);
        assert!(engine.health().is_healthy());

        engine.stop().unwrap();
        assert!(!tap.is_attached());
        assert!(!engine.health().is_healthy());
    }

    #[test]
    fn start_twice_fails() {
        let (mut engine, _) = port_engine(8080);
        engine.start().unwrap();
        let err = engine.start().unwrap_err();
        assert!(matches!(err, PortwardenError::Engine(EngineError::AlreadyRunning)));
    }

    #[test]
    fn stop_without_start_fails() {
        let (mut engine, _) = port_engine(8080);
        let err = engine.stop().unwrap_err();
        assert!(matches!(err, PortwardenError::Engine(EngineError::NotRunning)));
    }

    #[test]
    fn failed_attach_leaves_engine_stopped() {
        let mut engine = FilterEngine::builder()
            .config(EngineConfig::port_block("eth9", 8080))
            .hook(Box::new(InProcessHook::with_interfaces(["lo"])))
            .build()
            .unwrap();

        let err = engine.start().unwrap_err();
        assert!(matches!(
            err,
            PortwardenError::Setup(SetupError::InterfaceNotFound { .. })
        ));
        assert!(!engine.is_running());
    }

    /// Attaches once, then refuses.
    struct AttachOnce {
        inner: InProcessHook,
        attaches: u32,
    }

    impl IngressHook for AttachOnce {
        fn attach(
            &mut self,
            interface: &str,
            classifier: Arc<dyn Classify>,
        ) -> Result<(), SetupError> {
            self.attaches += 1;
            if self.attaches > 1 {
                return Err(SetupError::AttachFailed {
                    interface: interface.to_owned(),
                    reason: "device busy".to_owned(),
                });
            }
            self.inner.attach(interface, classifier)
        }

        fn detach(&mut self) -> Result<(), SetupError> {
            self.inner.detach()
        }

        fn is_attached(&self) -> bool {
            self.inner.is_attached()
        }

        fn kind(&self) -> &'static str {
            "attach-once"
        }
    }

    #[test]
    fn failed_restart_keeps_previous_counters_and_rule() {
        // Given: one run that counted two packets
        let inner = InProcessHook::new();
        let tap = inner.tap();
        let mut engine = FilterEngine::builder()
            .config(EngineConfig::port_block("lo", 8080))
            .hook(Box::new(AttachOnce { inner, attaches: 0 }))
            .build()
            .unwrap();
        engine.start().unwrap();
        tap.deliver(&testing::tcp_ipv4_frame(1, 8080));
        tap.deliver(&testing::tcp_ipv4_frame(1, 80));
        engine.publish_port_rule(PortRule { port: 9090 }).unwrap();
        engine.stop().unwrap();
        let before = engine.sample();

        // When: the second attach fails
        let err = engine.start().unwrap_err();

        // Then: nothing from the failed start is visible
        assert!(matches!(
            err,
            PortwardenError::Setup(SetupError::AttachFailed { .. })
        ));
        assert!(!engine.is_running());
        assert!(!tap.is_attached());
        assert_eq!(engine.sample(), before);
        assert_eq!(before.total(), 2);
        assert_eq!(before.get("dropped"), 1);
        assert_eq!(engine.rule_generation(), 2);
        let Policy::PortBlock { rule } = &engine.policy else {
            panic!("port engine");
        };
        assert_eq!(rule.current().map(|r| r.port), Some(9090));
    }

    #[test]
    fn hook_framing_overrides_config() {
        struct RawHook(InProcessHook);

        impl IngressHook for RawHook {
            fn attach(
                &mut self,
                interface: &str,
                classifier: Arc<dyn Classify>,
            ) -> Result<(), SetupError> {
                self.0.attach(interface, classifier)
            }
            fn detach(&mut self) -> Result<(), SetupError> {
                self.0.detach()
            }
            fn is_attached(&self) -> bool {
                self.0.is_attached()
            }
            fn kind(&self) -> &'static str {
                "raw"
            }
            fn link_type(&self) -> Option<LinkType> {
                Some(LinkType::Raw)
            }
        }

        let inner = InProcessHook::new();
        let tap = inner.tap();
        let mut engine = FilterEngine::builder()
            .config(EngineConfig::port_block("lo", 8080))
            .hook(Box::new(RawHook(inner)))
            .build()
            .unwrap();
        assert_eq!(engine.config().link_type, LinkType::Raw);
        assert_eq!(engine.hook_kind(), "raw");

        engine.start().unwrap();
        // IP packet without the 14-byte Ethernet header
        let ip_packet = &testing::tcp_ipv4_frame(1, 8080)[14..];
        assert_eq!(tap.deliver(ip_packet), Some(Action::Drop));
    }

    #[test]
    fn start_resets_counters() {
        let (mut engine, tap) = port_engine(8080);
        engine.start().unwrap();
        tap.deliver(&testing::tcp_ipv4_frame(1, 8080));
        engine.stop().unwrap();
        assert_eq!(engine.sample().total(), 1);

        engine.start().unwrap();
        assert_eq!(engine.sample().total(), 0);
    }

    #[test]
    fn stop_keeps_counters_for_final_sample() {
        let (mut engine, tap) = port_engine(8080);
        engine.start().unwrap();
        tap.deliver(&testing::tcp_ipv4_frame(1, 8080));
        engine.stop().unwrap();
        assert_eq!(tap.deliver(&testing::tcp_ipv4_frame(1, 8080)), None);
        assert_eq!(engine.sample().get("dropped"), 1);
    }

    // =========================================================================
    // mode checks
    // =========================================================================

    #[test]
    fn wrong_mode_operations_are_rejected() {
        let (engine, _) = port_engine(8080);
        assert!(matches!(
            engine.publish_process_rule(process_rule()),
            Err(EngineError::WrongMode { .. })
        ));
        assert!(engine.registry().is_err());
        assert!(
            engine
                .register_process(ProcessRecord::new(ProcessName::new("a").unwrap(), 1))
                .is_err()
        );
    }

    #[test]
    fn process_engine_reports_degraded_with_empty_registry() {
        let mut engine = FilterEngine::builder()
            .config(EngineConfig::process_aware("lo", process_rule()))
            .hook(Box::new(InProcessHook::new()))
            .attribution(Arc::new(PortRangeAttribution {
                first: 4000,
                last: 5000,
                pid: 1000,
            }))
            .build()
            .unwrap();
        engine.start().unwrap();
        assert!(matches!(engine.health(), HealthStatus::Degraded(_)));

        engine
            .register_process(ProcessRecord::new(ProcessName::new("myprocess").unwrap(), 1000))
            .unwrap();
        assert!(engine.health().is_healthy());
        assert!(matches!(
            engine.publish_port_rule(PortRule { port: 1 }),
            Err(EngineError::WrongMode { .. })
        ));
    }
}
