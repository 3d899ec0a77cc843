//! Rule types and the atomically replaceable rule store.
//!
//! Each filter mode has exactly one active rule. The control plane replaces
//! it whole; classifiers on any thread read it without blocking and never
//! observe a half-written value.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;

use portwarden_core::config::{PROCESS_NAME_LEN, validate_process_name};
use portwarden_core::error::ConfigError;

/// Fixed-width, zero-padded process command name.
///
/// Equality is byte-exact over all 16 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProcessName([u8; PROCESS_NAME_LEN]);

impl ProcessName {
    /// Builds a name from operator input. Empty or over-long names are rejected.
    pub fn new(name: &str) -> Result<Self, ConfigError> {
        validate_process_name("process name", name)?;
        Ok(Self::from_kernel_bytes(name.as_bytes()))
    }

    /// Builds a name from kernel-reported bytes, truncating to 16.
    pub fn from_kernel_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; PROCESS_NAME_LEN];
        let len = bytes.len().min(PROCESS_NAME_LEN);
        buf[..len].copy_from_slice(&bytes[..len]);
        Self(buf)
    }

    pub fn as_bytes(&self) -> &[u8; PROCESS_NAME_LEN] {
        &self.0
    }

    /// Bytes up to the first zero pad.
    pub fn trimmed(&self) -> &[u8] {
        let end = self
            .0
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(PROCESS_NAME_LEN);
        &self.0[..end]
    }
}

impl fmt::Display for ProcessName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.trimmed()))
    }
}

impl fmt::Debug for ProcessName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessName({:?})", String::from_utf8_lossy(self.trimmed()))
    }
}

/// Port-blocking rule: drop TCP traffic to `port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRule {
    pub port: u16,
}

/// Process-aware rule: `target` may only reach `allowed_port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessFilterRule {
    pub target: ProcessName,
    pub allowed_port: u16,
}

/// Single-slot store for the active rule.
///
/// Reads before the first publish see `None`.
pub struct RuleStore<T> {
    slot: ArcSwapOption<T>,
    generation: AtomicU64,
}

impl<T> RuleStore<T> {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
        }
    }

    /// Replaces the active rule. The next read on any thread sees it.
    pub fn publish(&self, rule: T) {
        self.slot.store(Some(Arc::new(rule)));
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Clones out the active rule.
    pub fn current(&self) -> Option<Arc<T>> {
        self.slot.load_full()
    }

    /// Runs `f` against the active rule without cloning the `Arc`.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let guard = self.slot.load();
        f(guard.as_deref())
    }

    /// Number of publishes so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Puts back a rule read with [`current`](Self::current) together with
    /// the generation it had.
    pub fn restore(&self, rule: Option<Arc<T>>, generation: u64) {
        self.slot.store(rule);
        self.generation.store(generation, Ordering::Release);
    }
}

impl<T> Default for RuleStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for RuleStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleStore")
            .field("current", &self.current())
            .field("generation", &self.generation())
            .finish()
    }
}
