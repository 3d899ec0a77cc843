//! Counter table -- per-mode packet counters
//!
//! [`CounterTable`] is a fixed array of named 64-bit counters shared by every
//! classifier thread and the sampler. Each cell sits on its own cache line so
//! concurrent increments from different cores do not contend.
//!
//! # Data flow
//! ```text
//! classify() ──fetch_add──▶ CounterTable ──snapshot──▶ CounterSnapshot ──▶ reporter
//!                            (atomic cells)              (owned values)     metrics
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use portwarden_core::config::FilterMode;
use portwarden_core::metrics as m;
use serde::Serialize;

/// Every packet the classifier saw
pub const IDX_TOTAL: usize = 0;
/// Port-blocking mode: packets dropped
pub const IDX_DROPPED: usize = 1;
/// Process-aware mode: target traffic to the allowed port
pub const IDX_ALLOWED: usize = 1;
/// Process-aware mode: target traffic to any other port
pub const IDX_BLOCKED: usize = 2;
/// Process-aware mode: TCP traffic not attributed to the target
pub const IDX_OTHER_PROCESS: usize = 3;

/// Cell names for port-blocking mode, by index.
pub const PORT_BLOCK_COUNTERS: &[&str] = &["total", "dropped"];
/// Cell names for process-aware mode, by index.
pub const PROCESS_AWARE_COUNTERS: &[&str] = &["total", "allowed", "blocked", "other_process"];

#[repr(align(64))]
#[derive(Debug, Default)]
struct Cell(AtomicU64);

/// Concurrently incrementable counter array.
#[derive(Debug)]
pub struct CounterTable {
    names: &'static [&'static str],
    cells: Box<[Cell]>,
}

impl CounterTable {
    /// Zeroed table with one cell per name.
    pub fn new(names: &'static [&'static str]) -> Self {
        let cells = names.iter().map(|_| Cell::default()).collect();
        Self { names, cells }
    }

    /// The table layout a mode uses.
    pub fn for_mode(mode: FilterMode) -> Self {
        match mode {
            FilterMode::PortBlock => Self::new(PORT_BLOCK_COUNTERS),
            FilterMode::ProcessAware => Self::new(PROCESS_AWARE_COUNTERS),
        }
    }

    /// Adds one to a cell. Out-of-range indices are ignored.
    #[inline]
    pub fn increment(&self, index: usize) {
        if let Some(cell) = self.cells.get(index) {
            cell.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current value of a cell, `None` if the index does not exist.
    pub fn get(&self, index: usize) -> Option<u64> {
        self.cells.get(index).map(|cell| cell.0.load(Ordering::Relaxed))
    }

    /// Writes zero to every cell.
    pub fn reset(&self) {
        for cell in self.cells.iter() {
            cell.0.store(0, Ordering::Relaxed);
        }
    }

    /// Writes the values of a snapshot back, by cell name. Cells the
    /// snapshot lacks become zero.
    pub fn restore(&self, snapshot: &CounterSnapshot) {
        for (cell, name) in self.cells.iter().zip(self.names) {
            cell.0.store(snapshot.get(name), Ordering::Relaxed);
        }
    }

    pub fn names(&self) -> &'static [&'static str] {
        self.names
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Reads every cell once. Cells are read independently, so the result is
    /// not a single point in time across cells.
    pub fn snapshot(&self) -> CounterSnapshot {
        let entries = self
            .names
            .iter()
            .enumerate()
            .map(|(index, name)| CounterEntry {
                name: *name,
                value: self.get(index).unwrap_or(0),
            })
            .collect();
        CounterSnapshot { entries }
    }
}

/// One named counter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterEntry {
    pub name: &'static str,
    pub value: u64,
}

/// Owned copy of a [`CounterTable`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub entries: Vec<CounterEntry>,
}

impl CounterSnapshot {
    /// Value by cell name. Missing cells read as zero.
    pub fn get(&self, name: &str) -> u64 {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map_or(0, |e| e.value)
    }

    pub fn total(&self) -> u64 {
        self.get("total")
    }

    pub fn iter(&self) -> impl Iterator<Item = &CounterEntry> {
        self.entries.iter()
    }

    /// Per-cell increase since `previous`.
    pub fn delta_since(&self, previous: &CounterSnapshot) -> CounterSnapshot {
        let entries = self
            .entries
            .iter()
            .map(|e| CounterEntry {
                name: e.name,
                value: e.value.saturating_sub(previous.get(e.name)),
            })
            .collect();
        CounterSnapshot { entries }
    }

    /// Publishes every cell as an absolute Prometheus counter.
    pub fn publish_metrics(&self, mode: FilterMode) {
        for entry in &self.entries {
            metrics::counter!(
                m::FILTER_PACKETS_TOTAL,
                m::LABEL_COUNTER => entry.name,
                m::LABEL_MODE => mode.as_str()
            )
            .absolute(entry.value);
        }
    }
}
