//! Process registry: pid → process record.
//!
//! Written by the control plane, read by classifiers through attribution.
//! Writers copy the table, modify the copy and swap it in; readers never
//! block.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::rule::ProcessName;

/// One known process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessRecord {
    pub command_name: ProcessName,
    pub pid: u32,
    pub tgid: u32,
}

impl ProcessRecord {
    /// Record for a single-threaded process (`tgid == pid`).
    pub fn new(command_name: ProcessName, pid: u32) -> Self {
        Self {
            command_name,
            pid,
            tgid: pid,
        }
    }
}

/// Concurrent pid → [`ProcessRecord`] table.
#[derive(Debug)]
pub struct ProcessRegistry {
    table: ArcSwap<HashMap<u32, ProcessRecord>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Inserts or overwrites the record keyed by `record.pid`.
    pub fn register(&self, record: ProcessRecord) {
        self.table.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(record.pid, record);
            next
        });
    }

    /// Inserts a batch with a single swap.
    pub fn register_all(&self, records: impl IntoIterator<Item = ProcessRecord>) {
        let records: Vec<ProcessRecord> = records.into_iter().collect();
        if records.is_empty() {
            return;
        }
        self.table.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.extend(records.iter().map(|r| (r.pid, *r)));
            next
        });
    }

    /// Removes a pid. Returns whether it was present.
    pub fn remove(&self, pid: u32) -> bool {
        let mut removed = false;
        self.table.rcu(|current| {
            let mut next = HashMap::clone(current);
            removed = next.remove(&pid).is_some();
            next
        });
        removed
    }

    pub fn get(&self, pid: u32) -> Option<ProcessRecord> {
        self.table.load().get(&pid).copied()
    }

    /// Whether `pid` is registered under exactly `name`.
    #[inline]
    pub fn matches(&self, pid: u32, name: &ProcessName) -> bool {
        self.table
            .load()
            .get(&pid)
            .is_some_and(|record| record.command_name == *name)
    }

    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.load().is_empty()
    }

    /// Point-in-time copy of the whole table.
    pub fn snapshot(&self) -> Arc<HashMap<u32, ProcessRecord>> {
        self.table.load_full()
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}
