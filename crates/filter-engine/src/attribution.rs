//! Packet → process attribution.
//!
//! Process-aware filtering needs to know which process a packet belongs to.
//! How that is learned is pluggable; `None` always means "not attributed",
//! which the classifier treats as traffic of some other process.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::packet::HeaderView;

/// Maps a packet to the pid that owns it, if known.
///
/// Called on the packet path: must not block or allocate.
pub trait AttributionProvider: Send + Sync {
    fn attribute(&self, view: &HeaderView) -> Option<u32>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Never attributes anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAttribution;

impl AttributionProvider for NoAttribution {
    fn attribute(&self, _view: &HeaderView) -> Option<u32> {
        None
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Attributes TCP packets whose destination port lies in `first..=last`
/// to a single pid.
#[derive(Debug, Clone, Copy)]
pub struct PortRangeAttribution {
    pub first: u16,
    pub last: u16,
    pub pid: u32,
}

impl AttributionProvider for PortRangeAttribution {
    fn attribute(&self, view: &HeaderView) -> Option<u32> {
        let port = view.tcp_dst_port()?;
        (self.first..=self.last).contains(&port).then_some(self.pid)
    }

    fn name(&self) -> &'static str {
        "port-range"
    }
}

/// Control-plane maintained destination port → pid table.
#[derive(Debug)]
pub struct PortMapAttribution {
    owners: ArcSwap<HashMap<u16, u32>>,
}

impl PortMapAttribution {
    pub fn new() -> Self {
        Self {
            owners: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn from_owners(owners: impl IntoIterator<Item = (u16, u32)>) -> Self {
        Self {
            owners: ArcSwap::from_pointee(owners.into_iter().collect()),
        }
    }

    pub fn insert(&self, port: u16, pid: u32) {
        self.owners.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(port, pid);
            next
        });
    }

    pub fn remove(&self, port: u16) {
        self.owners.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(&port);
            next
        });
    }

    /// Replaces the whole table in one swap.
    pub fn replace_all(&self, owners: impl IntoIterator<Item = (u16, u32)>) {
        self.owners.store(Arc::new(owners.into_iter().collect()));
    }

    pub fn len(&self) -> usize {
        self.owners.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.load().is_empty()
    }
}

impl Default for PortMapAttribution {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributionProvider for PortMapAttribution {
    fn attribute(&self, view: &HeaderView) -> Option<u32> {
        let port = view.tcp_dst_port()?;
        self.owners.load().get(&port).copied()
    }

    fn name(&self) -> &'static str {
        "port-map"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{LinkType, parse, testing};

    fn view(dst_port: u16) -> HeaderView {
        parse(&testing::tcp_ipv4_frame(50000, dst_port), LinkType::Ethernet).unwrap()
    }

    #[test]
    fn none_never_attributes() {
        assert_eq!(NoAttribution.attribute(&view(4040)), None);
    }

    #[test]
    fn port_range_is_inclusive() {
        let attr = PortRangeAttribution {
            first: 4000,
            last: 5000,
            pid: 1000,
        };
        assert_eq!(attr.attribute(&view(4000)), Some(1000));
        assert_eq!(attr.attribute(&view(5000)), Some(1000));
        assert_eq!(attr.attribute(&view(3999)), None);
        assert_eq!(attr.attribute(&view(5001)), None);
    }

    #[test]
    fn port_range_ignores_non_tcp() {
        let attr = PortRangeAttribution {
            first: 0,
            last: u16::MAX,
            pid: 1,
        };
        let udp = parse(&testing::udp_ipv4_frame(1, 4040), LinkType::Ethernet).unwrap();
        assert_eq!(attr.attribute(&udp), None);
    }

    #[test]
    fn port_map_insert_remove_replace() {
        let attr = PortMapAttribution::new();
        assert!(attr.is_empty());
        assert_eq!(attr.attribute(&view(4040)), None);

        attr.insert(4040, 1000);
        assert_eq!(attr.attribute(&view(4040)), Some(1000));

        attr.remove(4040);
        assert_eq!(attr.attribute(&view(4040)), None);

        attr.replace_all([(80, 1), (443, 2)]);
        assert_eq!(attr.len(), 2);
        assert_eq!(attr.attribute(&view(443)), Some(2));
    }

    #[test]
    fn providers_are_object_safe() {
        let providers: Vec<Arc<dyn AttributionProvider>> = vec![
            Arc::new(NoAttribution),
            Arc::new(PortMapAttribution::from_owners([(22, 9)])),
        ];
        let names: Vec<_> = providers.iter().map(|p| p.name()).collect();
        assert_eq!(names, ["none", "port-map"]);
    }
}
