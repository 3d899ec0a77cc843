//! Property tests: arbitrary input never panics and never loses a count.

use std::sync::Arc;

use proptest::prelude::*;

use portwarden_core::config::FilterMode;
use portwarden_filter::packet::testing::tcp_ipv4_frame;
use portwarden_filter::{
    Action, Classify, CounterTable, LinkType, PortBlockClassifier, PortMapAttribution, PortRule,
    ProcessAwareClassifier, ProcessFilterRule, ProcessName, ProcessRecord, ProcessRegistry,
    RuleStore,
};

fn port_classifier(port: u16) -> (PortBlockClassifier, Arc<CounterTable>) {
    let rule = Arc::new(RuleStore::new());
    rule.publish(PortRule { port });
    let counters = Arc::new(CounterTable::for_mode(FilterMode::PortBlock));
    let classifier = PortBlockClassifier::new(LinkType::Ethernet, rule, Arc::clone(&counters));
    (classifier, counters)
}

fn process_classifier(owners: Vec<(u16, u32)>) -> (ProcessAwareClassifier, Arc<CounterTable>) {
    let name = ProcessName::new("myprocess").unwrap();
    let rule = Arc::new(RuleStore::new());
    rule.publish(ProcessFilterRule {
        target: name,
        allowed_port: 4040,
    });
    let registry = Arc::new(ProcessRegistry::new());
    registry.register(ProcessRecord::new(name, 1000));
    let counters = Arc::new(CounterTable::for_mode(FilterMode::ProcessAware));
    let classifier = ProcessAwareClassifier::new(
        LinkType::Ethernet,
        rule,
        registry,
        Arc::new(PortMapAttribution::from_owners(owners)),
        Arc::clone(&counters),
    );
    (classifier, counters)
}

proptest! {
    #[test]
    fn port_block_counts_any_bytes(data in proptest::collection::vec(any::<u8>(), 0..256)) {
        let (classifier, counters) = port_classifier(8080);
        classifier.classify(&data);
        let snap = counters.snapshot();
        prop_assert_eq!(snap.total(), 1);
        prop_assert!(snap.get("dropped") <= 1);
    }

    #[test]
    fn process_aware_counts_any_bytes(data in proptest::collection::vec(any::<u8>(), 0..256)) {
        let (classifier, counters) = process_classifier(vec![(4040, 1000)]);
        classifier.classify(&data);
        let snap = counters.snapshot();
        prop_assert_eq!(snap.total(), 1);
        let classified = snap.get("allowed") + snap.get("blocked") + snap.get("other_process");
        prop_assert!(classified <= 1);
    }

    #[test]
    fn port_block_drops_exactly_the_blocked_port(blocked in 1u16.., dst in 1u16..) {
        let (classifier, _) = port_classifier(blocked);
        let expected = if dst == blocked { Action::Drop } else { Action::Pass };
        prop_assert_eq!(classifier.classify(&tcp_ipv4_frame(1, dst)), expected);
    }

    #[test]
    fn process_aware_only_drops_target_off_allowed_port(dst in 1u16.., pid in 1u32..4000) {
        let (classifier, counters) = process_classifier(vec![(dst, pid)]);
        let action = classifier.classify(&tcp_ipv4_frame(1, dst));
        let should_drop = pid == 1000 && dst != 4040;
        prop_assert_eq!(action == Action::Drop, should_drop);
        prop_assert_eq!(counters.snapshot().get("blocked"), u64::from(should_drop));
    }

    #[test]
    fn truncated_tcp_frames_pass(cut in 0usize..54) {
        let (classifier, counters) = port_classifier(8080);
        let frame = tcp_ipv4_frame(1, 8080);
        prop_assert_eq!(classifier.classify(&frame[..cut]), Action::Pass);
        prop_assert_eq!(counters.snapshot().get("dropped"), 0);
    }
}
