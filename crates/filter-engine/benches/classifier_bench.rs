//! Classifier benchmarks
//!
//! Header parsing and per-packet classification cost for both modes.

use std::sync::Arc;

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use portwarden_core::config::FilterMode;
use portwarden_filter::packet::testing::{tcp_ipv4_frame, tcp_ipv6_frame, udp_ipv4_frame};
use portwarden_filter::packet::{self, LinkType};
use portwarden_filter::{
    Classify, CounterTable, PortBlockClassifier, PortMapAttribution, PortRule,
    ProcessAwareClassifier, ProcessFilterRule, ProcessName, ProcessRecord, ProcessRegistry,
    RuleStore,
};

fn port_block_classifier() -> PortBlockClassifier {
    let rule = Arc::new(RuleStore::new());
    rule.publish(PortRule { port: 8080 });
    PortBlockClassifier::new(
        LinkType::Ethernet,
        rule,
        Arc::new(CounterTable::for_mode(FilterMode::PortBlock)),
    )
}

fn process_aware_classifier(registered: u32) -> ProcessAwareClassifier {
    let name = ProcessName::new("myprocess").unwrap();
    let rule = Arc::new(RuleStore::new());
    rule.publish(ProcessFilterRule {
        target: name,
        allowed_port: 4040,
    });

    let registry = Arc::new(ProcessRegistry::new());
    registry.register_all((1..=registered).map(|pid| ProcessRecord::new(name, pid)));

    let attribution = PortMapAttribution::from_owners([(4040, 1), (9999, 1), (5555, u32::MAX)]);
    ProcessAwareClassifier::new(
        LinkType::Ethernet,
        rule,
        registry,
        Arc::new(attribution),
        Arc::new(CounterTable::for_mode(FilterMode::ProcessAware)),
    )
}

fn bench_parse(c: &mut Criterion) {
    let v4 = tcp_ipv4_frame(40000, 8080);
    let v6 = tcp_ipv6_frame(40000, 8080);
    let udp = udp_ipv4_frame(40000, 53);

    let mut group = c.benchmark_group("packet_parse");
    group.throughput(Throughput::Elements(1));

    group.bench_function("tcp_ipv4", |b| {
        b.iter(|| packet::parse(black_box(&v4), LinkType::Ethernet))
    });
    group.bench_function("tcp_ipv6", |b| {
        b.iter(|| packet::parse(black_box(&v6), LinkType::Ethernet))
    });
    group.bench_function("udp_ipv4", |b| {
        b.iter(|| packet::parse(black_box(&udp), LinkType::Ethernet))
    });
    group.bench_function("truncated", |b| {
        b.iter(|| packet::parse(black_box(&v4[..20]), LinkType::Ethernet))
    });

    group.finish();
}

fn bench_port_block(c: &mut Criterion) {
    let classifier = port_block_classifier();
    let blocked = tcp_ipv4_frame(40000, 8080);
    let passed = tcp_ipv4_frame(40000, 80);

    let mut group = c.benchmark_group("port_block");
    group.throughput(Throughput::Elements(1));

    group.bench_function("drop", |b| b.iter(|| classifier.classify(black_box(&blocked))));
    group.bench_function("pass", |b| b.iter(|| classifier.classify(black_box(&passed))));

    group.finish();
}

fn bench_process_aware(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_aware");
    group.throughput(Throughput::Elements(1));

    for registered in [1u32, 1_000] {
        let classifier = process_aware_classifier(registered);
        let allowed = tcp_ipv4_frame(40000, 4040);
        let blocked = tcp_ipv4_frame(40000, 9999);
        let other = tcp_ipv4_frame(40000, 5555);

        group.bench_function(format!("allowed/{registered}"), |b| {
            b.iter(|| classifier.classify(black_box(&allowed)))
        });
        group.bench_function(format!("blocked/{registered}"), |b| {
            b.iter(|| classifier.classify(black_box(&blocked)))
        });
        group.bench_function(format!("other_process/{registered}"), |b| {
            b.iter(|| classifier.classify(black_box(&other)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_parse, bench_port_block, bench_process_aware);
criterion_main!(benches);
