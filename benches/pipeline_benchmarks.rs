//! Benchmarks for the per-batch hot paths: pre-screen scoring and
//! anomaly response parsing.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tickscope::analysis::parse_anomalies;
use tickscope::ingest::{pre_screen, PreScreenConfig};
use tickscope::utils::types::Tick;

fn create_test_batch(n: usize) -> Vec<Tick> {
    (0..n)
        .map(|i| {
            let price = 100.0 + (i as f64).sin() * 0.5;
            let volume = if i % 97 == 0 { 50_000.0 } else { 1_000.0 + (i as f64) * 10.0 };
            Tick::new("bench", 1_700_000_000_000 + i as u64 * 60_000)
                .with_symbol(if i % 2 == 0 { "AAPL" } else { "MSFT" })
                .with_metric("close", price)
                .with_metric("volume", volume)
        })
        .collect()
}

fn bench_pre_screen(c: &mut Criterion) {
    let config = PreScreenConfig::default();
    let mut group = c.benchmark_group("pre_screen");
    for n in [100usize, 1_000, 10_000] {
        let batch = create_test_batch(n);
        group.bench_function(format!("{n}_ticks"), |b| b.iter(|| pre_screen(black_box(&batch), &config)));
    }
    group.finish();
}

fn bench_parse_anomalies(c: &mut Criterion) {
    let item = r#"{"severity":"high","source":"bench","symbol":"aapl","description":"volume spike","metrics":{"volume":50000},"preScreenScore":0.9}"#;
    let body = format!(
        "Here is what I found:\n```json\n[{}]\n```\nLet me know if you need more.",
        vec![item; 50].join(",")
    );
    c.bench_function("parse_anomalies_fenced_50", |b| b.iter(|| parse_anomalies(black_box(&body))));
}

criterion_group!(benches, bench_pre_screen, bench_parse_anomalies);
criterion_main!(benches);
