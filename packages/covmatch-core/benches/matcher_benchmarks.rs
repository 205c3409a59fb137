//! Matcher hot-path benchmarks.
//!
//! The sequence matcher runs once per distinct output line, so its
//! throughput bounds the whole feedback loop on cache-miss-heavy targets.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use covmatch_core::features::seq_match::SeqMatcher;

fn synthetic_patterns() -> Vec<Vec<Vec<u8>>> {
    let mut patterns = Vec::new();
    for i in 0..200 {
        patterns.push(vec![format!("error code {i}: ").into_bytes()]);
        patterns.push(vec![
            format!("module{i} ").into_bytes(),
            b" failed with ".to_vec(),
            b" retries".to_vec(),
        ]);
    }
    patterns
}

fn synthetic_text() -> Vec<u8> {
    let mut text = Vec::new();
    for i in 0..50 {
        text.extend_from_slice(format!("error code {}: unexpected byte\n", i % 7).as_bytes());
        text.extend_from_slice(
            format!("module{} init failed with 3 retries\n", i % 11).as_bytes(),
        );
        text.extend_from_slice(b"unrelated log chatter without any literal\n");
    }
    text
}

fn bench_seq_matcher(c: &mut Criterion) {
    let matcher = SeqMatcher::new(synthetic_patterns());
    let text = synthetic_text();

    c.bench_function("seq_matcher_search_150_lines", |b| {
        b.iter(|| black_box(matcher.search(black_box(&text))))
    });

    let line = b"module3 init failed with 3 retries\n";
    c.bench_function("seq_matcher_search_single_line", |b| {
        b.iter(|| black_box(matcher.search(black_box(line))))
    });
}

criterion_group!(benches, bench_seq_matcher);
criterion_main!(benches);
