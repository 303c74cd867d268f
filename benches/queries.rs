//! Benchmarks for fragment and composite queries.
//!
//! Run with: `cargo bench --bench queries`
//!
//! The corpus is generated: a header of declarations and translation units
//! that define and call them.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tempfile::TempDir;

use cxx_indexer::index::NamePattern;
use cxx_indexer::indexer::{ParseRequest, SourceParser, TreeSitterFrontend};
use cxx_indexer::{
    BindingResolver, CompositeView, Filter, FragmentId, FragmentStore, LocationRegistry,
};

const UNITS: usize = 20;
const FUNCTIONS_PER_UNIT: usize = 50;

fn generate(dir: &Path) {
    let mut header = String::from("#pragma once\nnamespace bench {\n");
    for unit in 0..UNITS {
        for f in 0..FUNCTIONS_PER_UNIT {
            let _ = writeln!(header, "int compute_{}_{}(int value);", unit, f);
        }
    }
    header.push_str("}\n");
    std::fs::write(dir.join("bench.h"), header).unwrap();

    for unit in 0..UNITS {
        let mut source = String::from("#include \"bench.h\"\nnamespace bench {\n");
        for f in 0..FUNCTIONS_PER_UNIT {
            let callee = (f + 1) % FUNCTIONS_PER_UNIT;
            let _ = writeln!(
                source,
                "int compute_{u}_{f}(int value) {{ return value > 0 ? compute_{u}_{c}(value - 1) : 0; }}",
                u = unit,
                f = f,
                c = callee
            );
        }
        source.push_str("}\n");
        std::fs::write(dir.join(format!("unit_{}.cpp", unit)), source).unwrap();
    }
}

/// Indexes the generated corpus into `count` in-memory fragments.
fn fragments(dir: &Path, count: u32) -> Vec<Arc<FragmentStore>> {
    let mut registry = LocationRegistry::new();
    registry.register_project("bench", dir);
    let frontend = TreeSitterFrontend::new();

    (1..=count)
        .map(|id| {
            let store = FragmentStore::in_memory(FragmentId(id), &format!("bench{}", id));
            let mut txn = store.begin_write().unwrap();
            for unit in 0..UNITS {
                let request = ParseRequest::new(dir.join(format!("unit_{}.cpp", unit)));
                for file in frontend.parse(&request).unwrap() {
                    txn.replace_file(file.into_update(&registry).unwrap());
                }
            }
            txn.commit().unwrap();
            Arc::new(store)
        })
        .collect()
}

fn bench_fragment_queries(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    generate(dir.path());
    let stores = fragments(dir.path(), 1);
    let data = stores[0].acquire_read().unwrap();
    let filter = Filter::all();

    let mut group = c.benchmark_group("fragment");
    group.bench_function("exact_name", |b| {
        b.iter(|| {
            black_box(data.find_bindings_by_exact_name(&["bench", "compute_7_21"], &filter))
        })
    });
    group.bench_function("prefix", |b| {
        b.iter(|| black_box(data.find_bindings_by_prefix("COMPUTE_1", false, &filter)))
    });
    let pattern = NamePattern::parse("bench::compute_1.*_4.*").unwrap();
    group.bench_function("pattern", |b| {
        b.iter(|| black_box(data.find_bindings(&pattern, false, &filter)))
    });
    group.finish();
}

fn bench_composite_queries(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    generate(dir.path());

    let mut group = c.benchmark_group("composite");
    for count in [1u32, 2, 4] {
        let stores = fragments(dir.path(), count);
        group.bench_with_input(BenchmarkId::new("lock", count), &stores, |b, stores| {
            b.iter(|| black_box(CompositeView::lock(stores).unwrap().binding_count()))
        });

        let view = CompositeView::lock(&stores).unwrap();
        let resolver = BindingResolver::new(&view);
        group.bench_with_input(BenchmarkId::new("references", count), &count, |b, _| {
            b.iter(|| {
                let binding = resolver.find_exact("bench::compute_3_10", None).unwrap();
                black_box(resolver.find_references(&binding).len())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fragment_queries, bench_composite_queries);
criterion_main!(benches);
