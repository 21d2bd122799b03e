use criterion::{criterion_group, criterion_main, Criterion};
use lakefed::adapter::{MemoryAdapter, SourceKind, SourceRegistry};
use lakefed::common::{Column, ColumnType, Schema, Value};
use lakefed::optimizer::{Optimizer, OptimizerConfig};
use lakefed::parser::QueryParser;
use lakefed::plan::fingerprint;
use std::sync::Arc;

fn registry() -> Arc<SourceRegistry> {
    let registry = Arc::new(SourceRegistry::new());
    let pg = MemoryAdapter::new("pg", SourceKind::Relational);
    pg.add_table(
        "users",
        Schema::new(vec![
            Column::new("id", ColumnType::Int64, false),
            Column::new("name", ColumnType::Utf8, true),
            Column::new("age", ColumnType::Int64, true),
        ]),
        (0..10_000)
            .map(|i| {
                vec![
                    Value::Integer(i),
                    Value::String(format!("u{}", i)),
                    Value::Integer(i % 90),
                ]
            })
            .collect(),
    );
    pg.add_table(
        "orders",
        Schema::new(vec![
            Column::new("order_id", ColumnType::Int64, false),
            Column::new("user_id", ColumnType::Int64, false),
        ]),
        (0..50_000)
            .map(|i| vec![Value::Integer(i), Value::Integer(i % 10_000)])
            .collect(),
    );
    registry.register(Arc::new(pg)).unwrap();
    registry
}

fn bench_parse(c: &mut Criterion) {
    let registry = registry();
    let parser = QueryParser::new(registry);
    c.bench_function("parse_join_query", |b| {
        b.iter(|| {
            parser
                .parse(
                    "SELECT name, COUNT(*) FROM users JOIN orders \
                     ON users.id = orders.user_id WHERE age > 30 GROUP BY name",
                )
                .unwrap()
        })
    });
}

fn bench_optimize(c: &mut Criterion) {
    let registry = registry();
    let parser = QueryParser::new(Arc::clone(&registry));
    let optimizer = Optimizer::new(Arc::clone(&registry), OptimizerConfig::default());
    let plan = parser
        .parse(
            "SELECT name FROM users JOIN orders ON users.id = orders.user_id WHERE age > 30",
        )
        .unwrap();
    c.bench_function("optimize_join_query", |b| {
        b.iter(|| optimizer.optimize(&plan).unwrap())
    });
}

fn bench_fingerprint(c: &mut Criterion) {
    let registry = registry();
    let parser = QueryParser::new(registry);
    let plan = parser
        .parse(
            "SELECT name FROM users JOIN orders ON users.id = orders.user_id \
             WHERE age > 30 AND name = 'x'",
        )
        .unwrap();
    c.bench_function("fingerprint_plan", |b| {
        b.iter(|| fingerprint(&plan).unwrap())
    });
}

criterion_group!(benches, bench_parse, bench_optimize, bench_fingerprint);
criterion_main!(benches);
