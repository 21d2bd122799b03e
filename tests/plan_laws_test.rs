// Cross-component plan laws: canonicalization, fingerprint equivalence,
// optimizer schema preservation and fixpoint, AST round-trips.

use lakefed::adapter::{MemoryAdapter, SourceKind, SourceRegistry};
use lakefed::common::{Column, ColumnType, Schema, Value};
use lakefed::optimizer::{Optimizer, OptimizerConfig};
use lakefed::parser::QueryParser;
use lakefed::plan::{canonicalize, fingerprint};
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
        (0..200)
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
        (0..400)
            .map(|i| vec![Value::Integer(i), Value::Integer(i % 200)])
            .collect(),
    );
    registry.register(Arc::new(pg)).unwrap();
    registry
}

#[test]
fn test_fingerprint_invariant_under_and_commutativity() {
    let registry = registry();
    let parser = QueryParser::new(Arc::clone(&registry));
    let p1 = parser
        .parse("SELECT id FROM users WHERE age > 10 AND name = 'x'")
        .unwrap();
    let p2 = parser
        .parse("SELECT id FROM users WHERE name = 'x' AND age > 10")
        .unwrap();
    assert_eq!(fingerprint(&p1).unwrap(), fingerprint(&p2).unwrap());
}

#[test]
fn test_fingerprint_distinguishes_different_predicates() {
    let registry = registry();
    let parser = QueryParser::new(Arc::clone(&registry));
    let p1 = parser.parse("SELECT id FROM users WHERE age > 10").unwrap();
    let p2 = parser.parse("SELECT id FROM users WHERE age > 11").unwrap();
    assert_ne!(fingerprint(&p1).unwrap(), fingerprint(&p2).unwrap());
}

#[test]
fn test_canonicalize_is_idempotent() {
    let registry = registry();
    let parser = QueryParser::new(Arc::clone(&registry));
    let plan = parser
        .parse("SELECT id FROM users WHERE age > 10 AND name = 'x' AND id < 100")
        .unwrap();
    let once = canonicalize(&plan).unwrap();
    let twice = canonicalize(&once).unwrap();
    assert_eq!(once.as_ref(), twice.as_ref());
}

#[test]
fn test_optimizer_preserves_schema_and_reaches_fixpoint() {
    let registry = registry();
    let parser = QueryParser::new(Arc::clone(&registry));
    let optimizer = Optimizer::new(Arc::clone(&registry), OptimizerConfig::default());

    let queries = [
        "SELECT id, name FROM users WHERE age > 30",
        "SELECT name, order_id FROM users JOIN orders ON users.id = orders.user_id WHERE age > 10",
        "SELECT age, COUNT(*) FROM users GROUP BY age",
        "SELECT id FROM users ORDER BY age LIMIT 10",
    ];
    for sql in queries {
        let plan = parser.parse(sql).unwrap();
        let optimized = optimizer.optimize(&plan).unwrap();
        assert_eq!(
            plan.output_schema(registry.as_ref()).unwrap(),
            optimized.output_schema(registry.as_ref()).unwrap(),
            "schema changed for {:?}:\n{}",
            sql,
            optimized.explain()
        );
        let again = optimizer.optimize(&optimized).unwrap();
        assert_eq!(
            optimized.as_ref(),
            again.as_ref(),
            "fixpoint violated for {:?}",
            sql
        );
    }
}

#[test]
fn test_json_ast_round_trip() {
    let registry = registry();
    let parser = QueryParser::new(Arc::clone(&registry));
    let queries = [
        "SELECT id, name FROM users WHERE age > 30",
        "SELECT age, COUNT(*) FROM users GROUP BY age",
        "SELECT id FROM users UNION ALL SELECT order_id FROM orders",
    ];
    for sql in queries {
        let plan = parser.parse(sql).unwrap();
        let printed = parser.print(&plan).unwrap();
        let reparsed = parser.parse_json(&printed).unwrap();
        assert_eq!(plan.as_ref(), reparsed.as_ref(), "round trip for {:?}", sql);
    }
}
