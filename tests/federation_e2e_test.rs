// End-to-end federation scenarios driven through the public engine surface.

use lakefed::adapter::{MemoryAdapter, SourceKind};
use lakefed::cache::CachePolicy;
use lakefed::common::{Column, ColumnType, Schema, TableRef, Value};
use lakefed::engine::{QueryContext, QueryInput};
use lakefed::plan::{BinaryOp, Expr, LogicalPlan, SortKey};
use lakefed::security::{AccessLevel, Decision, Identity, SecurityPolicy};
use lakefed::{EngineConfig, EngineError, ExecutionMode, FederatedQueryEngine};
use std::sync::Arc;
use std::time::Duration;

fn users_schema() -> Schema {
    Schema::new(vec![
        Column::new("id", ColumnType::Int64, false),
        Column::new("name", ColumnType::Utf8, true),
        Column::new("age", ColumnType::Int64, true),
    ])
}

fn users_rows(n: i64) -> Vec<Vec<Value>> {
    (0..n)
        .map(|i| {
            vec![
                Value::Integer(i),
                Value::String(format!("user{}", i)),
                // ages 1..=80, cycling
                Value::Integer(1 + (i % 80)),
            ]
        })
        .collect()
}

fn relational_adapter() -> Arc<MemoryAdapter> {
    let pg = MemoryAdapter::new("pg", SourceKind::Relational);
    pg.add_table("users", users_schema(), users_rows(1_000));
    Arc::new(pg)
}

fn vector_adapter(rows: i64) -> Arc<MemoryAdapter> {
    let vectors = MemoryAdapter::new("vec", SourceKind::Vector);
    vectors.add_table(
        "embeddings",
        Schema::new(vec![
            Column::new("user_id", ColumnType::Int64, false),
            Column::new("embedding", ColumnType::Vector { dim: 2 }, false),
        ]),
        (0..rows)
            .map(|i| {
                vec![
                    Value::Integer(i % 100),
                    Value::Vector(vec![(i % 37) as f32, (i % 53) as f32]),
                ]
            })
            .collect(),
    );
    Arc::new(vectors)
}

fn reader() -> Identity {
    init_tracing();
    Identity::new("reader", AccessLevel::Read)
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

#[test]
fn test_single_source_scan_with_predicate_pushdown() {
    let engine = FederatedQueryEngine::new(EngineConfig::default()).unwrap();
    let pg = relational_adapter();
    engine.register_source(pg.clone()).unwrap();

    let output = engine
        .run(
            QueryInput::Sql("SELECT id, name FROM users WHERE age > 30".into()),
            QueryContext::new(reader()),
        )
        .unwrap();

    // ages cycle 1..=80: 50 per full cycle, plus 10 from the partial cycle
    assert_eq!(output.rows.len(), 610);
    assert_eq!(output.schema.names(), vec!["id", "name"]);
    assert_eq!(output.schema.columns[0].data_type, ColumnType::Int64);
    assert_eq!(output.schema.columns[1].data_type, ColumnType::Utf8);
    // the filter was dispatched to the adapter, not evaluated locally:
    // exactly one subplan execution and every returned row matched
    assert_eq!(pg.executed_subplans(), 1);
}

#[test]
fn test_cross_source_hash_join_runs_both_dispatches() {
    let engine = FederatedQueryEngine::new(EngineConfig::default()).unwrap();
    let pg = MemoryAdapter::new("pg", SourceKind::Relational);
    pg.add_table("users", users_schema(), users_rows(100));
    let pg = Arc::new(pg);
    let vectors = vector_adapter(10_000);
    engine.register_source(pg.clone()).unwrap();
    engine.register_source(vectors.clone()).unwrap();

    let output = engine
        .run(
            QueryInput::Sql(
                "SELECT name FROM pg.users JOIN vec.embeddings ON users.id = embeddings.user_id"
                    .into(),
            ),
            QueryContext::new(reader()),
        )
        .unwrap();

    // every embedding row has user_id in 0..100, all of which exist
    assert_eq!(output.rows.len(), 10_000);
    assert_eq!(pg.executed_subplans(), 1);
    assert_eq!(vectors.executed_subplans(), 1);
}

#[test]
fn test_vector_knn_capability_pushdown() {
    let engine = FederatedQueryEngine::new(EngineConfig::default()).unwrap();
    let vectors = vector_adapter(10_000);
    engine.register_source(vectors.clone()).unwrap();

    // nearest 5 embeddings to the origin, expressed as the logical plan's
    // JSON AST form
    let scan = Arc::new(LogicalPlan::Scan {
        source: "vec".into(),
        table: "embeddings".into(),
        projection: None,
        predicate: None,
    });
    let knn = Arc::new(LogicalPlan::Limit {
        input: Arc::new(LogicalPlan::Sort {
            input: scan,
            keys: vec![SortKey::asc(Expr::Call {
                func: "vector_distance".into(),
                args: vec![
                    Expr::qualified_column("embeddings", "embedding"),
                    Expr::Literal(Value::Vector(vec![0.0, 0.0])),
                ],
            })],
        }),
        limit: Some(5),
        offset: 0,
    });
    let ast = serde_json::to_value(knn.as_ref()).unwrap();

    let output = engine
        .run(QueryInput::Ast(ast), QueryContext::new(reader()))
        .unwrap();

    assert_eq!(output.rows.len(), 5);
    // the whole subtree went to the source: one dispatch, and the top row
    // is the origin vector itself
    assert_eq!(vectors.executed_subplans(), 1);
    match &output.rows[0][1] {
        Value::Vector(v) => assert_eq!(v, &vec![0.0, 0.0]),
        other => panic!("expected vector column, got {:?}", other),
    }
}

#[test]
fn test_adaptive_switch_on_misestimated_build_side() {
    let engine = FederatedQueryEngine::new(EngineConfig::default()).unwrap();
    let pg = MemoryAdapter::new("pg", SourceKind::Relational);
    pg.add_table("users", users_schema(), users_rows(5_000));
    // source statistics claim the table is tiny
    pg.override_row_estimate(50);
    let pg = Arc::new(pg);
    let other = MemoryAdapter::new("doc", SourceKind::Document);
    other.add_table(
        "events",
        Schema::new(vec![
            Column::new("user_id", ColumnType::Int64, false),
            Column::new("kind", ColumnType::Utf8, true),
        ]),
        (0..200)
            .map(|i| vec![Value::Integer(i), Value::String("login".into())])
            .collect(),
    );
    engine.register_source(pg).unwrap();
    engine.register_source(Arc::new(other)).unwrap();

    let handle = engine
        .submit(
            QueryInput::Sql(
                "SELECT kind FROM pg.users JOIN doc.events ON users.id = events.user_id".into(),
            ),
            QueryContext::new(reader()).with_mode(ExecutionMode::Adaptive),
        )
        .unwrap();

    let mut rows = 0;
    loop {
        let response = engine.poll(&handle);
        if let Some(batch) = response.batch {
            rows += batch.num_rows();
            continue;
        }
        assert!(response.error.is_none(), "query failed: {:?}", response.error);
        if response.status.is_terminal() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(rows, 200);
    // the monitor recorded the operator swap
    let snapshot = handle.monitor_snapshot();
    assert!(snapshot
        .adaptations
        .iter()
        .any(|a| a.to_strategy == "partitioned_hash_join"));
}

#[test]
fn test_cache_hit_then_dependency_invalidation() {
    let engine = FederatedQueryEngine::new(EngineConfig::default()).unwrap();
    engine.register_source(relational_adapter()).unwrap();
    let sql = "SELECT id FROM users WHERE age > 70";
    let qctx = || QueryContext::new(reader());

    let first = engine.run(QueryInput::Sql(sql.into()), qctx()).unwrap();
    let after_first = engine.cache_stats();

    let second = engine.run(QueryInput::Sql(sql.into()), qctx()).unwrap();
    let after_second = engine.cache_stats();
    assert_eq!(first.rows, second.rows);
    assert!(after_second.hits > after_first.hits, "second run must hit");

    let removed = engine.invalidate(&TableRef::new("pg", "users"));
    assert!(removed >= 1);

    let third = engine.run(QueryInput::Sql(sql.into()), qctx()).unwrap();
    let after_third = engine.cache_stats();
    assert_eq!(first.rows, third.rows);
    assert!(after_third.misses > after_second.misses, "third run must miss");
}

#[test]
fn test_security_row_predicate_and_audit() {
    let engine = FederatedQueryEngine::new(EngineConfig::default()).unwrap();
    engine.register_source(relational_adapter()).unwrap();

    engine.install_policy(
        SecurityPolicy::new(TableRef::new("pg", "users"), AccessLevel::Read).with_row_predicate(
            Expr::binary(
                Expr::column("id"),
                BinaryOp::Eq,
                Expr::Call {
                    func: "caller_attribute".into(),
                    args: vec![Expr::Literal(Value::String("caller_id".into()))],
                },
            ),
        ),
    );

    let caller = Identity::new("alice", AccessLevel::Read)
        .with_attribute("caller_id", Value::Integer(7));
    let output = engine
        .run(
            QueryInput::Sql("SELECT id, name FROM users".into()),
            QueryContext::new(caller),
        )
        .unwrap();

    // the predicate was injected: only the caller's row comes back
    assert_eq!(output.rows.len(), 1);
    assert_eq!(output.rows[0][0], Value::Integer(7));

    let audit = engine.audit_log().recent(16);
    assert!(audit
        .iter()
        .any(|e| e.subject == "alice" && e.decision == Decision::Allow));

    // admins bypass the row predicate
    let admin_output = engine
        .run(
            QueryInput::Sql("SELECT id FROM users".into()),
            QueryContext::new(Identity::new("root", AccessLevel::Admin))
                .with_cache_policy(CachePolicy::Bypass),
        )
        .unwrap();
    assert_eq!(admin_output.rows.len(), 1_000);
}

#[test]
fn test_transient_adapter_errors_retry_within_deadline() {
    let engine = FederatedQueryEngine::new(EngineConfig::default()).unwrap();
    let pg = relational_adapter();
    engine.register_source(pg.clone()).unwrap();

    // warm the schema snapshot so the injected failures land on execution
    engine
        .run(
            QueryInput::Sql("SELECT id FROM users WHERE age > 70".into()),
            QueryContext::new(reader()).with_cache_policy(CachePolicy::Bypass),
        )
        .unwrap();

    pg.inject_failures(2);
    let output = engine
        .run(
            QueryInput::Sql("SELECT id FROM users WHERE age > 70".into()),
            QueryContext::new(reader()).with_cache_policy(CachePolicy::Bypass),
        )
        .unwrap();
    assert!(!output.rows.is_empty());
}

#[test]
fn test_permanent_adapter_errors_surface() {
    let engine = FederatedQueryEngine::new(EngineConfig::default()).unwrap();
    engine.register_source(relational_adapter()).unwrap();

    let failure = engine
        .run(
            QueryInput::Sql("SELECT missing_column FROM users".into()),
            QueryContext::new(reader()),
        )
        .unwrap_err();
    assert!(!failure.retriable);
}

#[test]
fn test_unauthorized_caller_rejected_synchronously() {
    let engine = FederatedQueryEngine::new(EngineConfig::default()).unwrap();
    engine.register_source(relational_adapter()).unwrap();

    let err = engine
        .submit(
            QueryInput::Sql("SELECT id FROM users".into()),
            QueryContext::new(Identity::new("nobody", AccessLevel::None)),
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));
}

#[test]
fn test_optimization_preserves_row_multiset() {
    // the same query through a fully-armed optimizer and a minimal one must
    // return the same rows
    let run_with = |rule_set: Vec<String>| {
        let mut config = EngineConfig::default();
        config.optimizer.rule_set = rule_set;
        let engine = FederatedQueryEngine::new(config).unwrap();
        engine.register_source(relational_adapter()).unwrap();
        let vectors = vector_adapter(500);
        engine.register_source(vectors).unwrap();
        let mut output = engine
            .run(
                QueryInput::Sql(
                    "SELECT name FROM pg.users JOIN vec.embeddings \
                     ON users.id = embeddings.user_id WHERE age > 40"
                        .into(),
                ),
                QueryContext::new(reader()).with_cache_policy(CachePolicy::Bypass),
            )
            .unwrap();
        output
            .rows
            .sort_by(|a, b| a[0].partial_cmp(&b[0]).unwrap());
        output.rows
    };

    let full = run_with(Vec::new());
    let minimal = run_with(vec!["constant_folding".to_string()]);
    assert_eq!(full, minimal);
    assert!(!full.is_empty());
}

#[test]
fn test_timeout_is_scheduled_cancellation() {
    let engine = FederatedQueryEngine::new(EngineConfig::default()).unwrap();
    engine.register_source(relational_adapter()).unwrap();

    let failure = engine
        .run(
            QueryInput::Sql("SELECT id FROM users".into()),
            QueryContext::new(reader())
                .with_timeout(Duration::from_nanos(1))
                .with_cache_policy(CachePolicy::Bypass),
        )
        .unwrap_err();
    assert!(failure.code == "LF-CANCEL-002" || failure.code == "LF-RSRC-003");
}
