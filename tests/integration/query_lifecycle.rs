#![allow(missing_docs)]

use std::sync::{Arc, Once};
use std::thread;
use std::time::Instant;

use serde_json::{json, Value};
use tessera::config::EngineConfig;
use tessera::mvcc::MarkerKind;
use tessera::query::{LifecyclePhase, Query};
use tessera::{Database, ErrorCode};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("TESSERA_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn seeded() -> Arc<Database> {
    init_tracing();
    let db = Database::new("lifecycle");
    db.load_json(&json!({
        "users": [
            {"_key": "ada", "name": "Ada", "age": 36, "langs": ["en", "fr"]},
            {"_key": "grace", "name": "Grace", "age": 45, "langs": ["en"]},
            {"_key": "alan", "name": "Alan", "age": 41, "langs": []}
        ],
        "audit": []
    }))
    .expect("seed data");
    db
}

fn run(db: &Arc<Database>, text: &str, bind: Value) -> tessera::QueryResult {
    Query::new(Arc::clone(db), text, bind, Value::Null).execute()
}

#[test]
fn return_one_end_to_end() {
    let db = seeded();
    let result = run(&db, "RETURN 1", Value::Null);
    assert!(result.is_success(), "{}", result.message);
    assert_eq!(result.rows, Some(vec![json!(1)]));
    assert!(result.stats.is_some());
    assert!(result.profile.is_none());
}

#[test]
fn undeclared_bind_parameter_fails_in_parsing() {
    let db = seeded();
    let mut query = Query::new(Arc::clone(&db), "FOR u IN users RETURN @x", Value::Null, Value::Null);
    let result = query.prepare();
    assert_eq!(result.code, ErrorCode::BindParameterMissing);
    assert!(result.message.starts_with("in state parsing: "), "{}", result.message);
    assert!(result.message.contains("'x'"));
    assert!(db.transactions().active().is_empty());
}

#[test]
fn unused_bind_parameter_is_rejected() {
    let db = seeded();
    let result = run(&db, "RETURN 1", json!({"extra": 2}));
    assert_eq!(result.code, ErrorCode::BindParameterUndeclared);
    assert!(result.message.starts_with("in state parsing: "));
}

#[test]
fn missing_collection_names_detail_and_query() {
    let db = seeded();
    let text = "FOR d IN missing_things RETURN d";
    let result = run(&db, text, Value::Null);
    assert_eq!(result.code, ErrorCode::CollectionNotFound);
    assert!(result.message.contains("missing_things"));
    assert!(result.message.contains(text));
    assert!(result.rows.is_none());
    assert!(db.transactions().active().is_empty());
}

#[test]
fn filters_sorts_and_binds() {
    let db = seeded();
    let result = run(
        &db,
        "FOR u IN @@coll FILTER u.age >= @min SORT u.age DESC RETURN { name: u.name, langs: LENGTH(u.langs) }",
        json!({"@coll": "users", "min": 40}),
    );
    assert!(result.is_success(), "{}", result.message);
    assert_eq!(
        result.rows,
        Some(vec![json!({"name": "Grace", "langs": 1}), json!({"name": "Alan", "langs": 0})])
    );
    let stats = result.stats.expect("stats");
    assert_eq!(stats.scanned_full, 3);
    assert_eq!(stats.filtered, 1);
}

#[test]
fn inserts_become_visible_after_commit() {
    let db = seeded();
    let result = run(
        &db,
        "FOR u IN users FILTER u.age > 40 INSERT { who: u._key } INTO audit",
        Value::Null,
    );
    assert!(result.is_success(), "{}", result.message);
    assert_eq!(result.rows, Some(vec![]));
    assert_eq!(result.stats.as_ref().map(|s| s.writes_executed), Some(2));

    let result = run(&db, "FOR a IN audit SORT a.who RETURN a.who", Value::Null);
    assert_eq!(result.rows, Some(vec![json!("alan"), json!("grace")]));
}

#[test]
fn failed_query_writes_nothing() {
    let db = seeded();
    let before = db.transactions().log().len();
    let result = run(
        &db,
        "FOR u IN users INSERT { n: 10 / (u.age - 41) } INTO audit",
        Value::Null,
    );
    assert_eq!(result.code, ErrorCode::DivisionByZero);
    assert!(result.message.starts_with("in state execution: "));
    assert!(result.rows.is_none());

    let markers = db.transactions().log().markers().expect("decode markers");
    let ours: Vec<MarkerKind> = markers[before as usize..].iter().map(|m| m.kind).collect();
    assert_eq!(ours.first(), Some(&MarkerKind::Begin));
    assert_eq!(ours.last(), Some(&MarkerKind::Abort));

    let count = run(&db, "FOR a IN audit RETURN 1", Value::Null);
    assert_eq!(count.rows, Some(vec![]));
}

#[test]
fn profile_tracks_phases_in_order() {
    let db = Database::with_config("profiled", EngineConfig::debugging());
    db.load_json(&json!({"users": [{"a": 1}, {"a": 2}]})).expect("seed");
    let started = Instant::now();
    let mut query = Query::new(Arc::clone(&db), "FOR u IN users RETURN u.a", Value::Null, Value::Null);
    let result = query.execute();
    let elapsed = started.elapsed().as_secs_f64();
    assert!(result.is_success(), "{}", result.message);

    let report = result.profile.expect("profile enabled by config");
    let phases: Vec<LifecyclePhase> = report.0.iter().map(|(phase, _)| *phase).collect();
    assert_eq!(
        phases,
        vec![
            LifecyclePhase::Initialization,
            LifecyclePhase::Parsing,
            LifecyclePhase::AstOptimization,
            LifecyclePhase::PlanInstantiation,
            LifecyclePhase::PlanOptimization,
            LifecyclePhase::Execution,
        ]
    );
    let total: f64 = report.0.iter().map(|(_, secs)| secs).sum();
    assert!(total <= elapsed + 1e-6, "{total} > {elapsed}");
    assert!((query.profile().total() - total).abs() < 1e-9);

    let json = serde_json::to_value(&report).expect("serialize profile");
    assert!(json["plan optimization"].is_number());
}

#[test]
fn profile_option_overrides_config() {
    let db = seeded();
    let result = Query::new(Arc::clone(&db), "RETURN 1", Value::Null, json!({"profile": true})).execute();
    assert!(result.profile.is_some());
    let result = Query::new(Arc::clone(&db), "RETURN 1", Value::Null, json!({"profile": "yes"})).execute();
    assert!(result.profile.is_none());
}

#[test]
fn optimizer_rules_do_not_change_results() {
    let db = seeded();
    let queries = [
        "FOR u IN audit FILTER 1 / 0 == 1 RETURN u",
        "FOR u IN users FILTER 1 / 0 == 1 RETURN u",
        "FOR u IN users LET n = u.age / 0 FILTER u.age > 100 RETURN n",
        "FOR u IN users FOR a IN audit FILTER u.name + 1 == 2 RETURN a",
        "FOR u IN users FILTER u.age > 40 SORT u.age RETURN u.name",
    ];
    for text in queries {
        let unoptimized = Query::new(
            Arc::clone(&db),
            text,
            Value::Null,
            json!({"optimizer": {"rules": ["-all"]}}),
        )
        .execute();
        let optimized = run(&db, text, Value::Null);
        assert_eq!(optimized.code, unoptimized.code, "{text}");
        assert_eq!(optimized.message, unoptimized.message, "{text}");
        assert_eq!(optimized.rows, unoptimized.rows, "{text}");
    }
}

#[test]
fn repeated_execution_phase_is_reported_once() {
    let db = Database::with_config("profiled-cursor", EngineConfig::debugging());
    db.load_json(&json!({"users": [{"a": 1}, {"a": 2}]})).expect("seed");
    let mut query = Query::new(Arc::clone(&db), "FOR u IN users RETURN u.a", Value::Null, Value::Null);
    assert!(query.prepare().is_success());
    let result = query.execute();
    assert!(result.is_success(), "{}", result.message);

    let report = result.profile.expect("profile enabled by config");
    let executions = report
        .0
        .iter()
        .filter(|(phase, _)| *phase == LifecyclePhase::Execution)
        .count();
    assert_eq!(executions, 1);

    let json = serde_json::to_value(&report).expect("serialize profile");
    let object = json.as_object().expect("phase map");
    assert_eq!(object.len(), report.0.len());
    let sum: f64 = object.values().filter_map(Value::as_f64).sum();
    assert!((sum - query.profile().total()).abs() < 1e-9, "{sum}");
}

#[test]
fn small_batches_return_every_row() {
    let db = seeded();
    let result = Query::new(
        Arc::clone(&db),
        "FOR i IN RANGE(1, 25) RETURN i",
        Value::Null,
        json!({"batchSize": 4}),
    )
    .execute();
    let rows = result.rows.expect("rows");
    assert_eq!(rows.len(), 25);
    assert_eq!(rows.last(), Some(&json!(25)));
}

#[test]
fn dropping_a_prepared_query_rolls_back() {
    let db = seeded();
    {
        let mut query = Query::new(Arc::clone(&db), "FOR u IN users RETURN u", Value::Null, Value::Null);
        assert!(query.prepare().is_success());
        assert_eq!(db.transactions().active().len(), 1);
    }
    assert!(db.transactions().active().is_empty());
}

#[test]
fn concurrent_queries_see_consistent_snapshots() {
    let db = seeded();
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let insert = run(&db, "INSERT { n: @n } INTO audit", json!({"n": i}));
                assert!(insert.is_success(), "{}", insert.message);
                run(&db, "FOR u IN users RETURN u._key", Value::Null)
            })
        })
        .collect();
    for handle in handles {
        let result = handle.join().expect("query thread");
        assert_eq!(result.rows.map(|rows| rows.len()), Some(3));
    }
    let audit = run(&db, "FOR a IN audit SORT a.n RETURN a.n", Value::Null);
    assert_eq!(audit.rows.map(|rows| rows.len()), Some(8));
}
