#![allow(missing_docs)]

use std::sync::Arc;

use serde_json::{json, Value};
use tessera::query::{LifecyclePhase, Query};
use tessera::{Database, ErrorCode};

fn seeded() -> Arc<Database> {
    let db = Database::new("cursor");
    db.load_json(&json!({
        "items": (1..=5).map(|i| json!({"_key": format!("k{i}"), "n": i})).collect::<Vec<_>>()
    }))
    .expect("seed data");
    db
}

fn cursor(db: &Arc<Database>) -> Query {
    Query::new(
        Arc::clone(db),
        "FOR i IN items SORT i.n RETURN i.n",
        Value::Null,
        json!({"batchSize": 2}),
    )
}

#[test]
fn batches_survive_a_closed_transaction() {
    let db = seeded();
    let mut query = cursor(&db);
    assert!(query.prepare().is_success());

    let first = query.next_batch();
    assert_eq!(first.rows, Some(vec![json!(1), json!(2)]));
    assert!(first.stats.is_none());
    assert!(query.has_more());

    query.close_transaction().expect("close");
    assert!(!query.has_transaction());
    assert!(db.transactions().active().is_empty());

    let writer = Query::new(
        Arc::clone(&db),
        "INSERT { _key: 'late', n: 99 } INTO items",
        Value::Null,
        Value::Null,
    )
    .execute();
    assert!(writer.is_success(), "{}", writer.message);

    query.reopen_transaction().expect("reopen");
    assert_eq!(query.collections().iter().collect::<Vec<_>>(), vec!["items"]);
    let second = query.next_batch();
    assert_eq!(second.rows, Some(vec![json!(3), json!(4)]));

    let last = query.next_batch();
    assert!(last.is_success(), "{}", last.message);
    assert_eq!(last.rows, Some(vec![json!(5)]));
    assert!(last.stats.is_some());
    assert!(!query.has_more());
    assert_eq!(query.phase(), LifecyclePhase::Finalization);
    assert!(query.is_released());
}

#[test]
fn pulling_while_suspended_fails_cleanly() {
    let db = seeded();
    let mut query = cursor(&db);
    assert!(query.next_batch().is_success());
    query.close_transaction().expect("close");

    let result = query.next_batch();
    assert_eq!(result.code, ErrorCode::Internal);
    assert_eq!(result.message, "in state execution: query transaction is closed");
    assert!(query.is_released());
}

#[test]
fn reopen_fails_when_a_collection_disappears() {
    let db = seeded();
    let mut query = cursor(&db);
    assert!(query.prepare().is_success());
    query.close_transaction().expect("close");
    db.drop_collection("items").expect("drop");

    let err = query.reopen_transaction().unwrap_err();
    assert_eq!(err.code(), ErrorCode::CollectionNotFound);
    let message = err.to_string();
    assert!(message.contains("(items)"), "{message}");
    assert!(message.contains("FOR i IN items SORT i.n RETURN i.n"));
    assert!(!query.has_transaction());
    assert!(db.transactions().active().is_empty());

    db.create_collection("items").expect("recreate");
    query.reopen_transaction().expect("retry after the collection is back");
    assert!(query.has_transaction());
    let result = query.next_batch();
    assert!(result.is_success(), "{}", result.message);
    assert!(!query.has_more());
    assert!(db.transactions().active().is_empty());
}

#[test]
fn execute_after_prepare_reuses_the_engine() {
    let db = seeded();
    let mut query = cursor(&db);
    assert!(query.prepare().is_success());
    let plan_nodes = query.plan().map(|plan| plan.nodes().len());
    assert!(plan_nodes.is_some());
    let result = query.execute();
    assert_eq!(
        result.rows,
        Some((1..=5).map(|n| json!(n)).collect::<Vec<_>>())
    );
}
