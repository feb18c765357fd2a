#![allow(missing_docs)]

use std::sync::Arc;

use serde_json::{json, Value};
use tessera::query::Query;
use tessera::{Database, ErrorCode};

fn seeded() -> Arc<Database> {
    let db = Database::new("explain");
    db.load_json(&json!({
        "small": [{"v": 1}, {"v": 2}],
        "large": (0..20).map(|i| json!({"v": i})).collect::<Vec<_>>()
    }))
    .expect("seed data");
    db
}

fn explain(db: &Arc<Database>, text: &str, options: Value) -> Vec<Value> {
    let result = Query::new(Arc::clone(db), text, Value::Null, options).explain();
    assert!(result.is_success(), "{}", result.message);
    result.rows.expect("plans")
}

#[test]
fn serialized_plan_keeps_its_estimated_cost() {
    let db = seeded();
    let plans = explain(
        &db,
        "FOR s IN small FOR l IN large FILTER l.v > s.v LET unused = s.v * 2 SORT l.v RETURN [s.v, l.v]",
        Value::Null,
    );
    assert_eq!(plans.len(), 1);
    let best = &plans[0];
    assert!(best["rules"].as_array().is_some_and(|rules| !rules.is_empty()));

    let result = Query::from_serialized(
        Arc::clone(&db),
        best.clone(),
        json!({"optimizer": {"rules": ["-all"]}}),
    )
    .explain();
    assert!(result.is_success(), "{}", result.message);
    let again = &result.rows.expect("plans")[0];
    assert_eq!(again["estimatedCost"], best["estimatedCost"]);
    assert_eq!(again["nodes"], best["nodes"]);
    assert_eq!(again["collections"], json!(["large", "small"]));
}

#[test]
fn serialized_plan_executes_like_the_text() {
    let db = seeded();
    let text = "FOR s IN small FOR l IN large FILTER l.v == s.v SORT l.v DESC RETURN l.v";
    let plan = explain(&db, text, Value::Null).remove(0);

    let from_text = Query::new(Arc::clone(&db), text, Value::Null, Value::Null).execute();
    let from_plan = Query::from_serialized(Arc::clone(&db), plan, Value::Null).execute();
    assert!(from_plan.is_success(), "{}", from_plan.message);
    assert_eq!(from_text.rows, Some(vec![json!(2), json!(1)]));
    assert_eq!(from_plan.rows, from_text.rows);
}

#[test]
fn all_plans_lists_ranked_candidates() {
    let db = seeded();
    let plans = explain(
        &db,
        "FOR l IN large FOR s IN small RETURN 1",
        json!({"allPlans": true}),
    );
    assert_eq!(plans.len(), 2);
    let costs: Vec<f64> = plans
        .iter()
        .map(|plan| plan["estimatedCost"].as_f64().expect("cost"))
        .collect();
    assert!(costs[0] <= costs[1]);
    assert_eq!(plans[0]["nodes"][1]["collection"], json!("small"));

    let capped = explain(
        &db,
        "FOR l IN large FOR s IN small RETURN 1",
        json!({"allPlans": true, "maxNumberOfPlans": 1}),
    );
    assert_eq!(capped.len(), 1);
}

#[test]
fn verbose_plans_carry_node_estimates() {
    let db = seeded();
    let plans = explain(&db, "FOR l IN large RETURN l", json!({"verbosePlans": true}));
    let plan = &plans[0];
    assert_eq!(plan["planHash"].as_str().map(str::len), Some(16));
    assert_eq!(plan["nodes"][1]["estimatedNrItems"], json!(20.0));
    assert_eq!(plan["estimatedNrItems"], json!(20.0));

    let terse = explain(&db, "FOR l IN large RETURN l", Value::Null);
    assert!(terse[0].get("planHash").is_none());
}

#[test]
fn disabled_rules_are_not_applied() {
    let db = seeded();
    let text = "FOR l IN large FILTER true LET x = 1 RETURN l";
    let plans = explain(&db, text, json!({"optimizer": {"rules": ["-all", "+remove-unnecessary-filters"]}}));
    assert_eq!(plans[0]["rules"], json!(["remove-unnecessary-filters"]));
    let kinds: Vec<&str> = plans[0]["nodes"]
        .as_array()
        .expect("nodes")
        .iter()
        .filter_map(|node| node["type"].as_str())
        .collect();
    assert!(kinds.contains(&"calculation"));
    assert!(!kinds.contains(&"filter"));
}

#[test]
fn explain_commits_its_transaction() {
    let db = seeded();
    let before = db.transactions().last_committed();
    explain(&db, "FOR l IN large RETURN l", Value::Null);
    assert!(db.transactions().active().is_empty());
    assert_eq!(db.transactions().last_committed(), before);
}

#[test]
fn broken_serialized_plans_fail_in_plan_instantiation() {
    let db = seeded();
    let result = Query::from_serialized(Arc::clone(&db), json!({"nodes": []}), Value::Null).execute();
    assert_eq!(result.code, ErrorCode::Internal);
    assert_eq!(
        result.message,
        "in state plan instantiation: failed to create query execution plan"
    );

    let result =
        Query::from_serialized(Arc::clone(&db), json!({"nodes": [{"type": "bogus"}]}), Value::Null)
            .execute();
    assert_eq!(result.code, ErrorCode::BadParameter);
    assert!(result.message.starts_with("in state plan instantiation: bad parameter: invalid serialized plan"));

    let plan = json!({"nodes": [
        {"type": "singleton"},
        {"type": "enumerateCollection", "collection": "gone", "out": "g"},
        {"type": "return", "expr": {"type": "reference", "name": "g"}, "distinct": false}
    ]});
    let result = Query::from_serialized(Arc::clone(&db), plan, Value::Null).execute();
    assert_eq!(result.code, ErrorCode::CollectionNotFound);
    assert!(result.message.contains("(gone)"), "{}", result.message);
}
