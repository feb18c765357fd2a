#![allow(missing_docs)]

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::json;
use tessera::mvcc::{MarkerKind, TransactionFlags, TransactionKind, TransactionStatus};
use tessera::{Database, Result, TesseraError};

fn db() -> Arc<Database> {
    let db = Database::new("markers");
    db.create_collection("docs").expect("create collection");
    db
}

fn kinds(db: &Database, tx: tessera::types::TransactionId) -> Vec<MarkerKind> {
    db.transactions()
        .log()
        .markers_for(tx)
        .expect("decode")
        .into_iter()
        .map(|marker| marker.kind)
        .collect()
}

#[test]
fn commit_writes_begin_data_and_commit() -> Result<()> {
    let db = db();
    let mut trx = db.transactions().new_transaction(&db, ["docs"]);
    trx.begin()?;
    assert_eq!(db.transactions().status_of(trx.id()), Some(TransactionStatus::Ongoing));
    assert!(trx.flags().initialized());
    assert!(!trx.flags().begin_marker_written());
    trx.insert("docs", json!({"n": 1}))?;
    trx.insert("docs", json!({"n": 2}))?;
    assert!(trx.flags().begin_marker_written());
    assert!(trx.flags().data_marker_written());
    trx.commit()?;
    assert!(trx.flags().end_marker_written());
    assert_eq!(
        kinds(&db, trx.id()),
        vec![MarkerKind::Begin, MarkerKind::Data, MarkerKind::Data, MarkerKind::Commit]
    );
    assert!(trx.is_committed());
    assert_eq!(db.transactions().status_of(trx.id()), None);
    Ok(())
}

#[test]
fn read_only_transactions_write_no_markers() -> Result<()> {
    let db = db();
    let before = db.transactions().log().len();
    let mut trx = db.transactions().new_transaction(&db, ["docs"]);
    trx.begin()?;
    assert!(trx.read_collection("docs")?.is_empty());
    trx.commit()?;
    assert_eq!(db.transactions().log().len(), before);
    assert!(!trx.flags().end_marker_written());
    Ok(())
}

#[test]
fn rollback_after_writes_logs_abort() -> Result<()> {
    let db = db();
    let mut trx = db.transactions().new_transaction(&db, ["docs"]);
    trx.begin()?;
    trx.insert("docs", json!({"_key": "x"}))?;
    trx.rollback();
    assert!(trx.is_rolled_back());
    assert_eq!(kinds(&db, trx.id()), vec![MarkerKind::Begin, MarkerKind::Data, MarkerKind::Abort]);
    assert_eq!(db.collection("docs").map(|c| c.count(db.transactions().last_committed())), Some(0));
    Ok(())
}

#[test]
fn conflicting_commit_rolls_back() -> Result<()> {
    let db = db();
    let mut first = db.transactions().new_transaction(&db, ["docs"]);
    let mut second = db.transactions().new_transaction(&db, ["docs"]);
    first.begin()?;
    second.begin()?;
    first.insert("docs", json!({"_key": "same"}))?;
    second.insert("docs", json!({"_key": "same"}))?;
    first.commit()?;
    let err = second.commit().unwrap_err();
    assert!(matches!(err, TesseraError::UniqueConstraint { .. }));
    assert!(second.is_rolled_back());
    assert_eq!(kinds(&db, second.id()).last(), Some(&MarkerKind::Abort));
    Ok(())
}

#[test]
fn nested_writes_merge_into_the_parent() -> Result<()> {
    let db = db();
    let mut parent = db.transactions().new_transaction(&db, ["docs"]);
    parent.begin()?;
    parent.insert("docs", json!({"_key": "outer"}))?;
    let child_id = parent.run_nested(|child| {
        assert!(matches!(child.kind(), TransactionKind::Nested { .. }));
        assert_eq!(child.read_collection("docs")?.len(), 1);
        child.insert("docs", json!({"_key": "inner"}))?;
        Ok(child.id())
    })?;
    assert_eq!(db.transactions().parent_of(child_id), Some(parent.id()));
    assert_eq!(db.transactions().top_level_of(child_id), Some(parent.id()));
    assert!(kinds(&db, child_id).is_empty());

    let failed: Result<()> = parent.run_nested(|child| {
        child.insert("docs", json!({"_key": "discarded"}))?;
        Err(TesseraError::BadParameter("abandon".into()))
    });
    assert!(failed.is_err());

    parent.commit()?;
    let committed = db.transactions().last_committed();
    assert_eq!(db.collection("docs").map(|c| c.count(committed)), Some(2));
    assert_eq!(
        kinds(&db, parent.id()),
        vec![MarkerKind::Begin, MarkerKind::Data, MarkerKind::Data, MarkerKind::Commit]
    );
    Ok(())
}

#[test]
fn data_markers_are_repeatable() {
    for repeats in [0usize, 1, 5] {
        let mut flags = TransactionFlags::new();
        flags.set_begin_marker_written();
        for _ in 0..repeats {
            flags.set_data_marker_written();
        }
        flags.set_end_marker_written();
        assert!(flags.end_marker_written());
        assert_eq!(flags.data_marker_written(), repeats > 0);
    }
}

#[test]
fn marker_order_violations_fail_fast() {
    let end_without_begin = catch_unwind(|| {
        let mut flags = TransactionFlags::new();
        flags.set_end_marker_written();
    });
    assert!(end_without_begin.is_err());

    let begin_twice = catch_unwind(|| {
        let mut flags = TransactionFlags::new();
        flags.set_begin_marker_written();
        flags.set_begin_marker_written();
    });
    assert!(begin_twice.is_err());

    let begin_after_data = catch_unwind(|| {
        let mut flags = TransactionFlags::new();
        flags.set_data_marker_written();
        flags.set_begin_marker_written();
    });
    assert!(begin_after_data.is_err());

    let initialized_twice = catch_unwind(|| {
        let mut flags = TransactionFlags::new();
        flags.set_initialized();
        flags.set_initialized();
    });
    assert!(initialized_twice.is_err());
}

#[test]
fn finished_transactions_reject_commit_and_rollback() -> Result<()> {
    let db = db();
    let mut trx = db.transactions().new_transaction(&db, ["docs"]);
    trx.begin()?;
    trx.commit()?;
    let again = catch_unwind(AssertUnwindSafe(|| trx.commit()));
    assert!(again.is_err());
    let rollback = catch_unwind(AssertUnwindSafe(|| trx.rollback()));
    assert!(rollback.is_err());
    Ok(())
}

#[test]
fn corrupted_log_bytes_are_detected() -> Result<()> {
    let db = db();
    db.import("docs", [json!({"n": 1})])?;
    let mut bytes = db.transactions().log().to_bytes();
    assert!(tessera::mvcc::markers::decode_markers(&bytes).is_ok());
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    assert!(tessera::mvcc::markers::decode_markers(&bytes).is_err());
    Ok(())
}
