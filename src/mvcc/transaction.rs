#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::catalog::{Database, KEY_ATTRIBUTE};
use crate::types::{CommitId, Result, TesseraError, TransactionId};

use super::flags::{invariant_violation, TransactionFlags};
use super::markers::MarkerKind;
use super::stack;

/// Lifecycle status of a transaction. Only `Ongoing` has outgoing transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Running; may still read, write, commit or roll back.
    Ongoing,
    /// Committed; terminal.
    Committed,
    /// Rolled back; terminal.
    RolledBack,
}

impl TransactionStatus {
    /// Lower-case status name.
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Ongoing => "ongoing",
            TransactionStatus::Committed => "committed",
            TransactionStatus::RolledBack => "rolled back",
        }
    }
}

/// Position of a transaction in its tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionKind {
    /// Root of a transaction tree; writes markers and applies commits.
    TopLevel,
    /// Child whose writes merge into `parent` when it commits.
    Nested {
        /// Direct parent transaction.
        parent: TransactionId,
    },
}

/// A document write buffered until commit.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingWrite {
    /// Target collection.
    pub collection: String,
    /// Document key.
    pub key: String,
    /// Document body including `_key`.
    pub document: Arc<JsonValue>,
}

/// An MVCC transaction over a fixed set of collections.
///
/// Reads observe the snapshot taken at [`Transaction::begin`] plus the
/// transaction's own buffered writes. Top-level transactions log a begin
/// marker with their first write, one data marker per write, and a commit or
/// abort marker when they finish.
pub struct Transaction {
    id: TransactionId,
    kind: TransactionKind,
    db: Arc<Database>,
    collections: BTreeSet<String>,
    status: TransactionStatus,
    flags: TransactionFlags,
    snapshot: Option<CommitId>,
    inherited: Vec<PendingWrite>,
    writes: Vec<PendingWrite>,
    detail: Option<String>,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        kind: TransactionKind,
        db: Arc<Database>,
        collections: BTreeSet<String>,
    ) -> Self {
        Self {
            id,
            kind,
            db,
            collections,
            status: TransactionStatus::Ongoing,
            flags: TransactionFlags::new(),
            snapshot: None,
            inherited: Vec::new(),
            writes: Vec::new(),
            detail: None,
        }
    }

    /// Manager-assigned id.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Top-level or nested.
    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Whether this is the root of its transaction tree.
    pub fn is_top_level(&self) -> bool {
        self.kind == TransactionKind::TopLevel
    }

    /// Current status.
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Whether the transaction may still do work.
    pub fn is_ongoing(&self) -> bool {
        self.status == TransactionStatus::Ongoing
    }

    /// Whether the transaction committed.
    pub fn is_committed(&self) -> bool {
        self.status == TransactionStatus::Committed
    }

    /// Whether the transaction rolled back.
    pub fn is_rolled_back(&self) -> bool {
        self.status == TransactionStatus::RolledBack
    }

    /// Marker bookkeeping.
    pub fn flags(&self) -> TransactionFlags {
        self.flags
    }

    /// Database the transaction runs against.
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Collections registered with the transaction.
    pub fn collections(&self) -> &BTreeSet<String> {
        &self.collections
    }

    /// Snapshot commit id, once begun.
    pub fn snapshot(&self) -> Option<CommitId> {
        self.snapshot
    }

    /// Extra text describing the last failure, e.g. a missing collection name.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Writes buffered by this transaction.
    pub fn pending_writes(&self) -> &[PendingWrite] {
        &self.writes
    }

    /// Registers more collections. Only allowed before [`Self::begin`].
    pub fn add_collections<I, S>(&mut self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.flags.initialized() {
            return Err(TesseraError::Transaction(
                "cannot add collections to a running transaction".into(),
            ));
        }
        self.collections.extend(names.into_iter().map(Into::into));
        Ok(())
    }

    /// Validates the registered collections and takes the read snapshot.
    ///
    /// On a missing collection the transaction stays un-begun and its
    /// [`detail`](Self::detail) names the collection.
    pub fn begin(&mut self) -> Result<()> {
        if !self.is_ongoing() {
            return Err(TesseraError::Transaction(format!(
                "cannot begin a transaction that is {}",
                self.status.as_str()
            )));
        }
        if let Some(missing) = self
            .collections
            .iter()
            .find(|name| self.db.collection(name).is_none())
        {
            self.detail = Some(missing.clone());
            return Err(TesseraError::CollectionNotFound(missing.clone()));
        }
        let snapshot = self.db.transactions().register_begin(self.id);
        self.flags.set_initialized();
        self.snapshot = Some(snapshot);
        stack::push(self.id);
        self.flags.set_pushed_on_thread_stack(true);
        debug!(
            tx_id = self.id.0,
            snapshot = snapshot.0,
            top_level = self.is_top_level(),
            "transaction began"
        );
        Ok(())
    }

    fn read_snapshot(&self) -> Result<CommitId> {
        if !self.is_ongoing() {
            return Err(TesseraError::Transaction(format!(
                "transaction {} is {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.snapshot.ok_or_else(|| {
            TesseraError::Transaction(format!("transaction {} has not begun", self.id))
        })
    }

    fn registered(&self, name: &str) -> Result<Arc<crate::catalog::Collection>> {
        if !self.collections.contains(name) {
            return Err(TesseraError::Transaction(format!(
                "collection '{name}' is not registered with transaction {}",
                self.id
            )));
        }
        self.db
            .collection(name)
            .ok_or_else(|| TesseraError::CollectionNotFound(name.to_owned()))
    }

    fn buffered(&self) -> impl Iterator<Item = &PendingWrite> {
        self.inherited.iter().chain(self.writes.iter())
    }

    /// Documents of `name` visible to this transaction, in insertion order.
    pub fn read_collection(&self, name: &str) -> Result<Vec<Arc<JsonValue>>> {
        let snapshot = self.read_snapshot()?;
        let collection = self.registered(name)?;
        let mut documents = collection.snapshot(snapshot);
        documents.extend(
            self.buffered()
                .filter(|write| write.collection == name)
                .map(|write| Arc::clone(&write.document)),
        );
        Ok(documents)
    }

    /// Visible document count, used for cost estimation. Falls back to the
    /// latest commit when the transaction has not begun.
    pub fn collection_count(&self, name: &str) -> Option<u64> {
        let collection = self.db.collection(name)?;
        let snapshot = self
            .snapshot
            .unwrap_or_else(|| self.db.transactions().last_committed());
        let own = self.buffered().filter(|write| write.collection == name).count() as u64;
        Some(collection.count(snapshot) + own)
    }

    /// Buffers an insert and returns the stored document (with `_key`).
    pub fn insert(&mut self, name: &str, document: JsonValue) -> Result<Arc<JsonValue>> {
        let snapshot = self.read_snapshot()?;
        let collection = self.registered(name)?;
        let JsonValue::Object(mut body) = document else {
            return Err(TesseraError::DocumentType("document must be an object"));
        };
        let key = match body.get(KEY_ATTRIBUTE) {
            Some(JsonValue::String(key)) if !key.is_empty() => key.clone(),
            Some(_) => return Err(TesseraError::DocumentType("_key must be a non-empty string")),
            None => {
                let key = self.db.generate_key();
                body.insert(KEY_ATTRIBUTE.to_owned(), JsonValue::String(key.clone()));
                key
            }
        };
        let taken = collection.contains_key_at(&key, snapshot)
            || self
                .buffered()
                .any(|write| write.collection == name && write.key == key);
        if taken {
            return Err(TesseraError::UniqueConstraint {
                collection: name.to_owned(),
                key,
            });
        }
        let document = Arc::new(JsonValue::Object(body));
        self.stage(PendingWrite {
            collection: name.to_owned(),
            key,
            document: Arc::clone(&document),
        })?;
        Ok(document)
    }

    fn stage(&mut self, write: PendingWrite) -> Result<()> {
        if self.is_top_level() {
            let log = self.db.transactions().log();
            if !self.flags.begin_marker_written() {
                log.append(self.id, MarkerKind::Begin, &[]);
                self.flags.set_begin_marker_written();
            }
            let payload = serde_json::to_vec(&json!({
                "collection": write.collection,
                "key": write.key,
                "document": *write.document,
            }))
            .map_err(|err| TesseraError::Transaction(err.to_string()))?;
            log.append(self.id, MarkerKind::Data, &payload);
            self.flags.set_data_marker_written();
        }
        self.writes.push(write);
        Ok(())
    }

    /// Runs `body` inside a nested transaction.
    ///
    /// The child sees this transaction's buffered writes. If `body` succeeds
    /// the child commits (unless it already finished) and its writes move
    /// into this transaction; on error the child rolls back and this
    /// transaction is left untouched.
    pub fn run_nested<R, F>(&mut self, body: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction) -> Result<R>,
    {
        self.read_snapshot()?;
        let manager = self.db.transactions();
        let kind = TransactionKind::Nested { parent: self.id };
        let child_id = manager.register(kind);
        let mut child = Transaction::new(child_id, kind, Arc::clone(&self.db), self.collections.clone());
        child.inherited = self.buffered().cloned().collect();
        child.begin()?;
        match body(&mut child) {
            Ok(value) => {
                if child.is_ongoing() {
                    child.commit()?;
                }
                if child.is_committed() {
                    for write in std::mem::take(&mut child.writes) {
                        self.stage(write)?;
                    }
                }
                Ok(value)
            }
            Err(err) => {
                if child.is_ongoing() {
                    child.rollback();
                }
                Err(err)
            }
        }
    }

    /// Commits the transaction.
    ///
    /// Nested transactions only change status; their writes are picked up by
    /// the parent. Top-level commits apply buffered writes under the
    /// manager's commit lock and log the commit marker. A conflicting write
    /// rolls the transaction back and returns the conflict.
    ///
    /// # Panics
    ///
    /// Panics if the transaction is not ongoing.
    #[track_caller]
    pub fn commit(&mut self) -> Result<()> {
        if !self.is_ongoing() {
            invariant_violation("commit of a transaction that is not ongoing");
        }
        if self.is_top_level() && !self.writes.is_empty() {
            if let Err(err) = self.apply_writes() {
                warn!(tx_id = self.id.0, error = %err, "commit failed, rolling back");
                self.detail = Some(err.to_string());
                self.rollback();
                return Err(err);
            }
        }
        self.finish(TransactionStatus::Committed);
        info!(tx_id = self.id.0, writes = self.writes.len(), "transaction committed");
        Ok(())
    }

    fn apply_writes(&mut self) -> Result<()> {
        let manager = self.db.transactions();
        let _commits = manager.lock_commits();
        let mut targets = Vec::with_capacity(self.writes.len());
        for write in &self.writes {
            let collection = self
                .db
                .collection(&write.collection)
                .ok_or_else(|| TesseraError::CollectionNotFound(write.collection.clone()))?;
            if collection.contains_live_key(&write.key) {
                return Err(TesseraError::UniqueConstraint {
                    collection: write.collection.clone(),
                    key: write.key.clone(),
                });
            }
            targets.push(collection);
        }
        let commit = manager.next_commit_id();
        for (write, collection) in self.writes.iter().zip(targets) {
            collection.apply_insert(&write.key, Arc::clone(&write.document), commit)?;
        }
        manager.log().append(self.id, MarkerKind::Commit, &[]);
        self.flags.set_end_marker_written();
        manager.publish_commit(commit);
        debug!(tx_id = self.id.0, commit = commit.0, "writes applied");
        Ok(())
    }

    /// Rolls the transaction back, discarding buffered writes.
    ///
    /// # Panics
    ///
    /// Panics if the transaction is not ongoing.
    #[track_caller]
    pub fn rollback(&mut self) {
        if !self.is_ongoing() {
            invariant_violation("rollback of a transaction that is not ongoing");
        }
        if self.is_top_level() && self.flags.begin_marker_written() {
            self.db
                .transactions()
                .log()
                .append(self.id, MarkerKind::Abort, &[]);
            self.flags.set_end_marker_written();
        }
        let discarded = self.writes.len();
        self.writes.clear();
        self.finish(TransactionStatus::RolledBack);
        info!(tx_id = self.id.0, discarded, "transaction rolled back");
    }

    fn finish(&mut self, status: TransactionStatus) {
        self.status = status;
        if self.flags.pushed_on_thread_stack() {
            stack::remove(self.id);
            self.flags.set_pushed_on_thread_stack(false);
        }
        self.db.transactions().finish(self.id, status);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_ongoing() {
            warn!(tx_id = self.id.0, "dropping ongoing transaction, rolling back");
            self.rollback();
        }
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransactionKind::TopLevel => {
                write!(f, "TopLevelTransaction {} ({})", self.id, self.status.as_str())
            }
            TransactionKind::Nested { parent } => write!(
                f,
                "NestedTransaction {} (parent {}, {})",
                self.id,
                parent,
                self.status.as_str()
            ),
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("flags", &self.flags)
            .field("collections", &self.collections)
            .field("writes", &self.writes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::stack;

    fn db_with(collection: &str) -> Arc<Database> {
        let db = Database::new("test");
        db.create_collection(collection).unwrap();
        db
    }

    #[test]
    fn begin_fails_on_missing_collection_with_detail() {
        let db = db_with("a");
        let mut trx = db.transactions().new_transaction(&db, ["a", "ghost"]);
        let err = trx.begin().unwrap_err();
        assert_eq!(err, TesseraError::CollectionNotFound("ghost".into()));
        assert_eq!(trx.detail(), Some("ghost"));
        assert!(!trx.flags().initialized());
        trx.rollback();
        assert!(trx.is_rolled_back());
    }

    #[test]
    fn insert_commit_writes_markers_in_order() -> Result<()> {
        let db = db_with("docs");
        let mut trx = db.transactions().new_transaction(&db, ["docs"]);
        trx.begin()?;
        assert_eq!(stack::current(), Some(trx.id()));
        assert!(!trx.flags().begin_marker_written());
        trx.insert("docs", json!({"n": 1}))?;
        trx.insert("docs", json!({"n": 2}))?;
        assert_eq!(trx.read_collection("docs")?.len(), 2);
        trx.commit()?;
        assert!(trx.is_committed());
        assert!(trx.flags().end_marker_written());
        assert!(!trx.flags().pushed_on_thread_stack());

        let kinds: Vec<_> = db
            .transactions()
            .log()
            .markers_for(trx.id())?
            .into_iter()
            .map(|m| m.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                MarkerKind::Begin,
                MarkerKind::Data,
                MarkerKind::Data,
                MarkerKind::Commit
            ]
        );
        let docs = db.collection("docs").unwrap();
        assert_eq!(docs.count(db.transactions().last_committed()), 2);
        Ok(())
    }

    #[test]
    fn read_only_commit_writes_no_markers() -> Result<()> {
        let db = db_with("docs");
        let mut trx = db.transactions().new_transaction(&db, ["docs"]);
        trx.begin()?;
        trx.commit()?;
        assert!(db.transactions().log().is_empty());
        assert!(!trx.flags().end_marker_written());
        Ok(())
    }

    #[test]
    fn rollback_after_write_logs_abort() -> Result<()> {
        let db = db_with("docs");
        let mut trx = db.transactions().new_transaction(&db, ["docs"]);
        trx.begin()?;
        trx.insert("docs", json!({"_key": "x"}))?;
        trx.rollback();
        let markers = db.transactions().log().markers_for(trx.id())?;
        assert_eq!(markers.last().map(|m| m.kind), Some(MarkerKind::Abort));
        assert_eq!(db.collection("docs").unwrap().count(CommitId(u64::MAX)), 0);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "commit of a transaction that is not ongoing")]
    fn double_commit_panics() {
        let db = db_with("docs");
        let mut trx = db.transactions().new_transaction(&db, ["docs"]);
        trx.begin().unwrap();
        trx.commit().unwrap();
        let _ = trx.commit();
    }

    #[test]
    #[should_panic(expected = "rollback of a transaction that is not ongoing")]
    fn rollback_after_commit_panics() {
        let db = db_with("docs");
        let mut trx = db.transactions().new_transaction(&db, ["docs"]);
        trx.begin().unwrap();
        trx.commit().unwrap();
        trx.rollback();
    }

    #[test]
    fn duplicate_keys_are_rejected() -> Result<()> {
        let db = db_with("docs");
        db.import("docs", vec![json!({"_key": "a"})])?;
        let mut trx = db.transactions().new_transaction(&db, ["docs"]);
        trx.begin()?;
        assert!(matches!(
            trx.insert("docs", json!({"_key": "a"})),
            Err(TesseraError::UniqueConstraint { .. })
        ));
        trx.insert("docs", json!({"_key": "b"}))?;
        assert!(trx.insert("docs", json!({"_key": "b"})).is_err());
        assert!(matches!(
            trx.insert("docs", json!([1])),
            Err(TesseraError::DocumentType(_))
        ));
        trx.rollback();
        Ok(())
    }

    #[test]
    fn concurrent_conflict_rolls_back_loser() -> Result<()> {
        let db = db_with("docs");
        let mut first = db.transactions().new_transaction(&db, ["docs"]);
        let mut second = db.transactions().new_transaction(&db, ["docs"]);
        first.begin()?;
        second.begin()?;
        first.insert("docs", json!({"_key": "same"}))?;
        second.insert("docs", json!({"_key": "same"}))?;
        first.commit()?;
        let err = second.commit().unwrap_err();
        assert_eq!(err.code(), crate::types::ErrorCode::UniqueConstraintViolated);
        assert!(second.is_rolled_back());
        Ok(())
    }

    #[test]
    fn snapshot_isolation_hides_later_commits() -> Result<()> {
        let db = db_with("docs");
        let mut reader = db.transactions().new_transaction(&db, ["docs"]);
        reader.begin()?;
        db.import("docs", vec![json!({"n": 1})])?;
        assert!(reader.read_collection("docs")?.is_empty());
        reader.commit()?;
        Ok(())
    }

    #[test]
    fn nested_commit_merges_into_parent() -> Result<()> {
        let db = db_with("docs");
        let mut parent = db.transactions().new_transaction(&db, ["docs"]);
        parent.begin()?;
        parent.insert("docs", json!({"_key": "p"}))?;
        let child_id = parent.run_nested(|child| {
            assert!(!child.is_top_level());
            assert_eq!(child.read_collection("docs")?.len(), 1);
            assert!(child.insert("docs", json!({"_key": "p"})).is_err());
            child.insert("docs", json!({"_key": "c"}))?;
            assert!(!child.flags().begin_marker_written());
            Ok(child.id())
        })?;
        assert_eq!(parent.pending_writes().len(), 2);
        assert_eq!(db.transactions().parent_of(child_id), Some(parent.id()));
        assert_eq!(db.transactions().top_level_of(child_id), Some(parent.id()));
        parent.commit()?;
        assert_eq!(db.transactions().status_of(child_id), None);
        assert_eq!(db.collection("docs").unwrap().count(db.transactions().last_committed()), 2);
        Ok(())
    }

    #[test]
    fn nested_failure_leaves_parent_untouched() -> Result<()> {
        let db = db_with("docs");
        let mut parent = db.transactions().new_transaction(&db, ["docs"]);
        parent.begin()?;
        let result: Result<()> = parent.run_nested(|child| {
            child.insert("docs", json!({"_key": "c"}))?;
            Err(TesseraError::Transaction("boom".into()))
        });
        assert!(result.is_err());
        assert!(parent.pending_writes().is_empty());
        parent.commit()?;
        Ok(())
    }

    #[test]
    fn dropping_ongoing_transaction_rolls_back() -> Result<()> {
        let db = db_with("docs");
        let id = {
            let mut trx = db.transactions().new_transaction(&db, ["docs"]);
            trx.begin()?;
            trx.insert("docs", json!({}))?;
            trx.id()
        };
        let markers = db.transactions().log().markers_for(id)?;
        assert_eq!(markers.last().map(|m| m.kind), Some(MarkerKind::Abort));
        assert!(db.transactions().active().is_empty());
        Ok(())
    }

    #[test]
    fn add_collections_only_before_begin() -> Result<()> {
        let db = db_with("docs");
        db.create_collection("more")?;
        let mut trx = db.transactions().new_transaction(&db, ["docs"]);
        trx.add_collections(["more"])?;
        trx.begin()?;
        assert!(trx.add_collections(["x"]).is_err());
        assert_eq!(trx.collections().len(), 2);
        assert!(trx.to_string().starts_with("TopLevelTransaction"));
        trx.commit()?;
        Ok(())
    }
}
