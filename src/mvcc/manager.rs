#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::catalog::Database;
use crate::types::{CommitId, TransactionId};

use super::markers::MarkerLog;
use super::transaction::{Transaction, TransactionKind, TransactionStatus};

/// Bookkeeping record kept for every transaction the manager handed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Entry {
    kind: TransactionKind,
    status: TransactionStatus,
    began: bool,
    snapshot: CommitId,
}

#[derive(Default)]
struct ManagerState {
    entries: FxHashMap<TransactionId, Entry>,
}

impl ManagerState {
    fn top_level_of(&self, mut id: TransactionId) -> Option<TransactionId> {
        loop {
            match self.entries.get(&id)?.kind {
                TransactionKind::TopLevel => return Some(id),
                TransactionKind::Nested { parent } => id = parent,
            }
        }
    }
}

/// Assigns transaction ids, tracks the active set, and sequences commits.
///
/// The manager never owns a [`Transaction`]; it keeps an id-indexed table of
/// small entries so parent and top-level lookups are plain index walks.
/// Entries of a transaction tree are pruned once its top-level transaction
/// finishes.
pub struct TransactionManager {
    next_id: AtomicU64,
    last_committed: AtomicU64,
    state: Mutex<ManagerState>,
    commit_lock: Mutex<()>,
    log: MarkerLog,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    /// Creates a manager with an empty marker log.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            last_committed: AtomicU64::new(0),
            state: Mutex::new(ManagerState::default()),
            commit_lock: Mutex::new(()),
            log: MarkerLog::new(),
        }
    }

    /// Creates a top-level transaction over `collections`, not yet begun.
    pub fn new_transaction<I, S>(&self, db: &Arc<Database>, collections: I) -> Transaction
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = self.register(TransactionKind::TopLevel);
        let collections: BTreeSet<String> = collections.into_iter().map(Into::into).collect();
        debug!(tx_id = id.0, collections = collections.len(), "transaction created");
        Transaction::new(id, TransactionKind::TopLevel, Arc::clone(db), collections)
    }

    pub(crate) fn register(&self, kind: TransactionKind) -> TransactionId {
        let id = TransactionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.state.lock().entries.insert(
            id,
            Entry {
                kind,
                status: TransactionStatus::Ongoing,
                began: false,
                snapshot: CommitId::default(),
            },
        );
        id
    }

    /// Marks `id` as begun and returns the snapshot it reads from.
    ///
    /// Runs under the manager lock, so concurrent begins observe a
    /// consistent commit sequence. Nested transactions inherit their top-level
    /// transaction's snapshot.
    pub(crate) fn register_begin(&self, id: TransactionId) -> CommitId {
        let mut state = self.state.lock();
        let inherited = match state.entries.get(&id).map(|entry| entry.kind) {
            Some(TransactionKind::Nested { .. }) => state
                .top_level_of(id)
                .and_then(|top| state.entries.get(&top))
                .filter(|top| top.began)
                .map(|top| top.snapshot),
            _ => None,
        };
        let snapshot =
            inherited.unwrap_or_else(|| CommitId(self.last_committed.load(Ordering::Acquire)));
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.began = true;
            entry.snapshot = snapshot;
        }
        snapshot
    }

    /// Records the terminal status of `id`.
    pub(crate) fn finish(&self, id: TransactionId, status: TransactionStatus) {
        let mut state = self.state.lock();
        let kind = match state.entries.get_mut(&id) {
            Some(entry) => {
                entry.status = status;
                entry.kind
            }
            None => return,
        };
        if kind == TransactionKind::TopLevel {
            let tree: Vec<TransactionId> = state
                .entries
                .keys()
                .copied()
                .filter(|candidate| state.top_level_of(*candidate) == Some(id))
                .collect();
            for member in tree {
                state.entries.remove(&member);
            }
        }
    }

    /// Serializes commit application across transactions.
    pub(crate) fn lock_commits(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    /// Next commit id. Call while holding [`Self::lock_commits`].
    pub(crate) fn next_commit_id(&self) -> CommitId {
        CommitId(self.last_committed.load(Ordering::Acquire) + 1)
    }

    /// Makes `commit` visible to transactions that begin afterwards.
    pub(crate) fn publish_commit(&self, commit: CommitId) {
        self.last_committed.store(commit.0, Ordering::Release);
    }

    /// Most recently published commit id.
    pub fn last_committed(&self) -> CommitId {
        CommitId(self.last_committed.load(Ordering::Acquire))
    }

    /// Parent of a nested transaction; `None` for top-level or unknown ids.
    pub fn parent_of(&self, id: TransactionId) -> Option<TransactionId> {
        match self.state.lock().entries.get(&id)?.kind {
            TransactionKind::TopLevel => None,
            TransactionKind::Nested { parent } => Some(parent),
        }
    }

    /// Root of the transaction tree `id` belongs to.
    pub fn top_level_of(&self, id: TransactionId) -> Option<TransactionId> {
        self.state.lock().top_level_of(id)
    }

    /// Whether `id` is a known top-level transaction.
    pub fn is_top_level(&self, id: TransactionId) -> bool {
        matches!(
            self.state.lock().entries.get(&id),
            Some(Entry {
                kind: TransactionKind::TopLevel,
                ..
            })
        )
    }

    /// Status of a tracked transaction.
    pub fn status_of(&self, id: TransactionId) -> Option<TransactionStatus> {
        self.state.lock().entries.get(&id).map(|entry| entry.status)
    }

    /// Ids of transactions that began and have not finished, ascending.
    pub fn active(&self) -> Vec<TransactionId> {
        let state = self.state.lock();
        let mut ids: Vec<TransactionId> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.began && entry.status == TransactionStatus::Ongoing)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// The shared marker log.
    pub fn log(&self) -> &MarkerLog {
        &self.log
    }
}
