#![forbid(unsafe_code)]

//! In-memory catalog of named document collections.
//!
//! Every stored document is a version tagged with the commit that created it
//! (`begin`) and, once superseded, the commit that ended it (`end`). Readers
//! pass the snapshot commit id they started from and see exactly the versions
//! alive at that point.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::mvcc::TransactionManager;
use crate::types::{CollectionId, CommitId, Result, TesseraError};

/// Attribute holding a document's primary key.
pub const KEY_ATTRIBUTE: &str = "_key";

/// One stored version of a document.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentVersion {
    /// Primary key, copied from the body's `_key`.
    pub key: String,
    /// Commit that made this version visible.
    pub begin: CommitId,
    /// Commit that ended this version, if any.
    pub end: Option<CommitId>,
    /// Document body, always a JSON object.
    pub body: Arc<JsonValue>,
}

impl DocumentVersion {
    /// Whether the version is visible to a reader at `snapshot`.
    pub fn visible_at(&self, snapshot: CommitId) -> bool {
        self.begin <= snapshot && self.end.map_or(true, |end| end > snapshot)
    }
}

#[derive(Default)]
struct CollectionData {
    versions: Vec<DocumentVersion>,
    live: HashMap<String, usize>,
}

/// A named set of documents.
pub struct Collection {
    id: CollectionId,
    name: String,
    data: RwLock<CollectionData>,
}

impl Collection {
    fn new(id: CollectionId, name: String) -> Self {
        Self {
            id,
            name,
            data: RwLock::new(CollectionData::default()),
        }
    }

    /// Catalog-assigned id.
    pub fn id(&self) -> CollectionId {
        self.id
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Document bodies visible at `snapshot`, in insertion order.
    pub fn snapshot(&self, snapshot: CommitId) -> Vec<Arc<JsonValue>> {
        self.data
            .read()
            .versions
            .iter()
            .filter(|version| version.visible_at(snapshot))
            .map(|version| Arc::clone(&version.body))
            .collect()
    }

    /// Number of documents visible at `snapshot`.
    pub fn count(&self, snapshot: CommitId) -> u64 {
        self.data
            .read()
            .versions
            .iter()
            .filter(|version| version.visible_at(snapshot))
            .count() as u64
    }

    /// Whether a document with `key` is visible at `snapshot`.
    pub fn contains_key_at(&self, key: &str, snapshot: CommitId) -> bool {
        self.data
            .read()
            .versions
            .iter()
            .any(|version| version.key == key && version.visible_at(snapshot))
    }

    /// Whether a document with `key` is alive in the latest state.
    pub fn contains_live_key(&self, key: &str) -> bool {
        self.data.read().live.contains_key(key)
    }

    /// All stored versions, including ended ones.
    pub fn versions(&self) -> Vec<DocumentVersion> {
        self.data.read().versions.clone()
    }

    pub(crate) fn apply_insert(
        &self,
        key: &str,
        body: Arc<JsonValue>,
        commit: CommitId,
    ) -> Result<()> {
        let mut data = self.data.write();
        if data.live.contains_key(key) {
            return Err(TesseraError::UniqueConstraint {
                collection: self.name.clone(),
                key: key.to_owned(),
            });
        }
        let slot = data.versions.len();
        data.versions.push(DocumentVersion {
            key: key.to_owned(),
            begin: commit,
            end: None,
            body,
        });
        data.live.insert(key.to_owned(), slot);
        Ok(())
    }
}

/// A database: a catalog of collections plus the transaction manager that
/// sequences writes into them.
pub struct Database {
    name: String,
    config: EngineConfig,
    collections: RwLock<BTreeMap<String, Arc<Collection>>>,
    next_collection_id: AtomicU32,
    next_key: AtomicU64,
    transactions: TransactionManager,
}

impl Database {
    /// Creates an empty database with the default engine configuration.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_config(name, EngineConfig::default())
    }

    /// Creates an empty database with an explicit configuration.
    pub fn with_config(name: impl Into<String>, config: EngineConfig) -> Arc<Self> {
        let name = name.into();
        debug!(database = %name, batch_size = config.batch_size, "database created");
        Arc::new(Self {
            name,
            config,
            collections: RwLock::new(BTreeMap::new()),
            next_collection_id: AtomicU32::new(1),
            next_key: AtomicU64::new(1),
            transactions: TransactionManager::new(),
        })
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The transaction manager for this database.
    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Creates a collection. Fails if the name is empty or already taken.
    pub fn create_collection(&self, name: &str) -> Result<Arc<Collection>> {
        validate_name(name)?;
        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            return Err(TesseraError::DuplicateName(name.to_owned()));
        }
        let id = CollectionId(self.next_collection_id.fetch_add(1, Ordering::SeqCst));
        let collection = Arc::new(Collection::new(id, name.to_owned()));
        collections.insert(name.to_owned(), Arc::clone(&collection));
        info!(database = %self.name, collection = name, id = id.0, "collection created");
        Ok(collection)
    }

    /// Removes a collection and all its documents.
    pub fn drop_collection(&self, name: &str) -> Result<()> {
        let _commits = self.transactions.lock_commits();
        match self.collections.write().remove(name) {
            Some(_) => {
                info!(database = %self.name, collection = name, "collection dropped");
                Ok(())
            }
            None => Err(TesseraError::CollectionNotFound(name.to_owned())),
        }
    }

    /// Looks up a collection by name.
    pub fn collection(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections.read().get(name).cloned()
    }

    /// Names of all collections, sorted.
    pub fn collection_names(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }

    pub(crate) fn generate_key(&self) -> String {
        self.next_key.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Inserts `documents` into `collection` in one transaction, creating the
    /// collection when missing. Returns the number of documents written.
    pub fn import(
        self: &Arc<Self>,
        collection: &str,
        documents: impl IntoIterator<Item = JsonValue>,
    ) -> Result<usize> {
        if self.collection(collection).is_none() {
            self.create_collection(collection)?;
        }
        let mut trx = self.transactions.new_transaction(self, [collection]);
        trx.begin()?;
        let mut written = 0usize;
        for document in documents {
            trx.insert(collection, document)?;
            written += 1;
        }
        trx.commit()?;
        debug!(collection, written, "documents imported");
        Ok(written)
    }

    /// Seeds collections from a JSON object of the form
    /// `{"<collection>": [<document>, ...], ...}`.
    pub fn load_json(self: &Arc<Self>, data: &JsonValue) -> Result<usize> {
        let object = data
            .as_object()
            .ok_or(TesseraError::DocumentType("seed data must be an object"))?;
        let mut total = 0usize;
        for (name, documents) in object {
            let documents = documents
                .as_array()
                .ok_or(TesseraError::DocumentType("seed collection must be an array"))?;
            total += self.import(name, documents.iter().cloned())?;
        }
        Ok(total)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 256
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(TesseraError::BadParameter(format!(
            "illegal collection name '{name}'"
        )))
    }
}
