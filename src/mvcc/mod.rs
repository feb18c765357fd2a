//! Multi-version transactions and the marker log that records their progress.
//!
//! A [`Transaction`] is owned by whoever opened it (a query, or its parent for
//! nested transactions). The [`TransactionManager`] only keeps bookkeeping
//! entries indexed by id: status, tree position and snapshot. Marker ordering
//! is enforced by [`TransactionFlags`]; a violation panics instead of
//! surfacing as an error.

mod flags;
mod manager;
pub mod markers;
pub mod stack;
mod transaction;

pub use flags::TransactionFlags;
pub use manager::TransactionManager;
pub use markers::{Marker, MarkerKind, MarkerLog, MarkerLogStats};
pub use transaction::{PendingWrite, Transaction, TransactionKind, TransactionStatus};
