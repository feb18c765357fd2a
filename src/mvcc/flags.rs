#![forbid(unsafe_code)]

use std::fmt;

use tracing::error;

const INITIALIZED: u8 = 0x01;
const BEGIN_MARKER_WRITTEN: u8 = 0x02;
const DATA_MARKER_WRITTEN: u8 = 0x04;
const END_MARKER_WRITTEN: u8 = 0x08;
const PUSHED_ON_THREAD_STACK: u8 = 0x10;

/// Logs and panics on a broken transaction invariant. Active in all build modes.
#[cold]
#[track_caller]
pub(crate) fn invariant_violation(what: &str) -> ! {
    error!(invariant = what, "transaction invariant violated");
    panic!("transaction invariant violated: {what}");
}

/// Marker bookkeeping for a single transaction.
///
/// Setters enforce the order in which markers may reach the log:
/// begin before any data, data any number of times, end exactly once and
/// only after begin.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionFlags(u8);

impl TransactionFlags {
    /// Fresh flag set with nothing recorded.
    pub const fn new() -> Self {
        Self(0)
    }

    fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    /// Whether the transaction fetched its state from the manager.
    pub fn initialized(self) -> bool {
        self.has(INITIALIZED)
    }

    /// Whether a begin marker reached the log.
    pub fn begin_marker_written(self) -> bool {
        self.has(BEGIN_MARKER_WRITTEN)
    }

    /// Whether at least one data marker reached the log.
    pub fn data_marker_written(self) -> bool {
        self.has(DATA_MARKER_WRITTEN)
    }

    /// Whether a commit or abort marker reached the log.
    pub fn end_marker_written(self) -> bool {
        self.has(END_MARKER_WRITTEN)
    }

    /// Whether the transaction is on its thread's transaction stack.
    pub fn pushed_on_thread_stack(self) -> bool {
        self.has(PUSHED_ON_THREAD_STACK)
    }

    /// Records initialization. Panics when called twice.
    #[track_caller]
    pub fn set_initialized(&mut self) {
        if self.initialized() {
            invariant_violation("transaction initialized twice");
        }
        self.0 |= INITIALIZED;
    }

    /// Records the begin marker. Panics if any marker was already written.
    #[track_caller]
    pub fn set_begin_marker_written(&mut self) {
        if self.begin_marker_written() {
            invariant_violation("begin marker written twice");
        }
        if self.data_marker_written() {
            invariant_violation("begin marker written after data marker");
        }
        if self.end_marker_written() {
            invariant_violation("begin marker written after end marker");
        }
        self.0 |= BEGIN_MARKER_WRITTEN;
    }

    /// Records a data marker. Repeatable.
    pub fn set_data_marker_written(&mut self) {
        self.0 |= DATA_MARKER_WRITTEN;
    }

    /// Records the end marker. Panics without a prior begin marker or on repeat.
    #[track_caller]
    pub fn set_end_marker_written(&mut self) {
        if !self.begin_marker_written() {
            invariant_violation("end marker written without begin marker");
        }
        if self.end_marker_written() {
            invariant_violation("end marker written twice");
        }
        self.0 |= END_MARKER_WRITTEN;
    }

    /// Sets or clears the thread-stack membership bit.
    pub fn set_pushed_on_thread_stack(&mut self, value: bool) {
        if value {
            self.0 |= PUSHED_ON_THREAD_STACK;
        } else {
            self.0 &= !PUSHED_ON_THREAD_STACK;
        }
    }

    /// Raw bit pattern, mainly for logging.
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl fmt::Debug for TransactionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionFlags")
            .field("initialized", &self.initialized())
            .field("begin", &self.begin_marker_written())
            .field("data", &self.data_marker_written())
            .field("end", &self.end_marker_written())
            .field("pushed", &self.pushed_on_thread_stack())
            .finish()
    }
}
