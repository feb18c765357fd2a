#![forbid(unsafe_code)]

//! Per-thread stack of running transactions.

use std::cell::RefCell;

use crate::types::TransactionId;

thread_local! {
    static STACK: RefCell<Vec<TransactionId>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn push(id: TransactionId) {
    STACK.with(|stack| stack.borrow_mut().push(id));
}

/// Removes `id` from this thread's stack. Returns false if it was not there,
/// e.g. when a transaction is finished on a different thread.
pub(crate) fn remove(id: TransactionId) -> bool {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        match stack.iter().rposition(|entry| *entry == id) {
            Some(pos) => {
                stack.remove(pos);
                true
            }
            None => false,
        }
    })
}

/// Innermost transaction running on the calling thread.
pub fn current() -> Option<TransactionId> {
    STACK.with(|stack| stack.borrow().last().copied())
}

/// Depth of the calling thread's transaction stack.
pub fn depth() -> usize {
    STACK.with(|stack| stack.borrow().len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_remove_out_of_order() {
        let base = depth();
        push(TransactionId(100));
        push(TransactionId(101));
        assert_eq!(current(), Some(TransactionId(101)));
        assert!(remove(TransactionId(100)));
        assert_eq!(current(), Some(TransactionId(101)));
        assert!(remove(TransactionId(101)));
        assert!(!remove(TransactionId(101)));
        assert_eq!(depth(), base);
    }
}
