//! Correlation table - matches asynchronous replies to the call that produced them.
//!
//! Indices are allocated monotonically starting at 1 and only wrap at
//! `u64::MAX`; 0 and indices that are still pending are skipped. Every entry
//! is removed exactly once: `take` on a missing index is a no-op.

use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;

use crate::types::Result;

/// Completion side of a pending call.
pub type Waiter = oneshot::Sender<Result<Value>>;

/// Awaiting side of a pending call.
pub type Pending = oneshot::Receiver<Result<Value>>;

#[derive(Debug)]
pub struct CorrelationTable {
    next: u64,
    entries: HashMap<u64, Waiter>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub(crate) fn starting_at(next: u64) -> Self {
        Self {
            next: next.max(1),
            entries: HashMap::new(),
        }
    }

    /// Allocate an index and return it with the receiver to await.
    pub fn register(&mut self) -> (u64, Pending) {
        let (tx, rx) = oneshot::channel();
        (self.insert(tx), rx)
    }

    /// Allocate an index for a caller-provided waiter.
    pub fn insert(&mut self, waiter: Waiter) -> u64 {
        let index = self.allocate();
        self.entries.insert(index, waiter);
        index
    }

    /// Remove an entry. Returns `None` when it was already removed.
    pub fn take(&mut self, index: u64) -> Option<Waiter> {
        self.entries.remove(&index)
    }

    /// Remove the entry, then complete it. Returns whether an entry matched.
    pub fn resolve(&mut self, index: u64, outcome: Result<Value>) -> bool {
        match self.take(index) {
            Some(waiter) => {
                // The caller may have stopped waiting; that is not an error here.
                let _ = waiter.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, index: u64) -> bool {
        self.entries.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn allocate(&mut self) -> u64 {
        loop {
            let candidate = self.next;
            self.next = match self.next.wrapping_add(1) {
                0 => 1,
                n => n,
            };
            if !self.entries.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Error;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_indices_are_monotonic_from_one() {
        let mut table = CorrelationTable::new();
        let (a, _ra) = table.register();
        let (b, _rb) = table.register();
        let (c, _rc) = table.register();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(table.len(), 3);
    }

    #[tokio::test]
    async fn test_resolve_completes_waiter_once() {
        let mut table = CorrelationTable::new();
        let (index, rx) = table.register();

        assert!(table.resolve(index, Ok(json!("done"))));
        assert!(!table.resolve(index, Ok(json!("late"))));
        assert!(table.is_empty());

        assert_eq!(rx.await.unwrap().unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_resolve_with_error() {
        let mut table = CorrelationTable::new();
        let (index, rx) = table.register();
        table.resolve(index, Err(Error::WorkerExited));
        assert!(matches!(rx.await.unwrap(), Err(Error::WorkerExited)));
    }

    #[test]
    fn test_take_is_idempotent() {
        let mut table = CorrelationTable::new();
        let (index, _rx) = table.register();
        assert!(table.take(index).is_some());
        assert!(table.take(index).is_none());
        assert!(!table.contains(index));
    }

    #[test]
    fn test_wraps_past_max_and_skips_zero_and_pending() {
        let mut table = CorrelationTable::starting_at(u64::MAX);
        let (max, _r1) = table.register();
        assert_eq!(max, u64::MAX);
        let (wrapped, _r2) = table.register();
        assert_eq!(wrapped, 1);

        // 1 is still pending after another full wrap; allocation must skip it.
        let mut table = CorrelationTable::new();
        let (one, _r1) = table.register();
        assert_eq!(one, 1);
        table.next = u64::MAX;
        let (max, _r2) = table.register();
        assert_eq!(max, u64::MAX);
        let (next, _r3) = table.register();
        assert_eq!(next, 2);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register,
        Take(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Register), (0usize..64).prop_map(Op::Take)]
    }

    proptest! {
        #[test]
        fn prop_pending_indices_are_unique_and_removed_once(ops in proptest::collection::vec(op(), 1..200)) {
            let mut table = CorrelationTable::new();
            let mut live: Vec<u64> = Vec::new();
            let mut receivers = Vec::new();

            for op in ops {
                match op {
                    Op::Register => {
                        let (index, rx) = table.register();
                        prop_assert!(index != 0);
                        prop_assert!(!live.contains(&index));
                        live.push(index);
                        receivers.push(rx);
                    }
                    Op::Take(slot) => {
                        if live.is_empty() {
                            continue;
                        }
                        let index = live.remove(slot % live.len());
                        prop_assert!(table.take(index).is_some());
                        prop_assert!(table.take(index).is_none());
                    }
                }
                prop_assert_eq!(table.len(), live.len());
            }
        }
    }
}
