//! Explicit transaction handle for compensation-based rollback.
//!
//! spec.md §9 calls for replacing a thread-local transaction context with
//! "an explicit `Tx` value passed through mutating APIs; compensations
//! are closures enqueued on `tx` and run on `rollback`." Every mutator in
//! [`crate::state`] takes a `&mut Tx`, records one closure per primitive
//! edit it makes, and either `commit`s (a no-op; the log is simply
//! dropped) or `rollback`s (runs the closures in reverse) depending on
//! whether the whole operation succeeded.

use super::StateData;

/// One undo step: given mutable access to the state it was recorded
/// against, reverses exactly the edit that pushed it.
type Compensation = Box<dyn FnOnce(&mut StateData) + Send>;

/// A transaction in progress. Compensations accumulate in registration
/// order and, on rollback, run in reverse order — last edit undone
/// first, matching spec.md's "commit discards the log; rollback runs
/// compensations in reverse."
#[derive(Default)]
pub struct Tx {
    compensations: Vec<Compensation>,
}

impl Tx {
    pub fn new() -> Tx {
        Tx { compensations: Vec::new() }
    }

    /// Records `undo` as the compensation for the edit just made.
    pub fn record(&mut self, undo: impl FnOnce(&mut StateData) + Send + 'static) {
        self.compensations.push(Box::new(undo));
    }

    /// Discards the log: the edits made under this transaction stand.
    pub fn commit(self) {}

    /// Runs every compensation in reverse registration order, undoing
    /// the transaction's edits. Compensations are expected never to fail
    /// materially; a primitive that can't be undone is a bug in the
    /// mutator that recorded it, not something this type guards against.
    pub fn rollback(self, data: &mut StateData) {
        for undo in self.compensations.into_iter().rev() {
            undo(data);
        }
    }
}
