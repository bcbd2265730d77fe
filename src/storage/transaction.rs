use std::cell::{Cell, RefCell};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::storage::delta::DeltaId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    Aborted,
}

/// Bookkeeping of one open transaction.
///
/// `commit_timestamp` is the atomic every delta created by the transaction
/// points at. It holds the transaction id while the transaction is active;
/// the commit flips it to the assigned commit timestamp, publishing every
/// delta of the transaction to readers at once.
#[derive(Debug)]
pub struct Transaction {
    pub id: u64,
    pub start_timestamp: u64,
    command_id: Cell<u64>,
    pub commit_timestamp: Arc<AtomicU64>,
    deltas: RefCell<Vec<DeltaId>>,
    state: Cell<TxState>,
}

impl Transaction {
    pub fn new(id: u64, start_timestamp: u64) -> Self {
        Self {
            id,
            start_timestamp,
            command_id: Cell::new(0),
            commit_timestamp: Arc::new(AtomicU64::new(id)),
            deltas: RefCell::new(Vec::new()),
            state: Cell::new(TxState::Active),
        }
    }

    pub fn command_id(&self) -> u64 {
        self.command_id.get()
    }

    /// Later commands observe the writes of earlier ones.
    pub fn advance_command(&self) {
        self.command_id.set(self.command_id.get() + 1);
    }

    pub fn push_delta(&self, id: DeltaId) {
        self.deltas.borrow_mut().push(id);
    }

    /// Delta handles in creation order.
    pub fn delta_ids(&self) -> Vec<DeltaId> {
        self.deltas.borrow().clone()
    }

    pub fn has_deltas(&self) -> bool {
        !self.deltas.borrow().is_empty()
    }

    pub fn state(&self) -> TxState {
        self.state.get()
    }

    pub fn set_state(&self, state: TxState) {
        self.state.set(state);
    }
}
