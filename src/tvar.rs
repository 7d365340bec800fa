// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    ctrl,
    errors::{TxError, TxResult},
    inconsistent::Inconsistent,
    retry::WaitToken,
    transaction::{self, Transaction},
};
use parking_lot::{Mutex, RwLock};
use std::{
    any::Any,
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Type-erased payload of a transactional variable. Payloads are shared
/// between the variable and any snapshots that were taken of it, so they are
/// immutable once stored.
pub(crate) type Payload = Arc<dyn Any + Send + Sync>;

/// Allocation-time serial numbers. The serial is the stable identity of a
/// variable for its whole life: it keys the read and write sets and defines
/// the total order in which commit acquires cell locks. The handle address
/// cannot serve here since handles are movable.
static VAR_IDS: AtomicU64 = AtomicU64::new(1);

/// A `(value, version)` pair captured by a transactional read. The pair is
/// cloned out under the cell's read lock, so it is always mutually
/// consistent and independent of later mutations of the cell.
pub(crate) struct Snapshot {
    pub(crate) value: Payload,
    pub(crate) version: u64,
}

/// The guarded state of one variable. Mutated only by the commit engine,
/// under the exclusive guard.
pub(crate) struct CoreData {
    pub(crate) value: Payload,
    pub(crate) version: u64,
}

/// The shared core of a transactional variable: the versioned payload behind
/// the cell lock, plus the waiter list of retrying transactions parked on
/// this cell.
pub(crate) struct VarCore {
    id: u64,
    pub(crate) data: RwLock<CoreData>,
    waiters: Mutex<Vec<Arc<WaitToken>>>,
}

impl VarCore {
    fn new(value: Payload) -> Arc<Self> {
        Arc::new(VarCore {
            id: VAR_IDS.fetch_add(1, Ordering::Relaxed),
            data: RwLock::new(CoreData { value, version: 0 }),
            waiters: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn version(&self) -> u64 {
        self.data.read().version
    }

    /// Clones the current `(value, version)` pair out under the read lock.
    pub(crate) fn snapshot(&self) -> Snapshot {
        let data = self.data.read();
        Snapshot {
            value: data.value.clone(),
            version: data.version,
        }
    }

    /// Current payload without any snapshot bookkeeping. Used by the
    /// inconsistent reader.
    pub(crate) fn load(&self) -> Payload {
        self.data.read().value.clone()
    }

    pub(crate) fn register_waiter(&self, token: &Arc<WaitToken>) {
        self.waiters.lock().push(token.clone());
    }

    pub(crate) fn unregister_waiter(&self, token: &Arc<WaitToken>) {
        self.waiters.lock().retain(|t| !Arc::ptr_eq(t, token));
    }

    /// Transfers all parked waiters off the cell. Called by the commit
    /// engine once a new version of this cell has been published.
    pub(crate) fn take_waiters(&self) -> Vec<Arc<WaitToken>> {
        std::mem::take(&mut *self.waiters.lock())
    }
}

pub(crate) fn downcast<T>(payload: &Payload) -> TxResult<T>
where
    T: Any + Clone,
{
    payload
        .downcast_ref::<T>()
        .cloned()
        .ok_or(TxError::TypeConflict)
}

/// A transactional variable.
///
/// Access to the contents is restricted to closures running under
/// [`atomically`](crate::atomically) (or, read-only and unvalidated, under
/// [`inconsistently`](crate::inconsistently)). The handle itself is
/// move-only; sharing a variable between threads goes through
/// `Arc<TVar<T>>`, which keeps the sharing explicit.
///
/// The payload type must be [`Clone`]: values are copied into and out of the
/// variable, never moved. A transaction can be restarted at any time, and a
/// value that had been moved out of user state would not be available to the
/// re-run closure.
pub struct TVar<T> {
    core: Arc<VarCore>,
    marker: PhantomData<fn(T) -> T>,
}

impl<T> TVar<T>
where
    T: Any + Send + Sync + Clone,
{
    /// Creates a new variable holding `value` at version 0.
    pub fn new(value: T) -> Self {
        TVar {
            core: VarCore::new(Arc::new(value)),
            marker: PhantomData,
        }
    }

    /// Reads the variable inside a transaction.
    ///
    /// The first read takes a snapshot of the current value; every later
    /// read within the same transaction returns that snapshot (or the
    /// pending value, once [`set`](Self::set) was called), so repeated reads
    /// are stable no matter what other threads commit in between.
    pub fn get(&self, tx: &mut Transaction) -> TxResult<T> {
        let _ = tx;
        downcast(&transaction::var_get(&self.core))
    }

    /// Writes `value` into the transaction's write set. The write becomes
    /// visible to other threads only when the top-level transaction commits.
    pub fn set(&self, value: T, tx: &mut Transaction) -> TxResult<()> {
        let _ = tx;
        transaction::var_set(&self.core, Arc::new(value));
        Ok(())
    }

    /// Reads, transforms and writes back in one step.
    pub fn apply<F>(&self, tx: &mut Transaction, f: F) -> TxResult<()>
    where
        F: FnOnce(T) -> T,
    {
        let value = self.get(tx)?;
        self.set(f(value), tx)
    }

    /// Validates just this variable: if the transaction holds a snapshot of
    /// it and the snapshot has gone stale, the transaction conflicts now
    /// instead of at commit. Useful to cut long doomed transactions short; a
    /// full validation happens at commit either way.
    pub fn validate(&self, tx: &mut Transaction) -> TxResult<()> {
        let _ = tx;
        transaction::var_validate(&self.core)
    }

    /// Reads the variable under an inconsistent reader. No snapshot is
    /// taken: two calls for the same variable may observe different values.
    pub fn get_inconsistent(&self, ins: &mut Inconsistent) -> TxResult<T> {
        let _ = ins;
        downcast(&self.core.load())
    }

    /// Reads the variable in its own transaction. Slower than
    /// [`get`](Self::get) when a transaction is already running.
    pub fn get_readonly(&self) -> TxResult<T> {
        ctrl::atomically(|tx| self.get(tx))
    }

    /// Writes the variable in its own transaction.
    pub fn set_readonly(&self, value: T) -> TxResult<()> {
        ctrl::atomically(|tx| self.set(value.clone(), tx))
    }

}

impl<T> TVar<T> {
    pub(crate) fn core(&self) -> &Arc<VarCore> {
        &self.core
    }
}

impl<T> Default for TVar<T>
where
    T: Any + Send + Sync + Clone + Default,
{
    fn default() -> Self {
        TVar::new(T::default())
    }
}

impl<T> fmt::Debug for TVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core();
        let mut out = f.debug_struct("TVar");
        out.field("id", &core.id());
        if let Some(data) = core.data.try_read() {
            out.field("version", &data.version);
        }
        out.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_detached() {
        let var = TVar::new(7usize);
        let snapshot = var.core().snapshot();

        assert_eq!(snapshot.version, 0);
        assert_eq!(downcast::<usize>(&snapshot.value), Ok(7));
    }

    #[test]
    fn test_var_ids_are_unique() {
        let a = TVar::new(0usize);
        let b = TVar::new(0usize);

        assert_ne!(a.core().id(), b.core().id());
    }

    #[test]
    fn test_downcast_mismatch() {
        let var = TVar::new(1usize);
        let payload = var.core().load();

        assert_eq!(downcast::<String>(&payload), Err(TxError::TypeConflict));
    }
}
