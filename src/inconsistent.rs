// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Inconsistent reads: a non-committing access mode that reads variables
//! directly, without a transaction record, snapshots or validation.

use crate::{
    ctrl::{self, NoAtomic},
    errors::TxResult,
};
use parking_lot::RwLockWriteGuard;

/// Capability handed to [`inconsistently`] closures. It can only read
/// variables, and nothing it observes is cached: reading the same variable
/// twice can produce two different values. Individual reads are still
/// thread-safe, just not consistent with one another, unless the reader
/// holds its read lock for the span that has to be consistent.
pub struct Inconsistent {
    lock_depth: usize,
    guard: Option<RwLockWriteGuard<'static, ()>>,
}

impl Inconsistent {
    fn new() -> Self {
        Inconsistent {
            lock_depth: 0,
            guard: None,
        }
    }

    /// Keeps every publisher out until [`read_unlock`](Self::read_unlock)
    /// brings the count back to zero, making a span of reads mutually
    /// consistent. Reference-counted; residual depth is released when the
    /// reader is dropped.
    ///
    /// Committing a transaction on this thread while the lock is held would
    /// wait on the thread itself: release the lock before calling back into
    /// [`atomically`](crate::atomically).
    pub fn read_lock(&mut self) {
        self.lock_depth += 1;
        if self.guard.is_none() {
            self.guard = Some(ctrl::publication_lock().write());
        }
    }

    pub fn read_unlock(&mut self) {
        if self.lock_depth == 0 {
            log::warn!("read_unlock without a matching read_lock");
            return;
        }
        self.lock_depth -= 1;
        if self.lock_depth == 0 {
            self.guard = None;
        }
    }

    pub fn is_read_locked(&self) -> bool {
        self.lock_depth > 0
    }
}

/// Runs `op` with an [`Inconsistent`] reader.
///
/// Unlike a transaction this never restarts and never blocks on other
/// transactions; it is the right tool when a bunch of variables have to be
/// read and it does not matter that they may change while the reading is
/// going on. Gated by [`NoAtomic`]: constructing the guard fails with
/// [`TxError::InAtomic`](crate::errors::TxError::InAtomic) when a
/// transaction is running on this thread. Calling
/// [`atomically`](crate::atomically) from within the closure is fine and
/// starts a regular top-level transaction.
pub fn inconsistently<T, F>(op: F) -> TxResult<T>
where
    F: FnOnce(&mut Inconsistent) -> TxResult<T>,
{
    let _guard = NoAtomic::new()?;
    let mut reader = Inconsistent::new();
    op(&mut reader)
}
