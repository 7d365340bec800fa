// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Transaction-local values: keyed storage scoped to one top-level
//! transaction and its children, comparable to thread-locals but per
//! transaction.

use crate::{transaction, transaction::Transaction};
use std::{
    any::Any,
    marker::PhantomData,
    sync::atomic::{AtomicU64, Ordering},
};

// Keys are taken from a monotonic counter instead of the TLocal address: an
// address can be reused by a TLocal constructed right after another one is
// dropped, and the newcomer must not see the stale entry still sitting in a
// running transaction's store. 64 bits do not roll over in any relevant
// process lifetime.
static LOCAL_KEYS: AtomicU64 = AtomicU64::new(1);

/// A value "local" to the running transaction. It starts out unset in every
/// top-level transaction and is discarded when the transaction ends, even
/// on commit, before the after-commit hooks run. Children see the parent's
/// value; a value set in a child becomes the parent's value when the child
/// commits and disappears when it aborts.
pub struct TLocal<T> {
    key: u64,
    marker: PhantomData<fn(T) -> T>,
}

impl<T> TLocal<T>
where
    T: Any + Clone,
{
    pub fn new() -> Self {
        TLocal {
            key: LOCAL_KEYS.fetch_add(1, Ordering::Relaxed),
            marker: PhantomData,
        }
    }

    /// The value set in this transaction (or a parent), if any.
    pub fn get(&self, tx: &mut Transaction) -> Option<T> {
        let _ = tx;
        transaction::local_lookup(self.key, |value| value.downcast_ref::<T>().cloned()).flatten()
    }

    /// Sets the value for the innermost running transaction.
    pub fn set(&self, value: T, tx: &mut Transaction) {
        let _ = tx;
        transaction::local_insert(self.key, Box::new(value));
    }
}

impl<T> Default for TLocal<T>
where
    T: Any + Clone,
{
    fn default() -> Self {
        TLocal::new()
    }
}

/// A transaction-local latch for work that must happen at most once per
/// transaction.
#[derive(Default)]
pub struct TLocalFlag {
    flag: TLocal<bool>,
}

impl TLocalFlag {
    pub fn new() -> Self {
        TLocalFlag { flag: TLocal::new() }
    }

    /// Sets the flag and returns its prior value.
    pub fn test_and_set(&self, tx: &mut Transaction) -> bool {
        let prior = self.flag.get(tx).unwrap_or(false);
        self.flag.set(true, tx);
        prior
    }
}
