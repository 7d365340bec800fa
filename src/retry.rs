// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Blocking retry: a transaction that cannot proceed parks itself until one
//! of the variables it has read is published by another commit.

use crate::{
    errors::{TxError, TxResult},
    transaction::{ReadEntry, Transaction},
};
use log::*;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

/// Abandons the current attempt and parks the thread until another
/// transaction commits a write to any variable this transaction has read.
/// On wake-up the outermost transaction restarts. The generic return type
/// lets `return retry(tx);` stand in for any closure result.
pub fn retry<T>(tx: &mut Transaction) -> TxResult<T> {
    let _ = tx;
    Err(TxError::RetrySignal)
}

/// Like [`retry`], but waits at most `timeout`. If the deadline passes
/// without any read variable changing, the outermost
/// [`atomically`](crate::atomically) fails with
/// [`TxError::RetryTimeout`].
pub fn retry_for<T>(tx: &mut Transaction, timeout: Duration) -> TxResult<T> {
    tx.set_retry_timeout(timeout);
    Err(TxError::RetrySignal)
}

/// One parked thread. The token is registered with every cell in the read
/// set; the first commit that publishes any of them flips the flag and
/// wakes the condvar.
#[derive(Default)]
pub(crate) struct WaitToken {
    notified: Mutex<bool>,
    cond: Condvar,
}

impl WaitToken {
    pub(crate) fn notify(&self) {
        let mut notified = self.notified.lock();
        *notified = true;
        self.cond.notify_all();
    }

    fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut notified = self.notified.lock();
        while !*notified {
            match deadline {
                Some(at) => {
                    if self.cond.wait_until(&mut notified, at).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut notified),
            }
        }
        *notified
    }
}

pub(crate) enum WaitOutcome {
    /// A commit touched one of the read cells while we were parked.
    Notified,
    /// A commit had already touched one of the read cells before we parked;
    /// restart without blocking.
    AlreadyChanged,
    /// The deadline passed first.
    TimedOut,
}

/// Parks the calling thread on the union of the change channels of `reads`.
///
/// Registration happens before the staleness check, and commits publish
/// before they notify; together that closes the window in which a
/// publication could slip between "check" and "park" unseen.
pub(crate) fn wait_on_reads(
    reads: &BTreeMap<u64, ReadEntry>,
    deadline: Option<Instant>,
) -> WaitOutcome {
    let token = Arc::new(WaitToken::default());

    let mut registered = Vec::with_capacity(reads.len());
    for entry in reads.values() {
        if let Some(core) = entry.core.upgrade() {
            core.register_waiter(&token);
            registered.push(core);
        }
    }

    if registered.is_empty() && deadline.is_none() {
        warn!("retry with an empty read set can never be woken");
    }

    let mut changed = false;
    for entry in reads.values() {
        if let Some(core) = entry.core.upgrade() {
            if core.version() != entry.snapshot.version {
                changed = true;
                break;
            }
        }
    }

    let outcome = if changed {
        WaitOutcome::AlreadyChanged
    } else {
        debug!("parking on {} vars", registered.len());
        if token.wait_until(deadline) {
            WaitOutcome::Notified
        } else {
            WaitOutcome::TimedOut
        }
    };

    for core in &registered {
        core.unregister_waiter(&token);
    }

    outcome
}
