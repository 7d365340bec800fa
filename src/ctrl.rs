// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The conflict control loop: the outer driver behind
//! [`atomically`], restarting conflicted attempts, delegating retries to
//! the wait subsystem and enforcing the configured limits.

use crate::{
    errors::{TxError, TxResult},
    profile,
    retry::{self, WaitOutcome},
    transaction::{self, AttemptGuard, Transaction},
};
use lazy_static::lazy_static;
use log::*;
use parking_lot::RwLock;
use std::{panic::Location, time::{Duration, Instant}};

lazy_static! {
    /// Process-wide publication exclusion. Every commit publishes while
    /// holding this shared; a transaction-wide read lock or a run-locked
    /// attempt holds it exclusively and thereby keeps all publication out.
    static ref PUBLICATION: RwLock<()> = RwLock::new(());
}

pub(crate) fn publication_lock() -> &'static RwLock<()> {
    &PUBLICATION
}

/// What to do when a transaction keeps conflicting past `max_conflicts`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Give up: `atomically` fails with [`TxError::MaxConflicts`].
    Abort,

    /// Run one more attempt while holding the publication lock exclusively.
    /// No other transaction can commit during that attempt, so it cannot
    /// conflict. Forward progress at the price of all parallelism.
    RunLocked,
}

/// Limits for one call to [`atomically_with`]. Every omitted option is
/// unlimited; the default resolution is [`ConflictResolution::Abort`].
#[derive(Clone, Debug)]
pub struct TxConfig {
    pub max_conflicts: Option<usize>,
    pub max_retries: Option<usize>,
    pub max_retry_wait: Option<Duration>,
    pub resolution: ConflictResolution,
}

impl Default for TxConfig {
    fn default() -> Self {
        TxConfig {
            max_conflicts: None,
            max_retries: None,
            max_retry_wait: None,
            resolution: ConflictResolution::Abort,
        }
    }
}

impl TxConfig {
    pub fn new() -> Self {
        TxConfig::default()
    }

    /// Conflict-driven restarts to tolerate before the resolution applies.
    pub fn max_conflicts(mut self, limit: usize) -> Self {
        self.max_conflicts = Some(limit);
        self
    }

    /// Explicit `retry()` calls to tolerate before giving up.
    pub fn max_retries(mut self, limit: usize) -> Self {
        self.max_retries = Some(limit);
        self
    }

    /// Upper bound on how long any single retry may stay parked.
    pub fn max_retry_wait(mut self, timeout: Duration) -> Self {
        self.max_retry_wait = Some(timeout);
        self
    }

    pub fn resolution(mut self, resolution: ConflictResolution) -> Self {
        self.resolution = resolution;
        self
    }
}

/// True while the calling thread runs inside a transaction.
pub fn in_atomic() -> bool {
    transaction::in_transaction()
}

/// Witness that the calling thread is *not* inside a transaction. APIs
/// that must never run transactionally construct one on entry (or take one
/// as an argument); construction fails with [`TxError::InAtomic`]
/// otherwise. [`inconsistently`](crate::inconsistently) is gated this way.
pub struct NoAtomic(());

impl NoAtomic {
    pub fn new() -> TxResult<Self> {
        if in_atomic() {
            return Err(TxError::InAtomic);
        }
        Ok(NoAtomic(()))
    }
}

/// Runs `op` as an atomic transaction with default (unlimited) settings.
///
/// Reads and writes of [`TVar`](crate::TVar)s inside `op` are isolated:
/// they only become visible to other threads if the whole closure commits,
/// and the closure is restarted from scratch whenever one of the variables
/// it read was changed by another thread in the meantime. `op` must
/// therefore be free of side effects other than its variable accesses, since it
/// can run any number of times.
///
/// Calling `atomically` inside a transaction does not start a second one:
/// the inner call becomes a child of the running transaction and commits or
/// aborts into it.
#[track_caller]
pub fn atomically<T, F>(op: F) -> TxResult<T>
where
    F: Fn(&mut Transaction) -> TxResult<T>,
{
    atomically_with(TxConfig::default(), op)
}

/// [`atomically`] with explicit limits.
#[track_caller]
pub fn atomically_with<T, F>(config: TxConfig, op: F) -> TxResult<T>
where
    F: Fn(&mut Transaction) -> TxResult<T>,
{
    let location = Location::caller();

    if transaction::in_transaction() {
        return transaction::run_child(&op);
    }

    let mut conflicts = 0usize;
    let mut retries = 0usize;
    let mut run_locked = false;

    loop {
        transaction::begin_top(run_locked);
        profile::transaction_start(location.file(), location.line());

        let mut guard = AttemptGuard::new();
        let mut tx = Transaction::new();
        let outcome = op(&mut tx).and_then(|value| transaction::commit_top(&mut tx).map(|_| value));
        guard.disarm();

        match outcome {
            Ok(value) => {
                let after = transaction::end_top_success();
                for hook in after {
                    hook();
                }
                return Ok(value);
            }

            Err(TxError::Conflict) => {
                let fail = transaction::end_top_failure();
                let read_ids: Vec<u64> = fail.reads.keys().copied().collect();
                profile::conflict(fail.started, &read_ids);

                conflicts += 1;
                debug!("conflict #{}, restarting", conflicts);

                if let Some(max) = config.max_conflicts {
                    if conflicts > max {
                        match config.resolution {
                            ConflictResolution::Abort => {
                                return Err(TxError::MaxConflicts(max));
                            }
                            ConflictResolution::RunLocked if run_locked => {
                                // a run-locked attempt cannot conflict; if
                                // we still end up here, give up
                                return Err(TxError::MaxConflicts(max));
                            }
                            ConflictResolution::RunLocked => {
                                debug!("conflict limit reached, next attempt runs locked");
                                run_locked = true;
                            }
                        }
                    }
                }
            }

            Err(TxError::RetrySignal) => {
                let fail = transaction::end_top_failure();
                let read_ids: Vec<u64> = fail.reads.keys().copied().collect();
                profile::conflict(fail.started, &read_ids);

                retries += 1;
                if let Some(max) = config.max_retries {
                    if retries > max {
                        return Err(TxError::MaxRetries(max));
                    }
                }

                let timeout = match (fail.retry_timeout, config.max_retry_wait) {
                    (Some(requested), Some(cap)) => Some(requested.min(cap)),
                    (requested, cap) => requested.or(cap),
                };
                let deadline = timeout.map(|t| Instant::now() + t);

                match retry::wait_on_reads(&fail.reads, deadline) {
                    WaitOutcome::TimedOut => {
                        debug!("retry wait timed out");
                        return Err(TxError::RetryTimeout);
                    }
                    WaitOutcome::Notified | WaitOutcome::AlreadyChanged => {
                        debug!("retry woken, restarting");
                    }
                }
            }

            Err(err) => {
                let _ = transaction::end_top_failure();
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_atomic_outside() {
        assert!(NoAtomic::new().is_ok());
        assert!(!in_atomic());
    }

    #[test]
    fn test_no_atomic_inside() {
        let result = atomically(|_tx| {
            assert!(in_atomic());
            match NoAtomic::new() {
                Err(e) => Ok(e),
                Ok(_) => Err(TxError::Aborted("constructed in transaction".into())),
            }
        });
        assert_eq!(result, Ok(TxError::InAtomic));
    }
}
