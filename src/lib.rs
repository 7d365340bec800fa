// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Stronghold Software Transactional Memory
//!
//! This crate implements software transactional memory (STM) over versioned
//! transactional variables. Shared state lives in [`TVar`]s; threads access
//! them by composing reads and writes into closures that run under
//! [`atomically`] and either commit wholesale or restart.
//!
//! ## Objective
//! ---
//! Locks compose badly: the sequence of two individually thread-safe
//! actions is not thread-safe, and stacking more locks on top invites
//! deadlocks. A transaction instead records its reads and pending writes in
//! a per-thread log, validates the reads at commit time and publishes all
//! writes under short per-variable locks. If another thread got there
//! first, it throws the attempt away and runs the closure again.
//!
//! ## Algorithm
//! ---
//! Every variable carries a version that increases with each committed
//! write. A read captures a `(value, version)` snapshot; repeated reads are
//! served from the snapshot, so a transaction observes a stable view. At
//! commit, the engine locks the involved variables in a deterministic order
//! (shared for reads, upgradable-then-exclusive for writes), checks each
//! snapshot against the variable's current version, publishes the pending
//! values with bumped versions and wakes any transactions parked in
//! [`retry`](retry()) on the written variables.
//!
//! Transactions nest: an [`atomically`] call inside a transaction becomes a
//! child that commits into its parent, or aborts without disturbing it.
//! Conflict counts, explicit retries and retry waits can be bounded with
//! [`TxConfig`]; a transaction over the conflict limit can either fail with
//! an error or make one final attempt with all other commits locked out.
//!
//! ## Example
//! ---
//! ```
//! use std::{sync::Arc, thread};
//! use stronghold_stm::{atomically, retry, TVar};
//!
//! let ready = Arc::new(TVar::new(false));
//! let payload = Arc::new(TVar::new(0usize));
//!
//! let (r, p) = (ready.clone(), payload.clone());
//! let producer = thread::spawn(move || {
//!     atomically(|tx| {
//!         p.set(42, tx)?;
//!         r.set(true, tx)
//!     })
//! });
//!
//! let value = atomically(|tx| {
//!     if !ready.get(tx)? {
//!         return retry(tx);
//!     }
//!     payload.get(tx)
//! });
//!
//! producer.join().unwrap().unwrap();
//! assert_eq!(value, Ok(42));
//! ```
//!
//! ## Rules
//! ---
//! - Closures must be idempotent apart from their variable accesses; they
//!   can run any number of times before they commit.
//! - Values are copied in and out of variables. Do not reach for inner
//!   mutability inside a stored `Arc`; the transaction cannot see or
//!   isolate such writes.
//! - Do not mix [`TVar`]s with ambient locks; a lock held across a
//!   restarting closure is a deadlock waiting to happen.

pub mod ctrl;
pub mod errors;
pub mod inconsistent;
pub mod local;
pub mod profile;
pub mod retry;
pub mod transaction;
pub mod tvar;

pub use ctrl::{atomically, atomically_with, in_atomic, ConflictResolution, NoAtomic, TxConfig};
pub use errors::{TxError, TxResult};
pub use inconsistent::{inconsistently, Inconsistent};
pub use local::{TLocal, TLocalFlag};
pub use profile::ConflictRecorder;
pub use retry::{retry, retry_for};
pub use transaction::Transaction;
pub use tvar::TVar;
