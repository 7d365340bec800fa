// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Conflict-profiling hooks. The engine reports transaction lifecycle
//! events through this layer to an externally registered recorder; with the
//! `profiling` feature disabled every call compiles to a no-op.

use crate::{transaction::Transaction, tvar::TVar};
use std::{any::Any, time::Instant};

/// Receiver of profiling events. Implemented by the external conflict
/// recorder; the engine only ever calls into it.
///
/// `commit` and `conflict` report the start and end of the attempt together
/// with the ids of the written respectively read variables. The naming
/// callbacks attach human-readable labels to threads, transactions and
/// variables for the recorder's output.
pub trait ConflictRecorder: Send + Sync {
    fn transaction_start(&self, file: &'static str, line: u32);
    fn commit(&self, start: Instant, end: Instant, written: &[u64]);
    fn conflict(&self, start: Instant, end: Instant, read: &[u64]);
    fn thread_named(&self, name: &str);
    fn transaction_named(&self, name: &str);
    fn var_named(&self, var: u64, name: &str);
}

#[cfg(feature = "profiling")]
mod enabled {
    use super::ConflictRecorder;
    use lazy_static::lazy_static;
    use parking_lot::RwLock;
    use std::sync::Arc;

    lazy_static! {
        static ref RECORDER: RwLock<Option<Arc<dyn ConflictRecorder>>> = RwLock::new(None);
    }

    pub fn set(recorder: Arc<dyn ConflictRecorder>) {
        *RECORDER.write() = Some(recorder);
    }

    pub fn with(f: impl FnOnce(&dyn ConflictRecorder)) {
        if let Some(recorder) = RECORDER.read().as_deref() {
            f(recorder);
        }
    }
}

/// Installs the recorder that receives all subsequent events.
#[cfg(feature = "profiling")]
pub fn set_recorder(recorder: std::sync::Arc<dyn ConflictRecorder>) {
    enabled::set(recorder);
}

#[cfg(feature = "profiling")]
pub(crate) fn transaction_start(file: &'static str, line: u32) {
    enabled::with(|r| r.transaction_start(file, line));
}

#[cfg(feature = "profiling")]
pub(crate) fn commit(start: Instant, written: &[u64]) {
    let end = Instant::now();
    enabled::with(|r| r.commit(start, end, written));
}

#[cfg(feature = "profiling")]
pub(crate) fn conflict(start: Instant, read: &[u64]) {
    let end = Instant::now();
    enabled::with(|r| r.conflict(start, end, read));
}

/// Labels the calling thread in profiling output.
#[cfg(feature = "profiling")]
pub fn name_thread(name: &str) {
    enabled::with(|r| r.thread_named(name));
}

/// Labels the running transaction in profiling output.
#[cfg(feature = "profiling")]
pub fn name_transaction(tx: &mut Transaction, name: &str) {
    let _ = tx;
    enabled::with(|r| r.transaction_named(name));
}

/// Labels a variable in profiling output.
#[cfg(feature = "profiling")]
pub fn name_var<T>(var: &TVar<T>, name: &str)
where
    T: Any + Send + Sync + Clone,
{
    let id = var.core().id();
    enabled::with(|r| r.var_named(id, name));
}

#[cfg(not(feature = "profiling"))]
pub fn set_recorder(_recorder: std::sync::Arc<dyn ConflictRecorder>) {}

#[cfg(not(feature = "profiling"))]
#[inline(always)]
pub(crate) fn transaction_start(_file: &'static str, _line: u32) {}

#[cfg(not(feature = "profiling"))]
#[inline(always)]
pub(crate) fn commit(_start: Instant, _written: &[u64]) {}

#[cfg(not(feature = "profiling"))]
#[inline(always)]
pub(crate) fn conflict(_start: Instant, _read: &[u64]) {}

#[cfg(not(feature = "profiling"))]
#[inline(always)]
pub fn name_thread(_name: &str) {}

#[cfg(not(feature = "profiling"))]
#[inline(always)]
pub fn name_transaction(_tx: &mut Transaction, _name: &str) {}

#[cfg(not(feature = "profiling"))]
#[inline(always)]
pub fn name_var<T>(_var: &TVar<T>, _name: &str)
where
    T: Any + Send + Sync + Clone,
{
}
