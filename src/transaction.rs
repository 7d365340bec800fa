// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The per-thread transaction record and the commit engine.
//!
//! A record exists from transaction start to transaction end and is strictly
//! thread-local. Closures receive a [`Transaction`] token; the token carries
//! no state of its own but proves that the thread has an active record and
//! routes every operation to the innermost one, which is what makes nested
//! transactions transparent to user code.

use crate::{
    ctrl,
    errors::{TxError, TxResult},
    profile,
    retry::WaitToken,
    tvar::{CoreData, Payload, Snapshot, VarCore},
};
use log::*;
use parking_lot::{
    RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard,
};
use std::{
    any::Any,
    cell::RefCell,
    collections::{BTreeMap, BTreeSet, HashMap},
    marker::PhantomData,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

/// Bounded wait for upgrading a write-set cell to exclusive. Two commits
/// upgrading against each other's read locks would otherwise wait forever;
/// an upgrade that cannot complete within the grace period is a conflict.
const UPGRADE_GRACE: Duration = Duration::from_millis(10);

pub(crate) type HookFn = Box<dyn FnOnce()>;
pub(crate) type BeforeCommitFn = Box<dyn FnOnce(&mut Transaction) -> TxResult<()>>;

/// A cell the transaction has read, with the snapshot the read produced.
/// Only a weak handle to the core is kept: the record never extends a
/// variable's lifetime.
pub(crate) struct ReadEntry {
    pub(crate) core: Weak<VarCore>,
    pub(crate) snapshot: Snapshot,
}

/// A cell the transaction intends to write, with the pending payload.
pub(crate) struct WriteEntry {
    core: Weak<VarCore>,
    value: Payload,
}

/// The transaction record. `parent` links nested records into a stack whose
/// innermost element sits in the thread-local slot.
pub(crate) struct TxData {
    depth: usize,
    parent: Option<Box<TxData>>,
    reads: BTreeMap<u64, ReadEntry>,
    writes: BTreeMap<u64, WriteEntry>,
    locals: HashMap<u64, Box<dyn Any>>,
    before_commit: Vec<BeforeCommitFn>,
    after_commit: Vec<HookFn>,
    on_fail: Vec<HookFn>,
    read_lock_depth: usize,
    commit_guard: Option<RwLockWriteGuard<'static, ()>>,
    run_locked: bool,
    retry_timeout: Option<Duration>,
    started: Instant,
}

thread_local! {
    static CURRENT: RefCell<Option<Box<TxData>>> = RefCell::new(None);
}

fn with_current<R>(f: impl FnOnce(&mut TxData) -> R) -> R {
    CURRENT.with(|cell| {
        let mut slot = cell.borrow_mut();
        let data = slot
            .as_mut()
            .expect("transaction operation outside of an active transaction");
        f(data)
    })
}

/// Walks the nesting stack down to the top-level record. The transaction-
/// wide read lock lives there so that it spans the whole transaction no
/// matter which nesting level acquired it.
fn top_mut(mut data: &mut TxData) -> &mut TxData {
    while data.parent.is_some() {
        data = data
            .parent
            .as_deref_mut()
            .expect("parent link vanished while walking the nesting stack");
    }
    data
}

pub(crate) fn in_transaction() -> bool {
    CURRENT.with(|cell| cell.borrow().is_some())
}

/// Handle to the thread's active transaction, passed to every transactional
/// closure. Deliberately `!Send`: records are strictly per-thread.
pub struct Transaction {
    _not_send: PhantomData<*mut ()>,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        Transaction {
            _not_send: PhantomData,
        }
    }

    /// Validates every snapshot the transaction holds, across all nesting
    /// levels. A stale snapshot conflicts immediately; the transaction
    /// driver restarts the transaction. Commit performs the same check, so
    /// calling this is only worthwhile inside long-running closures.
    pub fn validate(&mut self) -> TxResult<()> {
        with_current(|data| {
            let mut level = Some(&*data);
            while let Some(d) = level {
                for entry in d.reads.values() {
                    if let Some(core) = entry.core.upgrade() {
                        if core.version() != entry.snapshot.version {
                            return Err(TxError::Conflict);
                        }
                    }
                }
                level = d.parent.as_deref();
            }
            Ok(())
        })
    }

    /// Acquires the transaction-wide read lock: while held, no other
    /// transaction can publish, so a sequence of reads observes a mutually
    /// consistent state without conflicting at commit. Reference-counted;
    /// any depth left over when the top-level transaction ends is released
    /// then.
    pub fn read_lock(&mut self) {
        with_current(|data| {
            let top = top_mut(data);
            top.read_lock_depth += 1;
            if top.commit_guard.is_none() {
                top.commit_guard = Some(ctrl::publication_lock().write());
            }
        })
    }

    /// Releases one level of the transaction-wide read lock.
    pub fn read_unlock(&mut self) {
        with_current(|data| {
            let top = top_mut(data);
            if top.read_lock_depth == 0 {
                warn!("read_unlock without a matching read_lock");
                return;
            }
            top.read_lock_depth -= 1;
            if top.read_lock_depth == 0 && !top.run_locked {
                top.commit_guard = None;
            }
        })
    }

    /// True while the transaction-wide read lock is held.
    pub fn is_read_locked(&self) -> bool {
        with_current(|data| top_mut(data).read_lock_depth > 0)
    }

    /// Registers a hook that runs just before the top-level transaction
    /// starts to commit. The hook may read and write variables; writes it
    /// performs are part of the commit. Hooks registered in a nested
    /// transaction are spliced onto the parent when the child commits and
    /// discarded when it aborts.
    pub fn before_commit<F>(&mut self, hook: F)
    where
        F: FnOnce(&mut Transaction) -> TxResult<()> + 'static,
    {
        with_current(|data| data.before_commit.push(Box::new(hook)))
    }

    /// Registers a hook that runs after the top-level transaction has
    /// committed. The transaction record is gone by then; the hook cannot
    /// undo the commit.
    pub fn after<F>(&mut self, hook: F)
    where
        F: FnOnce() + 'static,
    {
        with_current(|data| data.after_commit.push(Box::new(hook)))
    }

    /// Registers a hook that runs whenever a top-level attempt fails: on
    /// conflict, on retry, and on user aborts. Each attempt registers its
    /// own hooks, so a restarted closure starts with an empty list.
    pub fn on_fail<F>(&mut self, hook: F)
    where
        F: FnOnce() + 'static,
    {
        with_current(|data| data.on_fail.push(Box::new(hook)))
    }

    pub(crate) fn set_retry_timeout(&mut self, timeout: Duration) {
        with_current(|data| data.retry_timeout = Some(timeout))
    }
}

/// Innermost-outward lookup: pending write first, then cached snapshot, per
/// nesting level. A miss reads the cell under its read lock and records the
/// snapshot in the innermost record.
pub(crate) fn var_get(core: &Arc<VarCore>) -> Payload {
    with_current(|data| {
        let id = core.id();

        let mut level = Some(&*data);
        while let Some(d) = level {
            if let Some(write) = d.writes.get(&id) {
                return write.value.clone();
            }
            if let Some(read) = d.reads.get(&id) {
                return read.snapshot.value.clone();
            }
            level = d.parent.as_deref();
        }

        trace!("recording snapshot of var {}", id);
        let snapshot = core.snapshot();
        let value = snapshot.value.clone();
        data.reads.insert(
            id,
            ReadEntry {
                core: Arc::downgrade(core),
                snapshot,
            },
        );
        value
    })
}

/// Inserts or replaces the pending value in the innermost record. A pending
/// entry of an outer level is shadowed, not mutated, so that a child abort
/// leaves the parent's pending value intact.
pub(crate) fn var_set(core: &Arc<VarCore>, value: Payload) {
    with_current(|data| {
        let id = core.id();
        match data.writes.get_mut(&id) {
            Some(entry) => entry.value = value,
            None => {
                trace!("recording pending write for var {}", id);
                data.writes.insert(
                    id,
                    WriteEntry {
                        core: Arc::downgrade(core),
                        value,
                    },
                );
            }
        }
    })
}

/// On-demand validation of a single cell. Cells that were never read (blind
/// writes included) have nothing to validate.
pub(crate) fn var_validate(core: &Arc<VarCore>) -> TxResult<()> {
    with_current(|data| {
        let id = core.id();
        let mut level = Some(&*data);
        while let Some(d) = level {
            if let Some(read) = d.reads.get(&id) {
                if core.version() != read.snapshot.version {
                    return Err(TxError::Conflict);
                }
                return Ok(());
            }
            level = d.parent.as_deref();
        }
        Ok(())
    })
}

pub(crate) fn local_lookup<R>(key: u64, f: impl FnOnce(&dyn Any) -> R) -> Option<R> {
    with_current(|data| {
        let mut level = Some(&*data);
        while let Some(d) = level {
            if let Some(value) = d.locals.get(&key) {
                return Some(f(value.as_ref()));
            }
            level = d.parent.as_deref();
        }
        None
    })
}

pub(crate) fn local_insert(key: u64, value: Box<dyn Any>) {
    with_current(|data| {
        data.locals.insert(key, value);
    })
}

/// Installs a fresh top-level record in the thread-local slot. A run-locked
/// attempt takes the publication lock exclusively up front, which keeps
/// every other commit out for the whole attempt.
pub(crate) fn begin_top(run_locked: bool) {
    let commit_guard = run_locked.then(|| ctrl::publication_lock().write());
    CURRENT.with(|cell| {
        let mut slot = cell.borrow_mut();
        debug_assert!(slot.is_none(), "top-level transaction while one is active");
        *slot = Some(Box::new(TxData {
            depth: 0,
            parent: None,
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
            locals: HashMap::new(),
            before_commit: Vec::new(),
            after_commit: Vec::new(),
            on_fail: Vec::new(),
            read_lock_depth: 0,
            commit_guard,
            run_locked,
            retry_timeout: None,
            started: Instant::now(),
        }));
    });
}

fn begin_child() {
    CURRENT.with(|cell| {
        let mut slot = cell.borrow_mut();
        let parent = slot
            .take()
            .expect("child transaction without an active parent");
        let depth = parent.depth + 1;
        let started = parent.started;
        *slot = Some(Box::new(TxData {
            depth,
            parent: Some(parent),
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
            locals: HashMap::new(),
            before_commit: Vec::new(),
            after_commit: Vec::new(),
            on_fail: Vec::new(),
            read_lock_depth: 0,
            commit_guard: None,
            run_locked: false,
            retry_timeout: None,
            started,
        }));
    });
}

/// Merges the child record into its parent: reads where the parent has
/// none, writes overwriting, hooks spliced in registration order, locals
/// overwriting. The child's effects become the parent's, as if the parent
/// had performed them directly.
fn commit_child() {
    CURRENT.with(|cell| {
        let mut slot = cell.borrow_mut();
        let child = slot.take().expect("child commit without an active record");
        let TxData {
            parent,
            reads,
            writes,
            locals,
            before_commit,
            after_commit,
            on_fail,
            ..
        } = *child;
        let mut parent = parent.expect("child commit without a parent record");

        for (id, read) in reads {
            parent.reads.entry(id).or_insert(read);
        }
        for (id, write) in writes {
            parent.writes.insert(id, write);
        }
        parent.locals.extend(locals);
        parent.before_commit.extend(before_commit);
        parent.after_commit.extend(after_commit);
        parent.on_fail.extend(on_fail);

        *slot = Some(parent);
    });
}

/// Drops the child record. Writes, hooks and locals vanish. When the child
/// aborted because of a retry, its reads (and retry deadline) are folded
/// into the parent: the wait that follows must cover every cell the whole
/// transaction has read, or a wake-up could be missed.
fn abort_child(fold_retry_state: bool) {
    CURRENT.with(|cell| {
        let mut slot = cell.borrow_mut();
        let child = slot.take().expect("child abort without an active record");
        let TxData {
            parent,
            reads,
            retry_timeout,
            ..
        } = *child;
        let mut parent = parent.expect("child abort without a parent record");

        if fold_retry_state {
            for (id, read) in reads {
                parent.reads.entry(id).or_insert(read);
            }
            parent.retry_timeout = retry_timeout.or(parent.retry_timeout);
        }

        *slot = Some(parent);
    });
}

struct ChildGuard {
    armed: bool,
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if self.armed {
            abort_child(false);
        }
    }
}

/// Runs `op` as a child of the currently active transaction. Children do
/// not commit to memory and do not re-enter the conflict control loop; a
/// conflict or retry raised here aborts outward to the top level.
pub(crate) fn run_child<T, F>(op: &F) -> TxResult<T>
where
    F: Fn(&mut Transaction) -> TxResult<T>,
{
    begin_child();
    let mut guard = ChildGuard { armed: true };
    let mut tx = Transaction::new();
    let result = op(&mut tx);
    guard.armed = false;

    match result {
        Ok(value) => {
            commit_child();
            Ok(value)
        }
        Err(err) => {
            abort_child(matches!(err, TxError::RetrySignal));
            Err(err)
        }
    }
}

/// What a failed top-level attempt leaves behind: the read set (for retry
/// registration and conflict profiling), the retry deadline requested by the
/// closure, and the attempt start time.
pub(crate) struct FailState {
    pub(crate) reads: BTreeMap<u64, ReadEntry>,
    pub(crate) retry_timeout: Option<Duration>,
    pub(crate) started: Instant,
}

/// Finishes a successful top-level transaction. The record, including locals and
/// any residual transaction-wide read lock, is dropped before the returned
/// after-commit hooks run.
pub(crate) fn end_top_success() -> Vec<HookFn> {
    CURRENT.with(|cell| {
        let mut slot = cell.borrow_mut();
        let mut data = slot.take().expect("no active transaction to finish");
        debug_assert!(data.parent.is_none());
        std::mem::take(&mut data.after_commit)
    })
}

/// Finishes a failed top-level attempt: pops the record, runs the on-fail
/// hooks in registration order, and hands the leftover state to the driver.
pub(crate) fn end_top_failure() -> FailState {
    let (hooks, state) = CURRENT.with(|cell| {
        let mut slot = cell.borrow_mut();
        let mut data = slot.take().expect("no active transaction to abort");
        debug_assert!(data.parent.is_none());
        let hooks = std::mem::take(&mut data.on_fail);
        let state = FailState {
            reads: std::mem::take(&mut data.reads),
            retry_timeout: data.retry_timeout,
            started: data.started,
        };
        (hooks, state)
    });
    for hook in hooks {
        hook();
    }
    state
}

/// Pops the record and runs on-fail hooks when an attempt unwinds. A panic
/// that crossed `atomically` must not leave the thread marked as
/// transactional.
pub(crate) struct AttemptGuard {
    armed: bool,
}

impl AttemptGuard {
    pub(crate) fn new() -> Self {
        AttemptGuard { armed: true }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if self.armed && in_transaction() {
            let _ = end_top_failure();
        }
    }
}

/// Commits the top-level transaction: before-commit hooks, then lock,
/// validate and publish, then wake retry waiters parked on the written
/// cells.
pub(crate) fn commit_top(tx: &mut Transaction) -> TxResult<()> {
    run_before_commit(tx)?;
    let woken = with_current(|data| publish(data))?;
    for waiter in &woken {
        waiter.notify();
    }
    Ok(())
}

/// Drains the before-commit hook list until it stays empty; hooks may
/// register further hooks, and those must run within the same commit.
fn run_before_commit(tx: &mut Transaction) -> TxResult<()> {
    loop {
        let hooks = with_current(|data| std::mem::take(&mut data.before_commit));
        if hooks.is_empty() {
            return Ok(());
        }
        for hook in hooks {
            hook(tx)?;
        }
    }
}

struct CommitEntry {
    id: u64,
    core: Arc<VarCore>,
    pending: Option<Payload>,
    expected: Option<u64>,
}

enum CellGuard<'a> {
    Shared(RwLockReadGuard<'a, CoreData>),
    Upgradable(RwLockUpgradableReadGuard<'a, CoreData>),
    Exclusive(RwLockWriteGuard<'a, CoreData>),
}

impl CellGuard<'_> {
    fn version(&self) -> u64 {
        match self {
            CellGuard::Shared(g) => g.version,
            CellGuard::Upgradable(g) => g.version,
            CellGuard::Exclusive(g) => g.version,
        }
    }
}

/// The locking heart of the commit.
///
/// Guards are acquired in ascending id order (upgradable for cells about
/// to be written, shared for the rest) and held continuously through
/// validation, upgrade and publication, so no other commit can slip a write
/// in between. Publication itself holds the process-wide publication lock
/// shared; disjoint commits run in parallel, while a transaction-wide read
/// lock (held exclusively) keeps all of them out.
fn publish(data: &TxData) -> TxResult<Vec<Arc<WaitToken>>> {
    debug_assert_eq!(data.depth, 0, "publish below the top level");

    let _publication = if data.commit_guard.is_none() {
        Some(ctrl::publication_lock().read())
    } else {
        None
    };

    let ids: BTreeSet<u64> = data.reads.keys().chain(data.writes.keys()).copied().collect();
    let mut entries: Vec<CommitEntry> = Vec::with_capacity(ids.len());
    for id in ids {
        let read = data.reads.get(&id);
        let write = data.writes.get(&id);
        let weak = match write.map(|w| &w.core).or_else(|| read.map(|r| &r.core)) {
            Some(weak) => weak,
            None => continue,
        };
        // a core that no other handle keeps alive can neither conflict nor
        // be observed; skip it
        let core = match weak.upgrade() {
            Some(core) => core,
            None => continue,
        };
        entries.push(CommitEntry {
            id,
            core,
            pending: write.map(|w| w.value.clone()),
            expected: read.map(|r| r.snapshot.version),
        });
    }

    let mut guards: Vec<Option<CellGuard<'_>>> = Vec::with_capacity(entries.len());
    for entry in &entries {
        guards.push(Some(match entry.pending {
            Some(_) => CellGuard::Upgradable(entry.core.data.upgradable_read()),
            None => CellGuard::Shared(entry.core.data.read()),
        }));
    }

    for (entry, guard) in entries.iter().zip(guards.iter()) {
        if let (Some(expected), Some(guard)) = (entry.expected, guard.as_ref()) {
            if guard.version() != expected {
                debug!(
                    "validation failed for var {}: snapshot {} behind {}",
                    entry.id,
                    expected,
                    guard.version()
                );
                return Err(TxError::Conflict);
            }
        }
    }

    for (i, entry) in entries.iter().enumerate() {
        if entry.pending.is_none() {
            continue;
        }
        if let Some(CellGuard::Upgradable(guard)) = guards[i].take() {
            match RwLockUpgradableReadGuard::try_upgrade_for(guard, UPGRADE_GRACE) {
                Ok(exclusive) => guards[i] = Some(CellGuard::Exclusive(exclusive)),
                Err(_) => {
                    debug!("upgrade contention on var {}", entry.id);
                    return Err(TxError::Conflict);
                }
            }
        }
    }

    let mut written: Vec<u64> = Vec::with_capacity(data.writes.len());
    let mut woken: Vec<Arc<WaitToken>> = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        if let Some(value) = &entry.pending {
            if let Some(CellGuard::Exclusive(guard)) = guards[i].as_mut() {
                guard.version += 1;
                guard.value = value.clone();
                written.push(entry.id);
                woken.extend(entry.core.take_waiters());
            }
        }
    }

    drop(guards);
    drop(_publication);

    debug!("committed {} writes", written.len());
    profile::commit(data.started, &written);

    Ok(woken)
}
