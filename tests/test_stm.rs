// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use rand::{distributions::Bernoulli, prelude::Distribution};
use std::{
    collections::HashSet,
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};
use stronghold_stm::{
    atomically, atomically_with, retry, retry_for, ConflictResolution, TVar, TxConfig, TxError,
    TxResult,
};
use threadpool::ThreadPool;

#[allow(unused_imports)]
use log::*;

#[test]
fn test_stm_basic() {
    #[cfg(feature = "verbose")]
    env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .init();

    let bank_alice = TVar::new(10usize);
    let bank_bob = TVar::new(100usize);
    let bank_charly = TVar::new(0usize);

    let transfer_bob_charly = 30;
    let alice_bonus = 40;

    let result = atomically(|tx| {
        let amt_alice = bank_alice.get(tx)?;
        let amt_bob = bank_bob.get(tx)?;
        let amt_charly = bank_charly.get(tx)?;

        bank_alice.set(amt_alice + alice_bonus, tx)?;
        bank_bob.set(amt_bob - transfer_bob_charly, tx)?;
        bank_charly.set(amt_charly + transfer_bob_charly, tx)?;

        Ok(())
    });

    assert!(result.is_ok(), "Transaction failed");

    assert_eq!(bank_alice.get_readonly(), Ok(50));
    assert_eq!(bank_bob.get_readonly(), Ok(70));
    assert_eq!(bank_charly.get_readonly(), Ok(30));
}

#[test]
fn test_increment_race() {
    const THREADS: usize = 10;
    const INCREMENTS: usize = 1000;

    let counter = Arc::new(TVar::new(0usize));
    let pool = ThreadPool::new(THREADS);

    for _ in 0..THREADS {
        let counter = counter.clone();
        pool.execute(move || {
            for _ in 0..INCREMENTS {
                atomically(|tx| {
                    let value = counter.get(tx)?;
                    counter.set(value + 1, tx)
                })
                .expect("increment transaction failed");
            }
        });
    }

    // synchronize all running worker threads
    pool.join();

    assert_eq!(counter.get_readonly(), Ok(THREADS * INCREMENTS));
}

#[test]
fn test_stm_threaded_mixed_load() {
    const ENTRIES: usize = 100;

    // bernoulli distribution over read-only vs read/write transactions
    let distribution = Bernoulli::new(0.7).unwrap();

    let expected: HashSet<String> = (0..ENTRIES).map(|e| format!("{:04}", e)).collect();

    let set: Arc<TVar<HashSet<String>>> = Arc::new(TVar::new(HashSet::new()));
    let pool = ThreadPool::new(8);

    for value in expected.iter().cloned() {
        let set = set.clone();
        let read_first = distribution.sample(&mut rand::thread_rng());

        pool.execute(move || {
            if read_first {
                let size = atomically(|tx| Ok(set.get(tx)?.len()));
                assert!(size.is_ok(), "read-only transaction failed");
            }

            atomically(|tx| {
                let mut inner = set.get(tx)?;
                inner.insert(value.clone());
                set.set(inner, tx)
            })
            .expect("insert transaction failed");
        });
    }

    pool.join();

    assert_eq!(set.get_readonly(), Ok(expected));
}

#[test]
fn test_retry_on_condition() {
    let flag = Arc::new(TVar::new(false));
    let value = Arc::new(TVar::new(0usize));

    let (f, v) = (flag.clone(), value.clone());
    let consumer = thread::spawn(move || {
        atomically(|tx| {
            if !f.get(tx)? {
                return retry(tx);
            }
            v.get(tx)
        })
    });

    // give the consumer a chance to park first
    thread::sleep(Duration::from_millis(50));

    atomically(|tx| {
        value.set(42, tx)?;
        flag.set(true, tx)
    })
    .expect("producer transaction failed");

    assert_eq!(consumer.join().unwrap(), Ok(42));
}

#[test]
fn test_conflict_limit_aborts() {
    let x = Arc::new(TVar::new(0usize));

    let (req_tx, req_rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let interferer = {
        let x = x.clone();
        thread::spawn(move || {
            while req_rx.recv().is_ok() {
                atomically(|tx| x.apply(tx, |v| v + 1)).expect("interfering write failed");
                if done_tx.send(()).is_err() {
                    break;
                }
            }
        })
    };

    let config = TxConfig::new().max_conflicts(2);
    let result: TxResult<()> = atomically_with(config, |tx| {
        let value = x.get(tx)?;
        // have another commit slip in between our read and our commit
        req_tx.send(()).ok();
        done_rx.recv_timeout(Duration::from_millis(500)).ok();
        x.set(value + 1, tx)
    });

    assert_eq!(result, Err(TxError::MaxConflicts(2)));

    drop(req_tx);
    interferer.join().unwrap();
}

#[test]
fn test_conflict_limit_runs_locked() {
    let x = Arc::new(TVar::new(0usize));

    let (req_tx, req_rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let interferer = {
        let x = x.clone();
        thread::spawn(move || {
            while req_rx.recv().is_ok() {
                atomically(|tx| x.apply(tx, |v| v + 1)).expect("interfering write failed");
                if done_tx.send(()).is_err() {
                    break;
                }
            }
        })
    };

    let config = TxConfig::new()
        .max_conflicts(2)
        .resolution(ConflictResolution::RunLocked);
    let result = atomically_with(config, |tx| {
        let value = x.get(tx)?;
        req_tx.send(()).ok();
        // under writer exclusion the interferer cannot commit in time and
        // this attempt goes through
        done_rx.recv_timeout(Duration::from_millis(100)).ok();
        x.set(value + 1, tx)?;
        Ok(value)
    });

    assert!(result.is_ok(), "run-locked attempt should have committed");

    drop(req_tx);
    interferer.join().unwrap();
}

#[test]
fn test_retry_timeout() {
    let x = TVar::new(0usize);

    let started = Instant::now();
    let result: TxResult<usize> = atomically(|tx| {
        x.get(tx)?;
        retry_for(tx, Duration::from_millis(50))
    });

    assert_eq!(result, Err(TxError::RetryTimeout));
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_retry_wait_cap() {
    let x = TVar::new(0usize);

    let config = TxConfig::new().max_retry_wait(Duration::from_millis(50));
    let started = Instant::now();
    let result: TxResult<usize> = atomically_with(config, |tx| {
        x.get(tx)?;
        retry(tx)
    });

    assert_eq!(result, Err(TxError::RetryTimeout));
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_nested_abort_isolation() {
    let x = TVar::new(0usize);

    let result = atomically(|tx| {
        x.set(1, tx)?;

        let aborted: TxResult<()> = atomically(|child| {
            x.set(99, child)?;
            Err(TxError::Aborted("abandon the child".into()))
        });
        assert!(aborted.is_err());

        x.get(tx)
    });

    assert_eq!(result, Ok(1));
    assert_eq!(x.get_readonly(), Ok(1));
}

#[test]
fn test_nested_commit_merges() {
    let x = TVar::new(0usize);
    let y = TVar::new(0usize);

    let result = atomically(|tx| {
        x.set(1, tx)?;

        atomically(|child| {
            let seen = x.get(child)?;
            y.set(seen + 1, child)?;
            x.set(seen + 1, child)
        })?;

        Ok((x.get(tx)?, y.get(tx)?))
    });

    assert_eq!(result, Ok((2, 2)));
    assert_eq!(x.get_readonly(), Ok(2));
    assert_eq!(y.get_readonly(), Ok(2));
}

#[test]
fn test_no_lost_update() {
    let c = TVar::new(0usize);

    atomically(|tx| c.apply(tx, |v| v + 1)).unwrap();
    let second = atomically(|tx| {
        let value = c.get(tx)?;
        c.set(value + 1, tx)?;
        Ok(value)
    });

    // the second transaction started after the first returned and must
    // observe its write
    assert_eq!(second, Ok(1));
    assert_eq!(c.get_readonly(), Ok(2));
}
