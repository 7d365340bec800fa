// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::{sync::Arc, thread};
use stronghold_stm::{atomically, TVar};

fn bench_increment(c: &mut Criterion) {
    let counter = TVar::new(0usize);

    c.bench_function("uncontended_increment", |b| {
        b.iter(|| {
            atomically(|tx| {
                let value = counter.get(tx)?;
                counter.set(black_box(value + 1), tx)
            })
            .expect("increment failed")
        })
    });
}

fn bench_read_only(c: &mut Criterion) {
    let var = TVar::new(42usize);

    c.bench_function("read_only", |b| {
        b.iter(|| atomically(|tx| var.get(tx)).expect("read failed"))
    });
}

fn bench_contended_increment(c: &mut Criterion) {
    c.bench_function("contended_increment_4", |b| {
        b.iter(|| {
            let counter = Arc::new(TVar::new(0usize));
            let mut handles = Vec::new();
            for _ in 0..4 {
                let counter = counter.clone();
                handles.push(thread::spawn(move || {
                    for _ in 0..100 {
                        atomically(|tx| {
                            let value = counter.get(tx)?;
                            counter.set(value + 1, tx)
                        })
                        .expect("increment failed");
                    }
                }));
            }
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(counter.get_readonly(), Ok(400));
        })
    });
}

criterion_group!(
    benches,
    bench_increment,
    bench_read_only,
    bench_contended_increment
);
criterion_main!(benches);
