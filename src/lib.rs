// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod core;
mod macros;

pub use crate::core::{
    BuildError, Executor, InlineExecutor, OpCost, ParallelSection, SectionHandle, Task,
    ThreadCount, ThreadPool, ThreadPoolBuilder,
};

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn build_pool(degree_of_parallelism: usize) -> ThreadPool {
        ThreadPoolBuilder {
            degree_of_parallelism: ThreadCount::try_from(degree_of_parallelism).unwrap(),
            ..ThreadPoolBuilder::default()
        }
        .build()
        .expect("failed to build the thread pool")
    }

    #[test]
    fn parallel_sum_matches_serial_sum() {
        let pool = build_pool(4);
        let input: Vec<u64> = (0..100_000).map(|x| x * x % 1017).collect();

        let sum = AtomicU64::new(0);
        pool.parallel_for(input.len(), OpCost::new(8.0, 0.0, 10.0), |range| {
            let partial: u64 = input[range].iter().sum();
            sum.fetch_add(partial, Ordering::Relaxed);
        });

        let expected: u64 = input.iter().sum();
        assert_eq!(sum.into_inner(), expected);
    }

    #[test]
    fn try_parallel_for_accepts_both_cost_forms() {
        let pool = build_pool(2);
        let count = AtomicU64::new(0);

        ThreadPool::try_parallel_for(Some(&pool), 1000, 5.0, |range| {
            count.fetch_add(range.len() as u64, Ordering::Relaxed);
        });
        ThreadPool::try_parallel_for(
            Some(&pool),
            1000,
            OpCost::new(16.0, 16.0, 2.0),
            |range| {
                count.fetch_add(range.len() as u64, Ordering::Relaxed);
            },
        );

        assert_eq!(count.into_inner(), 2000);
    }
}
