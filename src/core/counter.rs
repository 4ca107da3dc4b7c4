// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A sharded loop counter distributing iterations between worker threads.
//!
//! The iteration space of a loop is divided (perhaps unevenly) between the
//! shards. Each thread has a home shard (perhaps not uniquely to it), and it
//! claims iterations via atomic operations on its home shard, then proceeds
//! through the other shards until all iterations are complete. Compared with
//! a single atomic counter this reduces contention for loops with many
//! short-running iterations, and starting at the home shard promotes affinity
//! between the work a thread performs in one loop and in the next.

use crossbeam_utils::CachePadded;
#[cfg(feature = "log_scheduling")]
use crate::macros::log_trace;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache-line granularity assumed for shard isolation.
const CACHE_LINE_BYTES: usize = 64;

/// Maximum number of shards, limiting the space needed for a [`LoopCounter`]
/// and the work needed to confirm that all shards are complete at the end of
/// a loop.
pub(crate) const MAX_SHARDS: usize = 8;

/// One shard of the iteration space, claimed from via fetch-add.
#[derive(Default)]
struct LoopCounterShard {
    /// Next iteration to claim. May overshoot `end` once the shard drains.
    next: AtomicU64,
    /// End of the shard's range (exclusive).
    end: u64,
}

// Each shard must occupy its own cache line, so that claims on different
// shards never contend for the same line.
const _: () = assert!(std::mem::align_of::<CachePadded<LoopCounterShard>>() >= CACHE_LINE_BYTES);

/// A sharded counter over the iteration space `[0, num_iterations)`.
///
/// Stack-scoped to a single scheduling call: the pool's dispatch/join
/// brackets every access by the worker threads.
pub(crate) struct LoopCounter {
    shards: [CachePadded<LoopCounterShard>; MAX_SHARDS],
    num_shards: usize,
}

impl LoopCounter {
    /// Creates a counter over `[0, num_iterations)`, dividing the space into
    /// shards of whole `block_size` blocks. If the space does not divide
    /// evenly, the final shard is left uneven.
    pub fn new(num_iterations: u64, degree_of_parallelism: u64, block_size: u64) -> Self {
        debug_assert!(block_size >= 1);
        debug_assert!(degree_of_parallelism >= 1);
        let num_shards = Self::num_shards_for(num_iterations, degree_of_parallelism, block_size);

        let num_blocks = num_iterations / block_size;
        let blocks_per_shard = num_blocks / num_shards as u64;
        let iterations_per_shard = blocks_per_shard * block_size;

        let shards = std::array::from_fn(|shard| {
            let shard = shard as u64;
            let (next, end) = if shard < num_shards as u64 {
                let is_last_shard = shard == num_shards as u64 - 1;
                (
                    shard * iterations_per_shard,
                    if is_last_shard {
                        num_iterations
                    } else {
                        (shard + 1) * iterations_per_shard
                    },
                )
            } else {
                // Unused shard, starts out drained.
                (0, 0)
            };
            CachePadded::new(LoopCounterShard {
                // Initialize with a relaxed store; synchronization with worker
                // threads is provided via the thread pool.
                next: AtomicU64::new(next),
                end,
            })
        });

        Self { shards, num_shards }
    }

    /// Number of shards for a given loop: at least one block of work per
    /// shard, at most [`MAX_SHARDS`], and no more shards than threads: at
    /// low thread counts each of N threads gets its own shard representing
    /// 1/N of the work.
    fn num_shards_for(num_iterations: u64, degree_of_parallelism: u64, block_size: u64) -> usize {
        let num_blocks = num_iterations / block_size;
        let num_shards = num_blocks.clamp(1, MAX_SHARDS as u64);
        num_shards.min(degree_of_parallelism) as usize
    }

    /// Allocates a work item to a home shard, from which it starts claiming
    /// iterations.
    ///
    /// The work-item index is stable across loops on the same pool, so the
    /// worker that ran a given range of iterations in one loop tends to run
    /// the same range in the next, which helps operators issuing a series
    /// of short loops over the same data.
    pub fn home_shard(&self, worker_index: usize) -> usize {
        worker_index % self.num_shards
    }

    /// Attempts to claim up to `block_size` iterations, starting from
    /// `*current_shard` and walking the shards round-robin until back at
    /// `home_shard`.
    ///
    /// Returns the claimed range, or [`None`] once all iterations have been
    /// claimed. The returned range never extends past its shard's end.
    pub fn claim_iterations(
        &self,
        home_shard: usize,
        current_shard: &mut usize,
        block_size: u64,
    ) -> Option<Range<u64>> {
        debug_assert!(block_size >= 1);
        loop {
            let shard = &self.shards[*current_shard];
            if shard.next.load(Ordering::Relaxed) < shard.end {
                // Appears to be work in the current shard, try to claim it
                // with an atomic fetch-and-add. Relaxed suffices: claims are
                // made unique by the atomicity of the add, and the caller
                // only observes loop results after the pool's join.
                let start = shard.next.fetch_add(block_size, Ordering::Relaxed);
                if start < shard.end {
                    let end = shard.end.min(start + block_size);
                    #[cfg(feature = "log_scheduling")]
                    log_trace!(
                        "[work item {home_shard}] Claimed {start}..{end} from shard {}",
                        *current_shard
                    );
                    return Some(start..end);
                }
            }
            // Work in the current shard is exhausted, move on to the next
            // shard, until we are back at the home shard.
            *current_shard = (*current_shard + 1) % self.num_shards;
            if *current_shard == home_shard {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Drains the counter from the given work item's perspective, returning
    /// every claimed range.
    fn drain(lc: &LoopCounter, worker_index: usize, block_size: u64) -> Vec<Range<u64>> {
        let home = lc.home_shard(worker_index);
        let mut shard = home;
        let mut claims = Vec::new();
        while let Some(range) = lc.claim_iterations(home, &mut shard, block_size) {
            claims.push(range);
        }
        claims
    }

    fn assert_exact_cover(claims: &[Range<u64>], n: u64) {
        let mut seen = vec![false; n as usize];
        for range in claims {
            assert!(range.start < range.end, "empty claim {range:?}");
            assert!(range.end <= n, "claim {range:?} out of bounds");
            for i in range.clone() {
                assert!(!seen[i as usize], "iteration {i} claimed twice");
                seen[i as usize] = true;
            }
        }
        assert!(seen.iter().all(|x| *x), "not all iterations claimed");
    }

    #[test]
    fn shard_count_bounds() {
        // Fewer blocks than MAX_SHARDS: one shard per block.
        assert_eq!(LoopCounter::new(4, 8, 1).num_shards, 4);
        // Plenty of blocks: capped at MAX_SHARDS.
        assert_eq!(LoopCounter::new(1000, 16, 1).num_shards, MAX_SHARDS);
        // Capped by the degree of parallelism.
        assert_eq!(LoopCounter::new(1000, 3, 1).num_shards, 3);
        // Iteration space smaller than one block: a single shard.
        assert_eq!(LoopCounter::new(5, 8, 10).num_shards, 1);
        assert_eq!(LoopCounter::new(0, 8, 1).num_shards, 1);
    }

    #[test]
    fn shards_partition_iteration_space() {
        for (n, d_of_p, block_size) in [
            (1u64, 1u64, 1u64),
            (10, 4, 1),
            (100, 4, 7),
            (100, 16, 3),
            (1000, 8, 4),
            (17, 2, 5),
        ] {
            let lc = LoopCounter::new(n, d_of_p, block_size);
            let claims = drain(&lc, 0, block_size);
            assert_exact_cover(&claims, n);
        }
    }

    #[test]
    fn uneven_remainder_lands_in_final_shard() {
        // 103 iterations in blocks of 10: ten blocks over at most 8 shards,
        // the final shard absorbs the 3 leftover iterations.
        let lc = LoopCounter::new(103, 8, 10);
        let claims = drain(&lc, 0, 10);
        assert_exact_cover(&claims, 103);
        assert!(claims.iter().all(|r| r.end - r.start <= 10));
    }

    #[test]
    fn claims_never_cross_shard_end() {
        // Block size that doesn't divide the shard size: the trailing claim
        // of each shard must be clamped.
        let lc = LoopCounter::new(64, 4, 3);
        let claims = drain(&lc, 1, 3);
        assert_exact_cover(&claims, 64);
    }

    #[test]
    fn drained_counter_returns_none() {
        let lc = LoopCounter::new(10, 2, 1);
        drain(&lc, 0, 1);
        let home = lc.home_shard(1);
        let mut shard = home;
        assert!(lc.claim_iterations(home, &mut shard, 1).is_none());
    }

    #[test]
    fn home_shard_is_deterministic() {
        let lc = LoopCounter::new(100, 8, 1);
        for worker_index in 0..32 {
            assert_eq!(lc.home_shard(worker_index), worker_index % lc.num_shards);
            assert_eq!(lc.home_shard(worker_index), lc.home_shard(worker_index));
        }
    }

    #[test]
    fn concurrent_claims_cover_exactly_once() {
        const NUM_THREADS: usize = 4;
        #[cfg(not(miri))]
        const NUM_ELEMENTS: u64 = 10000;
        #[cfg(miri)]
        const NUM_ELEMENTS: u64 = 100;

        for _ in 0..10 {
            let lc = LoopCounter::new(NUM_ELEMENTS, NUM_THREADS as u64, 7);
            let claims: Vec<Vec<Range<u64>>> = std::thread::scope(|s| {
                let lc = &lc;
                let handles: Vec<_> = (0..NUM_THREADS)
                    .map(|worker_index| s.spawn(move || drain(lc, worker_index, 7)))
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            let all: Vec<Range<u64>> = claims.into_iter().flatten().collect();
            assert_exact_cover(&all, NUM_ELEMENTS);
        }
    }
}
