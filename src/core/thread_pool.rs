// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A thread pool turning declarative parallel-for requests into
//! low-contention, load-balanced execution.

use super::cost::{self, OpCost};
use super::counter::LoopCounter;
use super::cpu;
use super::executor::{Executor, SectionHandle, WorkerPool};
use crossbeam_utils::CachePadded;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::ThreadId;
use thiserror::Error;

/// On a CPU with heterogeneous core types the degree of parallelism is
/// oversubscribed by this factor, smoothing throughput variance between the
/// core types.
const TASK_GRANULARITY_FACTOR: usize = 4;

/// Degree of parallelism of a thread pool: the total number of concurrent
/// executors for a loop, including the calling thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Use the value returned by [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Use the given value. A count of 1 means no worker threads: the caller
    /// does all the work.
    Count(NonZeroUsize),
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Failure to construct a [`ThreadPool`].
#[derive(Debug, Error)]
pub enum BuildError {
    /// The operating system refused to create a worker thread.
    #[error("failed to spawn a worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),
    /// The affinity list is too short for the requested degree of
    /// parallelism.
    #[error("affinity list needs {needed} entries (the caller plus one per worker), got {got}")]
    AffinityTooShort {
        /// Required number of entries.
        needed: usize,
        /// Number of entries provided.
        got: usize,
    },
}

/// A builder for [`ThreadPool`].
pub struct ThreadPoolBuilder {
    /// Name of the pool, used for worker thread names and in the profiling
    /// report.
    pub name: Option<String>,
    /// Degree of parallelism, including the calling thread. A degree of N
    /// spawns N − 1 worker threads.
    pub degree_of_parallelism: ThreadCount,
    /// CPUs to pin threads to, in order. The first entry is reserved for the
    /// calling thread and is not used by the pool; each worker is pinned to
    /// one of the remaining entries. [`None`] disables pinning.
    pub affinity: Option<Vec<usize>>,
    /// When non-zero, enables dynamic scheduling: each loop targets
    /// `degree_of_parallelism * dynamic_block_base` blocks and workers shrink
    /// their block size as the loop drains, reducing tail latency from uneven
    /// finishing times. Zero selects fixed block sizes.
    pub dynamic_block_base: usize,
    /// When true, idle workers spin briefly before sleeping, trading CPU for
    /// wake-up latency.
    pub low_latency_hint: bool,
    /// Treat the CPU as hybrid even if detection says otherwise, multiplying
    /// the degree of parallelism by the granularity factor.
    pub force_hybrid: bool,
}

impl Default for ThreadPoolBuilder {
    fn default() -> Self {
        Self {
            name: None,
            degree_of_parallelism: ThreadCount::AvailableParallelism,
            affinity: None,
            dynamic_block_base: 0,
            low_latency_hint: false,
            force_hybrid: false,
        }
    }
}

impl ThreadPoolBuilder {
    /// Builds the thread pool, spawning its worker threads.
    ///
    /// ```
    /// # use parfor::{ThreadCount, ThreadPoolBuilder};
    /// # use std::sync::atomic::{AtomicU64, Ordering};
    /// let pool = ThreadPoolBuilder {
    ///     degree_of_parallelism: ThreadCount::try_from(4).unwrap(),
    ///     ..ThreadPoolBuilder::default()
    /// }
    /// .build()
    /// .expect("failed to build the thread pool");
    ///
    /// let sum = AtomicU64::new(0);
    /// pool.simple_parallel_for(100, |index| {
    ///     sum.fetch_add(index as u64, Ordering::Relaxed);
    /// });
    /// assert_eq!(sum.into_inner(), 4950);
    /// ```
    pub fn build(&self) -> Result<ThreadPool, BuildError> {
        let degree_of_parallelism: usize = match self.degree_of_parallelism {
            ThreadCount::AvailableParallelism => std::thread::available_parallelism()
                .expect("Getting the available parallelism failed")
                .into(),
            ThreadCount::Count(count) => count.into(),
        };

        let executor = if degree_of_parallelism >= 2 {
            let threads_to_create = degree_of_parallelism - 1;

            let worker_affinity = match &self.affinity {
                None => None,
                Some(list) => {
                    // The first entry is reserved for the calling thread.
                    let needed = threads_to_create + 1;
                    if list.len() < needed {
                        return Err(BuildError::AffinityTooShort {
                            needed,
                            got: list.len(),
                        });
                    }
                    Some(list[1..needed].to_vec())
                }
            };

            let name = self.name.as_deref().unwrap_or("parfor");
            let pool = WorkerPool::new(
                name,
                threads_to_create,
                worker_affinity,
                self.low_latency_hint,
            )?;
            Some(Box::new(pool) as Box<dyn Executor>)
        } else {
            None
        };

        Ok(ThreadPool {
            executor,
            dynamic_block_base: self.dynamic_block_base,
            force_hybrid: self.force_hybrid,
            active_sections: Mutex::new(Vec::new()),
        })
    }
}

/// A thread pool distributing parallel loops over a fixed set of worker
/// threads, with the calling thread always participating as one more
/// executor.
pub struct ThreadPool {
    /// Backend running the work items; [`None`] for a degree-1 pool, where
    /// the caller does all the work.
    executor: Option<Box<dyn Executor>>,
    /// Non-zero enables dynamic scheduling with this many blocks per
    /// executor.
    dynamic_block_base: usize,
    /// Treat the CPU as hybrid regardless of detection.
    force_hybrid: bool,
    /// Threads that currently hold a [`ParallelSection`] on this pool.
    active_sections: Mutex<Vec<ThreadId>>,
}

impl ThreadPool {
    /// Creates a pool on top of a custom [`Executor`], with fixed scheduling
    /// and no hybrid override.
    ///
    /// Combined with [`InlineExecutor`](crate::InlineExecutor) this gives
    /// fully deterministic scheduling for tests.
    pub fn with_executor(executor: Box<dyn Executor>) -> Self {
        Self {
            executor: Some(executor),
            dynamic_block_base: 0,
            force_hybrid: false,
            active_sections: Mutex::new(Vec::new()),
        }
    }

    /// Number of worker threads owned by this pool. The degree of
    /// parallelism is one more: the calling thread participates in every
    /// loop.
    pub fn num_threads(&self) -> usize {
        match &self.executor {
            Some(executor) => executor.num_threads(),
            None => 0,
        }
    }

    /// Index of the calling thread within this pool, or [`None`] if the
    /// caller is not one of its workers.
    pub fn current_thread_id(&self) -> Option<usize> {
        match &self.executor {
            Some(executor) => executor.current_thread_id(),
            None => None,
        }
    }

    /// Degree of parallelism to use when dividing work: the pool's worker
    /// threads plus the calling thread, oversubscribed by the granularity
    /// factor on hybrid CPUs. A missing pool yields 1 (no parallelism).
    ///
    /// ```
    /// # use parfor::ThreadPool;
    /// assert_eq!(ThreadPool::degree_of_parallelism(None), 1);
    /// ```
    pub fn degree_of_parallelism(pool: Option<&ThreadPool>) -> usize {
        match pool {
            Some(pool) => degree_with_granularity(
                pool.num_threads() + 1,
                pool.force_hybrid || cpu::is_hybrid(),
            ),
            None => 1,
        }
    }

    /// Whether loops dispatched on this pool can use more than one executor.
    pub fn should_parallelize(pool: Option<&ThreadPool>) -> bool {
        Self::degree_of_parallelism(pool) != 1
    }

    /// Whether a loop of `num_iterations` split into blocks of `block_size`
    /// is worth dispatching at all.
    fn should_parallelize_loop(&self, num_iterations: usize, block_size: usize) -> bool {
        // Do not parallelize trivial loops, with only a single block of work.
        if block_size == 0 || num_iterations <= block_size {
            return false;
        }

        // Do not parallelize without a second executor available. A caller
        // outside the pool needs at least one worker; a caller that is
        // itself a worker needs at least one other worker.
        match self.current_thread_id() {
            None => self.num_threads() > 0,
            Some(_) => self.num_threads() > 1,
        }
    }

    /// Runs `f` over disjoint sub-ranges of `0..num_iterations` in parallel,
    /// sizing blocks from the given per-iteration cost estimate.
    ///
    /// Small or cheap loops run directly on the calling thread with a single
    /// `f(0..num_iterations)` call. The call returns once every iteration
    /// has been processed exactly once; iterations are unordered relative to
    /// each other.
    ///
    /// ```
    /// # use parfor::{OpCost, ThreadCount, ThreadPoolBuilder};
    /// # use std::sync::atomic::{AtomicU64, Ordering};
    /// let pool = ThreadPoolBuilder {
    ///     degree_of_parallelism: ThreadCount::try_from(2).unwrap(),
    ///     ..ThreadPoolBuilder::default()
    /// }
    /// .build()
    /// .expect("failed to build the thread pool");
    ///
    /// let input: Vec<u64> = (1..=1000).collect();
    /// let sum = AtomicU64::new(0);
    /// pool.parallel_for(
    ///     input.len(),
    ///     OpCost::new(8.0, 0.0, 1.0),
    ///     |range| {
    ///         let partial: u64 = input[range].iter().sum();
    ///         sum.fetch_add(partial, Ordering::Relaxed);
    ///     },
    /// );
    /// assert_eq!(sum.into_inner(), 500_500);
    /// ```
    pub fn parallel_for(
        &self,
        num_iterations: usize,
        cost: impl Into<OpCost>,
        f: impl Fn(Range<usize>) + Sync,
    ) {
        self.parallel_for_impl(None, num_iterations, cost.into(), &f);
    }

    /// Runs `f` once per index in `0..num_iterations` in parallel, claiming
    /// one index at a time.
    pub fn simple_parallel_for(&self, num_iterations: usize, f: impl Fn(usize) + Sync) {
        self.simple_parallel_for_impl(None, num_iterations, &f);
    }

    /// Runs `f` on some worker thread, fire and forget; inline when the pool
    /// has no workers.
    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        match &self.executor {
            Some(executor) => executor.schedule(Box::new(f)),
            None => f(),
        }
    }

    /// [`parallel_for()`](Self::parallel_for) on an optional pool: a missing
    /// pool runs `f(0..num_iterations)` directly.
    pub fn try_parallel_for(
        pool: Option<&ThreadPool>,
        num_iterations: usize,
        cost: impl Into<OpCost>,
        f: impl Fn(Range<usize>) + Sync,
    ) {
        match pool {
            Some(pool) => pool.parallel_for(num_iterations, cost, f),
            None => f(0..num_iterations),
        }
    }

    /// [`simple_parallel_for()`](Self::simple_parallel_for) on an optional
    /// pool: a missing pool runs the loop directly.
    pub fn try_simple_parallel_for(
        pool: Option<&ThreadPool>,
        num_iterations: usize,
        f: impl Fn(usize) + Sync,
    ) {
        match pool {
            Some(pool) => pool.simple_parallel_for(num_iterations, f),
            None => {
                for index in 0..num_iterations {
                    f(index);
                }
            }
        }
    }

    /// Opens a parallel section on the calling thread.
    ///
    /// Loops dispatched through the returned scope object share one region
    /// of executor bookkeeping. At most one section may be live per thread
    /// on a given pool; opening a second one panics: nested parallel
    /// regions are unsupported by design, not silently flattened.
    pub fn parallel_section(&self) -> ParallelSection<'_> {
        let thread_id = std::thread::current().id();
        // The registry lock must be released before the assertion fires, so
        // that the unwinding path (dropping an outer section) can still take
        // it.
        let already_active = {
            let mut active = self.active_sections.lock().unwrap();
            if active.contains(&thread_id) {
                true
            } else {
                active.push(thread_id);
                false
            }
        };
        assert!(
            !already_active,
            "nested parallel sections are not supported"
        );

        let handle = self
            .executor
            .as_ref()
            .map(|executor| executor.allocate_parallel_section());
        ParallelSection {
            pool: self,
            handle,
            _not_send: PhantomData,
        }
    }

    /// Starts collecting scheduling telemetry. A no-op for a pool without
    /// workers.
    pub fn start_profiling(&self) {
        if let Some(executor) = &self.executor {
            executor.start_profiling();
        }
    }

    /// Stops collecting and returns the report: the dispatching thread's
    /// block-size history, per-phase accumulated microseconds, and each
    /// worker's run count and last known core. Returns an empty string for a
    /// pool without workers; panics if profiling was never started on a pool
    /// with workers.
    pub fn stop_profiling(&self) -> String {
        match &self.executor {
            Some(executor) => executor.stop_profiling(),
            None => String::new(),
        }
    }

    /// Allows idle workers to spin before sleeping. Only effective on a pool
    /// built with the low-latency hint.
    pub fn enable_spinning(&self) {
        if let Some(executor) = &self.executor {
            executor.enable_spinning();
        }
    }

    /// Forbids idle workers from spinning.
    pub fn disable_spinning(&self) {
        if let Some(executor) = &self.executor {
            executor.disable_spinning();
        }
    }

    fn parallel_for_impl(
        &self,
        section: Option<&SectionHandle>,
        num_iterations: usize,
        cost: OpCost,
        f: &(dyn Fn(Range<usize>) + Sync),
    ) {
        let degree_of_parallelism = Self::degree_of_parallelism(Some(self));
        // Compute small problems directly on the calling thread.
        if !self.should_parallelize_loop(num_iterations, 1)
            || cost::ideal_num_threads(num_iterations, cost, degree_of_parallelism) == 1
        {
            f(0..num_iterations);
            return;
        }

        let block_size = cost::calculate_block_size(num_iterations, cost, degree_of_parallelism);
        self.parallel_for_fixed_block(section, num_iterations, block_size, f);
    }

    fn simple_parallel_for_impl(
        &self,
        section: Option<&SectionHandle>,
        num_iterations: usize,
        f: &(dyn Fn(usize) + Sync),
    ) {
        self.parallel_for_fixed_block(section, num_iterations, 1, &|range: Range<usize>| {
            for index in range {
                f(index);
            }
        });
    }

    /// Base case for parallel loops: iterations `0..total` divided into
    /// blocks of `block_size`, each claimed and executed as one unit.
    fn parallel_for_fixed_block(
        &self,
        section: Option<&SectionHandle>,
        total: usize,
        block_size: usize,
        f: &(dyn Fn(Range<usize>) + Sync),
    ) {
        if total == 0 {
            return;
        }
        if total <= block_size {
            f(0..total);
            return;
        }

        let degree_of_parallelism = Self::degree_of_parallelism(Some(self));
        if self.dynamic_block_base == 0 {
            // Each work item runs a loop claiming blocks until the counter
            // drains, so one work item per executor suffices even when there
            // are more blocks than executors.
            let num_blocks = total / block_size;
            let num_work_items = (self.num_threads() + 1).min(num_blocks);
            debug_assert!(num_work_items > 0);

            let loop_counter =
                LoopCounter::new(total as u64, degree_of_parallelism as u64, block_size as u64);
            let run_work = |work_item: usize| {
                let home_shard = loop_counter.home_shard(work_item);
                let mut shard = home_shard;
                while let Some(range) =
                    loop_counter.claim_iterations(home_shard, &mut shard, block_size as u64)
                {
                    f(range.start as usize..range.end as usize);
                }
            };
            // The claim/join protocol of the executor brackets every use of
            // `loop_counter` and `f`, so both can live on this stack frame.
            self.run_in_parallel(section, &run_work, num_work_items, block_size);
        } else {
            let target_blocks = degree_of_parallelism * self.dynamic_block_base;
            let base_block_size = next_dynamic_block(total as u64, target_blocks as u64);
            let remaining = CachePadded::new(AtomicU64::new(total as u64));

            let loop_counter =
                LoopCounter::new(total as u64, degree_of_parallelism as u64, base_block_size);
            let run_work = |work_item: usize| {
                let mut block = base_block_size;
                let home_shard = loop_counter.home_shard(work_item);
                let mut shard = home_shard;
                while let Some(range) = loop_counter.claim_iterations(home_shard, &mut shard, block)
                {
                    f(range.start as usize..range.end as usize);
                    let claimed = range.end - range.start;
                    let left = remaining.fetch_sub(claimed, Ordering::Relaxed) - claimed;
                    if block > 1 {
                        // Shrink the next claim as the loop drains, keeping
                        // the per-worker sequence non-increasing with a
                        // floor of one iteration.
                        block = next_dynamic_block(left, target_blocks as u64);
                    }
                }
            };
            let num_work_items = (self.num_threads() + 1).min(target_blocks);
            self.run_in_parallel(section, &run_work, num_work_items, base_block_size as usize);
        }
    }

    fn run_in_parallel(
        &self,
        section: Option<&SectionHandle>,
        work: &(dyn Fn(usize) + Sync),
        num_work_items: usize,
        block_size: usize,
    ) {
        match &self.executor {
            Some(executor) => match section {
                Some(handle) => {
                    executor.run_in_parallel_section(handle, work, num_work_items, block_size)
                }
                None => executor.run_in_parallel(work, num_work_items, block_size),
            },
            None => work(0),
        }
    }
}

/// Degree of parallelism with the hybrid-CPU granularity factor applied.
fn degree_with_granularity(base_degree: usize, hybrid: bool) -> usize {
    if hybrid {
        base_degree * TASK_GRANULARITY_FACTOR
    } else {
        base_degree
    }
}

/// Block size targeting `target_blocks` blocks over the remaining
/// iterations, with a floor of one iteration.
fn next_dynamic_block(remaining: u64, target_blocks: u64) -> u64 {
    ((remaining as f64 / target_blocks as f64).round() as u64).max(1)
}

/// A scoped marker of one active parallel-dispatch region on the thread that
/// opened it.
///
/// Created by [`ThreadPool::parallel_section()`]; loops dispatched through
/// this object route through the section's executor region. The region is
/// released on every exit path when the section is dropped.
pub struct ParallelSection<'pool> {
    pool: &'pool ThreadPool,
    handle: Option<SectionHandle>,
    /// A section is bound to the thread that opened it.
    _not_send: PhantomData<*const ()>,
}

impl ParallelSection<'_> {
    /// [`ThreadPool::parallel_for()`] dispatched through this section.
    pub fn parallel_for(
        &self,
        num_iterations: usize,
        cost: impl Into<OpCost>,
        f: impl Fn(Range<usize>) + Sync,
    ) {
        self.pool
            .parallel_for_impl(self.handle.as_ref(), num_iterations, cost.into(), &f);
    }

    /// [`ThreadPool::simple_parallel_for()`] dispatched through this
    /// section.
    pub fn simple_parallel_for(&self, num_iterations: usize, f: impl Fn(usize) + Sync) {
        self.pool
            .simple_parallel_for_impl(self.handle.as_ref(), num_iterations, &f);
    }
}

impl Drop for ParallelSection<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Some(executor) = &self.pool.executor {
                executor.release_parallel_section(handle);
            }
        }

        let thread_id = std::thread::current().id();
        let mut active = self.pool.active_sections.lock().unwrap();
        if let Some(position) = active.iter().position(|id| *id == thread_id) {
            active.swap_remove(position);
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::executor::InlineExecutor;
    use super::*;
    use std::sync::atomic::{AtomicU8, AtomicUsize};

    fn pool_with_degree(degree_of_parallelism: usize) -> ThreadPool {
        ThreadPoolBuilder {
            degree_of_parallelism: ThreadCount::try_from(degree_of_parallelism).unwrap(),
            ..ThreadPoolBuilder::default()
        }
        .build()
        .unwrap()
    }

    #[test]
    fn thread_count_try_from_usize() {
        assert!(ThreadCount::try_from(0).is_err());
        assert_eq!(
            ThreadCount::try_from(1),
            Ok(ThreadCount::Count(NonZeroUsize::try_from(1).unwrap()))
        );
    }

    #[test]
    fn build_pool_available_parallelism() {
        let pool = ThreadPoolBuilder::default().build().unwrap();
        assert_eq!(
            pool.num_threads(),
            usize::from(std::thread::available_parallelism().unwrap()) - 1
        );
    }

    #[test]
    fn build_pool_degree_one_has_no_workers() {
        let pool = pool_with_degree(1);
        assert_eq!(pool.num_threads(), 0);
        assert_eq!(pool.current_thread_id(), None);
    }

    #[test]
    fn build_pool_with_affinity() {
        // Pinning may or may not succeed on this machine; building must.
        let pool = ThreadPoolBuilder {
            degree_of_parallelism: ThreadCount::try_from(3).unwrap(),
            affinity: Some(vec![0, 0, 1]),
            ..ThreadPoolBuilder::default()
        }
        .build()
        .unwrap();
        assert_eq!(pool.num_threads(), 2);
    }

    #[test]
    fn build_pool_rejects_short_affinity() {
        let result = ThreadPoolBuilder {
            degree_of_parallelism: ThreadCount::try_from(3).unwrap(),
            affinity: Some(vec![0]),
            ..ThreadPoolBuilder::default()
        }
        .build();
        assert!(matches!(
            result,
            Err(BuildError::AffinityTooShort { needed: 3, got: 1 })
        ));
    }

    #[test]
    fn degree_of_parallelism_counts_the_caller() {
        assert_eq!(ThreadPool::degree_of_parallelism(None), 1);
        assert!(!ThreadPool::should_parallelize(None));

        // The hybrid multiplier itself, machine-independent.
        assert_eq!(degree_with_granularity(5, false), 5);
        assert_eq!(degree_with_granularity(5, true), 20);

        let pool = ThreadPoolBuilder {
            degree_of_parallelism: ThreadCount::try_from(4).unwrap(),
            force_hybrid: true,
            ..ThreadPoolBuilder::default()
        }
        .build()
        .unwrap();
        assert_eq!(pool.num_threads(), 3);
        assert_eq!(
            ThreadPool::degree_of_parallelism(Some(&pool)),
            4 * TASK_GRANULARITY_FACTOR
        );
        assert!(ThreadPool::should_parallelize(Some(&pool)));
    }

    #[test]
    fn should_parallelize_loop_rules() {
        let pool = pool_with_degree(3);
        // A single block of work is not worth dispatching.
        assert!(!pool.should_parallelize_loop(10, 0));
        assert!(!pool.should_parallelize_loop(10, 10));
        assert!(!pool.should_parallelize_loop(0, 1));
        assert!(pool.should_parallelize_loop(10, 1));

        // No second executor: the caller would be alone.
        let pool = pool_with_degree(1);
        assert!(!pool.should_parallelize_loop(1000, 1));
    }

    #[test]
    fn parallel_for_visits_every_index_exactly_once() {
        #[cfg(not(miri))]
        const NUM_ITERATIONS: usize = 1_000_000;
        #[cfg(miri)]
        const NUM_ITERATIONS: usize = 1_000;

        let pool = pool_with_degree(9);
        assert_eq!(pool.num_threads(), 8);

        let visits: Vec<AtomicU8> = (0..NUM_ITERATIONS).map(|_| AtomicU8::new(0)).collect();
        pool.parallel_for_fixed_block(None, NUM_ITERATIONS, 4, &|range: Range<usize>| {
            for index in range {
                visits[index].fetch_add(1, Ordering::Relaxed);
            }
        });

        assert!(visits.iter().all(|v| v.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn simple_parallel_for_visits_every_index_exactly_once() {
        let pool = pool_with_degree(4);
        let visits: Vec<AtomicU8> = (0..10_000).map(|_| AtomicU8::new(0)).collect();
        pool.simple_parallel_for(visits.len(), |index| {
            visits[index].fetch_add(1, Ordering::Relaxed);
        });
        assert!(visits.iter().all(|v| v.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn small_loop_runs_inline_in_one_call() {
        let pool = pool_with_degree(4);
        let caller = std::thread::current().id();
        let calls = Mutex::new(Vec::new());

        // Ten cheap iterations: the cost model keeps this on one thread.
        pool.parallel_for(10, 1.0, |range| {
            assert_eq!(std::thread::current().id(), caller);
            calls.lock().unwrap().push(range);
        });

        assert_eq!(calls.into_inner().unwrap(), vec![0..10]);
    }

    #[test]
    fn zero_iterations_still_calls_back_once() {
        let pool = pool_with_degree(4);
        let calls = AtomicUsize::new(0);
        pool.parallel_for(0, 1.0, |range| {
            assert_eq!(range, 0..0);
            calls.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn degree_one_pool_runs_everything_on_the_caller() {
        let pool = pool_with_degree(1);
        let caller = std::thread::current().id();

        let visits: Vec<AtomicU8> = (0..1000).map(|_| AtomicU8::new(0)).collect();
        pool.parallel_for(visits.len(), 1e6, |range| {
            assert_eq!(std::thread::current().id(), caller);
            for index in range {
                visits[index].fetch_add(1, Ordering::Relaxed);
            }
        });
        assert!(visits.iter().all(|v| v.load(Ordering::Relaxed) == 1));

        let scheduled = AtomicUsize::new(0);
        pool.schedule(|| {
            // Runs synchronously on the caller: no worker exists.
        });
        pool.simple_parallel_for(10, |_| {
            scheduled.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(scheduled.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn schedule_runs_on_a_worker() {
        let pool = pool_with_degree(2);
        let done = std::sync::Arc::new(AtomicUsize::new(0));

        let caller = std::thread::current().id();
        {
            let done = done.clone();
            pool.schedule(move || {
                assert_ne!(std::thread::current().id(), caller);
                done.store(1, Ordering::SeqCst);
            });
        }

        let start = std::time::Instant::now();
        while done.load(Ordering::SeqCst) == 0 {
            assert!(
                start.elapsed() < std::time::Duration::from_secs(10),
                "scheduled task never ran"
            );
            std::thread::yield_now();
        }
    }

    #[test]
    fn dispatch_from_a_worker_completes() {
        let pool = std::sync::Arc::new(pool_with_degree(3));
        let done = std::sync::Arc::new(AtomicUsize::new(0));

        {
            let pool = pool.clone();
            let done = done.clone();
            pool.clone().schedule(move || {
                // A loop dispatched from one of the pool's own workers must
                // not deadlock waiting for that same worker.
                let count = AtomicUsize::new(0);
                pool.simple_parallel_for(1000, |_index| {
                    count.fetch_add(1, Ordering::Relaxed);
                });
                assert_eq!(count.load(Ordering::Relaxed), 1000);
                done.store(1, Ordering::SeqCst);
            });
        }

        let start = std::time::Instant::now();
        while done.load(Ordering::SeqCst) == 0 {
            assert!(
                start.elapsed() < std::time::Duration::from_secs(10),
                "nested dispatch never completed"
            );
            std::thread::yield_now();
        }
    }

    #[test]
    fn dynamic_scheduling_covers_every_index() {
        let pool = ThreadPoolBuilder {
            degree_of_parallelism: ThreadCount::try_from(3).unwrap(),
            dynamic_block_base: 4,
            ..ThreadPoolBuilder::default()
        }
        .build()
        .unwrap();

        let visits: Vec<AtomicU8> = (0..100_000).map(|_| AtomicU8::new(0)).collect();
        pool.parallel_for_fixed_block(None, visits.len(), 8, &|range: Range<usize>| {
            for index in range {
                visits[index].fetch_add(1, Ordering::Relaxed);
            }
        });
        assert!(visits.iter().all(|v| v.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn dynamic_block_sequence_is_non_increasing_with_floor_one() {
        for target_blocks in [1u64, 4, 12, 64] {
            let mut previous = u64::MAX;
            // As the loop drains, the derived block size never grows.
            for remaining in (0..=10_000u64).rev().step_by(7) {
                let block = next_dynamic_block(remaining, target_blocks);
                assert!(block >= 1);
                assert!(block <= previous);
                previous = block;
            }
            assert_eq!(next_dynamic_block(0, target_blocks), 1);
        }
    }

    #[test]
    fn low_latency_pool_computes_correctly() {
        let pool = ThreadPoolBuilder {
            degree_of_parallelism: ThreadCount::try_from(4).unwrap(),
            low_latency_hint: true,
            ..ThreadPoolBuilder::default()
        }
        .build()
        .unwrap();

        let visits: Vec<AtomicU8> = (0..10_000).map(|_| AtomicU8::new(0)).collect();
        for _ in 0..3 {
            pool.simple_parallel_for(visits.len(), |index| {
                visits[index].fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.disable_spinning();
        pool.enable_spinning();
        assert!(visits.iter().all(|v| v.load(Ordering::Relaxed) == 3));
    }

    #[test]
    fn try_parallel_for_without_pool_runs_inline() {
        let calls = Mutex::new(Vec::new());
        ThreadPool::try_parallel_for(None, 17, 100.0, |range| {
            calls.lock().unwrap().push(range);
        });
        assert_eq!(calls.into_inner().unwrap(), vec![0..17]);

        let sum = AtomicUsize::new(0);
        ThreadPool::try_simple_parallel_for(None, 10, |index| {
            sum.fetch_add(index, Ordering::Relaxed);
        });
        assert_eq!(sum.load(Ordering::Relaxed), 45);
    }

    #[test]
    fn parallel_section_dispatches_loops() {
        let pool = pool_with_degree(4);
        let visits: Vec<AtomicU8> = (0..10_000).map(|_| AtomicU8::new(0)).collect();

        {
            let section = pool.parallel_section();
            section.simple_parallel_for(visits.len(), |index| {
                visits[index].fetch_add(1, Ordering::Relaxed);
            });
            section.parallel_for(visits.len(), 100.0, |range| {
                for index in range {
                    visits[index].fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        // The section released cleanly: a new one can be opened.
        let _section = pool.parallel_section();
        assert!(visits.iter().all(|v| v.load(Ordering::Relaxed) == 2));
    }

    #[test]
    #[should_panic(expected = "nested parallel sections are not supported")]
    fn nested_parallel_section_panics() {
        let pool = pool_with_degree(2);
        let _outer = pool.parallel_section();
        let _inner = pool.parallel_section();
    }

    #[test]
    fn parallel_sections_on_different_threads_coexist() {
        let pool = pool_with_degree(2);
        let _section = pool.parallel_section();

        std::thread::scope(|s| {
            s.spawn(|| {
                let _other = pool.parallel_section();
            })
            .join()
            .unwrap();
        });
    }

    #[test]
    #[should_panic(expected = "worker thread(s) panicked!")]
    fn worker_panic_propagates_to_the_caller() {
        let pool = pool_with_degree(2);
        let caller = std::thread::current().id();
        let worker_started = std::sync::atomic::AtomicBool::new(false);
        pool.simple_parallel_for(1000, |_index| {
            if std::thread::current().id() != caller {
                worker_started.store(true, Ordering::SeqCst);
                panic!("boom");
            }
            // Hold the loop open until the worker has claimed its share, so
            // that the caller cannot drain the counter alone.
            while !worker_started.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
        });
    }

    #[test]
    fn profiling_round_trip() {
        let pool = ThreadPoolBuilder {
            name: Some("profiled".to_string()),
            degree_of_parallelism: ThreadCount::try_from(3).unwrap(),
            ..ThreadPoolBuilder::default()
        }
        .build()
        .unwrap();

        pool.start_profiling();
        pool.simple_parallel_for(10_000, |_| {});
        let report = pool.stop_profiling();

        assert!(report.contains("\"thread_pool_name\": \"profiled\""));
        assert!(report.contains("\"block_size\": [1]"));
        assert!(report.contains("\"sub_threads\""));
    }

    #[test]
    #[should_panic(expected = "profiler not started yet")]
    fn stop_profiling_without_start_panics() {
        let pool = pool_with_degree(2);
        pool.stop_profiling();
    }

    #[test]
    fn profiling_on_degree_one_pool_is_a_no_op() {
        let pool = pool_with_degree(1);
        pool.start_profiling();
        assert_eq!(pool.stop_profiling(), "");
    }

    #[test]
    fn inline_executor_gives_deterministic_scheduling() {
        let pool = ThreadPool::with_executor(Box::new(InlineExecutor::new(4)));
        assert_eq!(pool.num_threads(), 4);

        let order = Mutex::new(Vec::new());
        pool.simple_parallel_for(100, |index| {
            order.lock().unwrap().push(index);
        });

        // Work item 0 drains the whole counter before item 1 ever runs, so
        // the visit order is exactly ascending.
        assert_eq!(order.into_inner().unwrap(), (0..100).collect::<Vec<_>>());
    }
}
