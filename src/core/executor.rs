// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Executor backends for the thread pool.
//!
//! The pool itself only encodes scheduling policy (block sizes, work-item
//! counts, claim loops); the executor is what actually runs work items on
//! threads. [`WorkerPool`] is the OS-thread backend built on the round
//! protocol of the sync module; [`InlineExecutor`] is a deterministic
//! stand-in that runs everything on the calling thread.

use super::cpu;
use super::profiler::{ProfilerEvent, ThreadPoolProfiler};
use super::sync::{make_dispatch_group, Dispatcher, Task, Wake, WorkerGate};
use crate::macros::{log_debug, log_error};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, ThreadId};

/// Per-region bookkeeping handed out by an executor for the lifetime of one
/// parallel section.
pub struct SectionHandle {
    id: u64,
    loops_dispatched: AtomicU64,
}

impl SectionHandle {
    fn new(id: u64) -> Self {
        Self {
            id,
            loops_dispatched: AtomicU64::new(0),
        }
    }
}

/// The interface the thread pool consumes to run work items.
///
/// Implementations must run each of the work items `1..num_work_items` passed
/// to [`run_in_parallel()`](Self::run_in_parallel) at most once, and item 0
/// exactly once on the calling thread, returning only once all of them have
/// completed; the work closure borrows the caller's stack frame.
pub trait Executor: Send + Sync {
    /// Number of worker threads owned by this executor.
    fn num_threads(&self) -> usize;

    /// Index of the calling thread within this executor, or [`None`] if the
    /// caller is not one of its workers.
    fn current_thread_id(&self) -> Option<usize>;

    /// Runs a fire-and-forget task.
    fn schedule(&self, task: Task);

    /// Runs `work` for every work item in `0..num_work_items`, item 0 on the
    /// calling thread, and blocks until all items complete. `block_size` is
    /// telemetry only.
    fn run_in_parallel(&self, work: &(dyn Fn(usize) + Sync), num_work_items: usize, block_size: usize);

    /// Acquires per-region bookkeeping for a new parallel section.
    fn allocate_parallel_section(&self) -> SectionHandle;

    /// Releases a handle previously returned by
    /// [`allocate_parallel_section()`](Self::allocate_parallel_section).
    fn release_parallel_section(&self, handle: SectionHandle);

    /// Like [`run_in_parallel()`](Self::run_in_parallel), for a dispatch made
    /// through an active parallel section.
    fn run_in_parallel_section(
        &self,
        handle: &SectionHandle,
        work: &(dyn Fn(usize) + Sync),
        num_work_items: usize,
        block_size: usize,
    );

    /// Starts collecting scheduling telemetry.
    fn start_profiling(&self) {}

    /// Stops collecting and returns the report.
    fn stop_profiling(&self) -> String {
        String::new()
    }

    /// Allows idle workers to spin before sleeping, where supported.
    fn enable_spinning(&self) {}

    /// Forbids idle workers from spinning.
    fn disable_spinning(&self) {}
}

/// Handle to a worker thread in a [`WorkerPool`].
struct WorkerThreadHandle {
    /// Thread handle object.
    handle: JoinHandle<()>,
}

/// The OS-thread executor: a fixed set of workers created once, coordinated
/// with the dispatching thread through the round protocol in
/// [`sync`](super::sync).
pub(crate) struct WorkerPool {
    /// Handles to all the worker threads in the pool.
    threads: Vec<WorkerThreadHandle>,
    /// OS identity of each worker, for [`Executor::current_thread_id`].
    thread_ids: Vec<ThreadId>,
    /// Dispatching side of the round protocol.
    dispatcher: Dispatcher,
    /// Serializes rounds: they share the inbox and the work-closure view.
    dispatch_lock: Mutex<()>,
    /// Scheduling telemetry, shared with the workers.
    profiler: Arc<ThreadPoolProfiler>,
    /// Next parallel-section id.
    next_section_id: AtomicU64,
    /// Number of parallel sections currently open.
    open_sections: AtomicUsize,
}

impl WorkerPool {
    /// Spawns `num_threads` workers, `num_threads >= 1`. If an `affinity`
    /// list is given it must hold one CPU per worker, and each worker is
    /// pinned to its entry. On spawn failure the already-spawned workers are
    /// shut down before the error is returned.
    pub fn new(
        name: &str,
        num_threads: usize,
        affinity: Option<Vec<usize>>,
        low_latency_hint: bool,
    ) -> std::io::Result<Self> {
        debug_assert!(num_threads >= 1);
        debug_assert!(affinity.as_ref().map_or(true, |list| list.len() == num_threads));

        let (dispatcher, gates) = make_dispatch_group(num_threads, low_latency_hint);
        let profiler = Arc::new(ThreadPoolProfiler::new(num_threads, name));

        let mut threads = Vec::with_capacity(num_threads);
        for (id, gate) in gates.into_iter().enumerate() {
            let profiler = profiler.clone();
            let cpu = affinity.as_ref().map(|list| list[id]);
            let spawned = std::thread::Builder::new()
                .name(format!("{name}-{id}"))
                .spawn(move || {
                    if let Some(cpu) = cpu {
                        cpu::pin_current_thread(id, cpu);
                    }
                    worker_loop(gate, id, &profiler);
                });
            match spawned {
                Ok(handle) => threads.push(WorkerThreadHandle { handle }),
                Err(e) => {
                    log_error!("[main thread] Failed to spawn worker thread #{id}: {e}");
                    dispatcher.finish_workers();
                    for t in threads.drain(..) {
                        let _ = t.handle.join();
                    }
                    return Err(e);
                }
            }
        }
        log_debug!("[main thread] Spawned {num_threads} worker thread(s)");

        let thread_ids = threads.iter().map(|t| t.handle.thread().id()).collect();

        Ok(Self {
            threads,
            thread_ids,
            dispatcher,
            dispatch_lock: Mutex::new(()),
            profiler,
            next_section_id: AtomicU64::new(0),
            open_sections: AtomicUsize::new(0),
        })
    }

    /// Dispatches one parallel round: work item 0 on the calling thread,
    /// items `1..num_work_items` on workers, bounded by the worker count.
    fn run_round(
        &self,
        work: &(dyn Fn(usize) + Sync),
        num_work_items: usize,
        block_size: usize,
        enqueue_event: ProfilerEvent,
    ) {
        let mut participants = num_work_items.saturating_sub(1).min(self.threads.len());
        if self.current_thread_id().is_some() {
            // A dispatch from one of our own workers must not wait on the
            // other workers (one of them is this thread). A single executor
            // drains the claim loop just as correctly, so run the whole loop
            // here.
            participants = 0;
        }

        self.profiler.log_core_and_block(block_size);
        self.profiler.log_start();

        if participants == 0 {
            work(0);
            self.profiler.log_end(ProfilerEvent::Run);
            return;
        }

        let _dispatch = self.dispatch_lock.lock().unwrap();
        self.dispatcher.begin_round(work, participants);
        self.profiler.log_end_and_start(enqueue_event);

        // The participants borrow this call's stack frame through the work
        // closure: a panic on the caller's own work item must not unwind
        // past the join below.
        let caller_result = catch_unwind(AssertUnwindSafe(|| work(0)));
        self.profiler.log_end_and_start(ProfilerEvent::Run);

        let num_panicking = self.dispatcher.join_round();
        self.profiler.log_end(ProfilerEvent::Wait);

        if let Err(payload) = caller_result {
            resume_unwind(payload);
        }
        if num_panicking != 0 {
            log_error!("[main thread] {num_panicking} worker thread(s) panicked!");
            panic!("{num_panicking} worker thread(s) panicked!");
        }
    }
}

impl Executor for WorkerPool {
    fn num_threads(&self) -> usize {
        self.threads.len()
    }

    fn current_thread_id(&self) -> Option<usize> {
        let me = std::thread::current().id();
        self.thread_ids.iter().position(|id| *id == me)
    }

    fn schedule(&self, task: Task) {
        self.dispatcher.schedule(task);
    }

    fn run_in_parallel(&self, work: &(dyn Fn(usize) + Sync), num_work_items: usize, block_size: usize) {
        self.run_round(work, num_work_items, block_size, ProfilerEvent::Distribution);
    }

    fn allocate_parallel_section(&self) -> SectionHandle {
        self.open_sections.fetch_add(1, Ordering::Relaxed);
        SectionHandle::new(self.next_section_id.fetch_add(1, Ordering::Relaxed))
    }

    fn release_parallel_section(&self, handle: SectionHandle) {
        log_debug!(
            "[main thread] Closing parallel section #{} after {} loop(s)",
            handle.id,
            handle.loops_dispatched.load(Ordering::Relaxed)
        );
        let open = self.open_sections.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(open > 0, "section #{} released twice", handle.id);
        drop(handle);
    }

    fn run_in_parallel_section(
        &self,
        handle: &SectionHandle,
        work: &(dyn Fn(usize) + Sync),
        num_work_items: usize,
        block_size: usize,
    ) {
        handle.loops_dispatched.fetch_add(1, Ordering::Relaxed);
        self.run_round(work, num_work_items, block_size, ProfilerEvent::DistributionEnqueue);
    }

    fn start_profiling(&self) {
        self.profiler.start();
    }

    fn stop_profiling(&self) -> String {
        self.profiler.stop()
    }

    fn enable_spinning(&self) {
        self.dispatcher.set_spinning(true);
    }

    fn disable_spinning(&self) {
        self.dispatcher.set_spinning(false);
    }
}

impl Drop for WorkerPool {
    /// Joins all the threads in the pool.
    fn drop(&mut self) {
        self.dispatcher.finish_workers();

        log_debug!("[main thread] Joining threads in the pool...");
        #[allow(clippy::unused_enumerate_index)]
        for (_i, t) in self.threads.drain(..).enumerate() {
            let result = t.handle.join();
            match result {
                Ok(_) => log_debug!("[main thread] Thread {_i} joined with result: {result:?}"),
                Err(_) => log_error!("[main thread] Thread {_i} joined with result: {result:?}"),
            }
        }
        log_debug!("[main thread] Joined threads.");
    }
}

/// Main function run by a worker thread.
fn worker_loop(mut gate: WorkerGate, id: usize, profiler: &ThreadPoolProfiler) {
    loop {
        match gate.wait() {
            Wake::Finished => break,
            Wake::Round => {
                profiler.log_run(id);
                // Work item 0 belongs to the dispatching thread.
                gate.run_work(id + 1);
            }
            Wake::Task(task) => {
                profiler.log_run(id);
                // Nothing ever joins a fire-and-forget task, so a panic here
                // must not take the worker down with it: a silently dead
                // worker would hang the next round.
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    log_error!("[thread {id}] A scheduled task panicked");
                }
            }
        }
    }
}

/// A deterministic executor that runs every work item, in index order, on the
/// calling thread, while reporting a configurable thread count.
///
/// This makes the pool's scheduling decisions (work-item counts, claim
/// sequences) fully reproducible, which is what tests want.
pub struct InlineExecutor {
    num_threads: usize,
}

impl InlineExecutor {
    /// Creates an executor reporting the given number of (virtual) worker
    /// threads.
    pub fn new(num_threads: usize) -> Self {
        Self { num_threads }
    }
}

impl Executor for InlineExecutor {
    fn num_threads(&self) -> usize {
        self.num_threads
    }

    fn current_thread_id(&self) -> Option<usize> {
        None
    }

    fn schedule(&self, task: Task) {
        task();
    }

    fn run_in_parallel(&self, work: &(dyn Fn(usize) + Sync), num_work_items: usize, _block_size: usize) {
        for work_item in 0..num_work_items {
            work(work_item);
        }
    }

    fn allocate_parallel_section(&self) -> SectionHandle {
        SectionHandle::new(0)
    }

    fn release_parallel_section(&self, handle: SectionHandle) {
        drop(handle);
    }

    fn run_in_parallel_section(
        &self,
        handle: &SectionHandle,
        work: &(dyn Fn(usize) + Sync),
        num_work_items: usize,
        block_size: usize,
    ) {
        handle.loops_dispatched.fetch_add(1, Ordering::Relaxed);
        self.run_in_parallel(work, num_work_items, block_size);
    }
}
