// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Scheduling telemetry: per-dispatch timings on the dispatching thread and
//! run counts plus core placement per worker.

use super::cpu;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Named phases of a parallel dispatch, accumulated in microseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ProfilerEvent {
    /// Publishing a round from a top-level dispatch.
    Distribution,
    /// Publishing a round from inside a parallel section.
    DistributionEnqueue,
    /// The dispatching thread's own share of the loop.
    Run,
    /// Waiting for the participants to finish.
    Wait,
}

impl ProfilerEvent {
    const ALL: [ProfilerEvent; 4] = [
        ProfilerEvent::Distribution,
        ProfilerEvent::DistributionEnqueue,
        ProfilerEvent::Run,
        ProfilerEvent::Wait,
    ];

    fn name(self) -> &'static str {
        match self {
            ProfilerEvent::Distribution => "Distribution",
            ProfilerEvent::DistributionEnqueue => "DistributionEnqueue",
            ProfilerEvent::Run => "Run",
            ProfilerEvent::Wait => "Wait",
        }
    }

    fn index(self) -> usize {
        match self {
            ProfilerEvent::Distribution => 0,
            ProfilerEvent::DistributionEnqueue => 1,
            ProfilerEvent::Run => 2,
            ProfilerEvent::Wait => 3,
        }
    }
}

/// A worker's core is resampled only when unset or when this much time has
/// passed since the last sample, bounding the profiling overhead.
const CORE_RESAMPLE_MICROS: u64 = 10_000;

/// Timing and placement state of the dispatching thread.
struct MainThreadStat {
    /// Pending `log_start` timestamps, matched LIFO by `log_end`.
    pending_starts: Vec<Instant>,
    /// Accumulated microseconds per event.
    events: [u64; ProfilerEvent::ALL.len()],
    /// Block sizes of the dispatches seen so far.
    block_sizes: Vec<usize>,
    /// Core the dispatching thread last ran on, -1 if never sampled.
    core: i64,
}

impl MainThreadStat {
    fn new() -> Self {
        Self {
            pending_starts: Vec::new(),
            events: [0; ProfilerEvent::ALL.len()],
            block_sizes: Vec::new(),
            core: -1,
        }
    }
}

/// Per-worker run statistics, updated from the worker itself.
struct WorkerStat {
    /// Number of rounds and tasks this worker has run.
    num_run: AtomicU64,
    /// Core this worker last ran on, -1 if never sampled.
    core: AtomicI64,
    /// Time of the last core sample, in microseconds since the profiler
    /// epoch; `u64::MAX` if never sampled.
    last_sample_micros: AtomicU64,
}

impl WorkerStat {
    fn new() -> Self {
        Self {
            num_run: AtomicU64::new(0),
            core: AtomicI64::new(-1),
            last_sample_micros: AtomicU64::new(u64::MAX),
        }
    }

    fn reset(&self) {
        self.num_run.store(0, Ordering::Relaxed);
        self.core.store(-1, Ordering::Relaxed);
        self.last_sample_micros.store(u64::MAX, Ordering::Relaxed);
    }
}

/// Collects timing and placement telemetry per dispatch and per worker.
///
/// All logging entry points are no-ops until [`start()`](Self::start); the
/// enabled flag is checked before touching any other state, so a disabled
/// profiler costs one relaxed load per hook.
pub(crate) struct ThreadPoolProfiler {
    enabled: AtomicBool,
    thread_pool_name: String,
    epoch: Instant,
    main_thread: Mutex<MainThreadStat>,
    worker_stats: Box<[CachePadded<WorkerStat>]>,
}

impl ThreadPoolProfiler {
    pub fn new(num_threads: usize, thread_pool_name: &str) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            thread_pool_name: thread_pool_name.to_string(),
            epoch: Instant::now(),
            main_thread: Mutex::new(MainThreadStat::new()),
            worker_stats: (0..num_threads)
                .map(|_| CachePadded::new(WorkerStat::new()))
                .collect(),
        }
    }

    /// Starts collecting.
    pub fn start(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Stops collecting, returning the report and clearing all counters.
    ///
    /// Panics if the profiler was not started, or if a `log_start` is still
    /// unmatched.
    pub fn stop(&self) -> String {
        assert!(
            self.enabled.swap(false, Ordering::SeqCst),
            "profiler not started yet"
        );
        let mut main_thread = self.main_thread.lock().unwrap();
        assert!(
            main_thread.pending_starts.is_empty(),
            "log_start must pair with log_end"
        );

        let report = self.dump(&main_thread);

        *main_thread = MainThreadStat::new();
        for stat in self.worker_stats.iter() {
            stat.reset();
        }

        report
    }

    /// Marks the beginning of a timed phase on the dispatching thread.
    pub fn log_start(&self) {
        if self.enabled.load(Ordering::Relaxed) {
            let mut main_thread = self.main_thread.lock().unwrap();
            main_thread.pending_starts.push(Instant::now());
        }
    }

    /// Closes the innermost timed phase, attributing it to `event`.
    ///
    /// Panics if no phase is open.
    pub fn log_end(&self, event: ProfilerEvent) {
        if self.enabled.load(Ordering::Relaxed) {
            let mut main_thread = self.main_thread.lock().unwrap();
            let start = main_thread
                .pending_starts
                .pop()
                .expect("log_start must pair with log_end");
            main_thread.events[event.index()] += start.elapsed().as_micros() as u64;
        }
    }

    /// Closes the innermost timed phase and immediately reopens it, so that
    /// consecutive phases share one timestamp.
    ///
    /// Panics if no phase is open.
    pub fn log_end_and_start(&self, event: ProfilerEvent) {
        if self.enabled.load(Ordering::Relaxed) {
            let mut main_thread = self.main_thread.lock().unwrap();
            let index = event.index();
            let start = main_thread
                .pending_starts
                .last_mut()
                .expect("log_start must pair with log_end");
            let now = Instant::now();
            let elapsed = now.duration_since(*start).as_micros() as u64;
            *start = now;
            main_thread.events[index] += elapsed;
        }
    }

    /// Records the dispatching thread's current core and the dispatch's
    /// block size.
    pub fn log_core_and_block(&self, block_size: usize) {
        if self.enabled.load(Ordering::Relaxed) {
            let mut main_thread = self.main_thread.lock().unwrap();
            main_thread.core = cpu::current_cpu();
            main_thread.block_sizes.push(block_size);
        }
    }

    /// Counts one unit of work on the given worker, resampling its core at
    /// most every [`CORE_RESAMPLE_MICROS`].
    pub fn log_run(&self, worker_index: usize) {
        if self.enabled.load(Ordering::Relaxed) {
            let stat = &self.worker_stats[worker_index];
            stat.num_run.fetch_add(1, Ordering::Relaxed);

            let now_micros = self.epoch.elapsed().as_micros() as u64;
            let last = stat.last_sample_micros.load(Ordering::Relaxed);
            if stat.core.load(Ordering::Relaxed) < 0
                || now_micros.saturating_sub(last) > CORE_RESAMPLE_MICROS
            {
                stat.core.store(cpu::current_cpu(), Ordering::Relaxed);
                stat.last_sample_micros.store(now_micros, Ordering::Relaxed);
            }
        }
    }

    fn dump(&self, main_thread: &MainThreadStat) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{{\"main_thread\": {{\"thread_pool_name\": \"{}\", \"thread_id\": \"{:?}\", \"block_size\": [",
            self.thread_pool_name,
            std::thread::current().id()
        ));
        for (i, block_size) in main_thread.block_sizes.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&block_size.to_string());
        }
        out.push_str(&format!("], \"core\": {}", main_thread.core));
        for event in ProfilerEvent::ALL {
            out.push_str(&format!(
                ", \"{}\": {}",
                event.name(),
                main_thread.events[event.index()]
            ));
        }
        out.push_str("}, \"sub_threads\": {");
        for (i, stat) in self.worker_stats.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&format!(
                "\"{}\": {{\"num_run\": {}, \"core\": {}}}",
                i,
                stat.num_run.load(Ordering::Relaxed),
                stat.core.load(Ordering::Relaxed)
            ));
        }
        out.push_str("}}");
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn disabled_profiler_ignores_logs() {
        let profiler = ThreadPoolProfiler::new(2, "test_pool");
        // None of these may panic or record anything while disabled.
        profiler.log_start();
        profiler.log_end(ProfilerEvent::Run);
        profiler.log_core_and_block(16);
        profiler.log_run(0);

        profiler.start();
        let report = profiler.stop();
        assert!(report.contains("\"block_size\": []"));
        assert!(report.contains("\"num_run\": 0"));
    }

    #[test]
    fn report_shape() {
        let profiler = ThreadPoolProfiler::new(2, "test_pool");
        profiler.start();

        profiler.log_core_and_block(4);
        profiler.log_start();
        profiler.log_end_and_start(ProfilerEvent::Distribution);
        profiler.log_end_and_start(ProfilerEvent::Run);
        profiler.log_end(ProfilerEvent::Wait);
        profiler.log_run(0);
        profiler.log_run(0);
        profiler.log_run(1);

        let report = profiler.stop();
        assert!(report.starts_with("{\"main_thread\": {\"thread_pool_name\": \"test_pool\""));
        assert!(report.contains("\"block_size\": [4]"));
        assert!(report.contains("\"Distribution\": "));
        assert!(report.contains("\"0\": {\"num_run\": 2, \"core\": "));
        assert!(report.contains("\"1\": {\"num_run\": 1, \"core\": "));
        assert!(report.ends_with("}}"));
    }

    #[test]
    fn stop_clears_counters() {
        let profiler = ThreadPoolProfiler::new(1, "test_pool");
        profiler.start();
        profiler.log_core_and_block(8);
        profiler.log_run(0);
        profiler.stop();

        profiler.start();
        let report = profiler.stop();
        assert!(report.contains("\"block_size\": []"));
        assert!(report.contains("\"0\": {\"num_run\": 0, \"core\": -1}"));
    }

    #[test]
    #[should_panic(expected = "profiler not started yet")]
    fn stop_without_start_panics() {
        let profiler = ThreadPoolProfiler::new(1, "test_pool");
        profiler.stop();
    }

    #[test]
    #[should_panic(expected = "log_start must pair with log_end")]
    fn log_end_without_start_panics() {
        let profiler = ThreadPoolProfiler::new(1, "test_pool");
        profiler.start();
        profiler.log_end(ProfilerEvent::Run);
    }

    #[test]
    #[should_panic(expected = "log_start must pair with log_end")]
    fn stop_with_unmatched_start_panics() {
        let profiler = ThreadPoolProfiler::new(1, "test_pool");
        profiler.start();
        profiler.log_start();
        profiler.stop();
    }
}
