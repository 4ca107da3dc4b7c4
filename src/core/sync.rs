// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization between the dispatching thread and the worker threads.
//!
//! The dispatching thread publishes parallel rounds (a shared work closure
//! plus the number of participating workers) and fire-and-forget tasks
//! through a mutex-guarded inbox. Workers sleep on the inbox's condition
//! variable, optionally spinning on a padded epoch counter first when the
//! pool was built with the low-latency hint.

use super::util::{DynLifetimeView, LifetimeParameterized, Status};
use crate::macros::{log_debug, log_error};
use crossbeam_utils::CachePadded;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

/// A fire-and-forget unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Bounded spin before a worker falls back to sleeping on the condition
/// variable, when the low-latency hint is active.
const SPIN_ITERATIONS: usize = 1 << 12;

/// The work closure of one parallel round, taking a work-item index.
pub(crate) struct DynWorkFn;

impl LifetimeParameterized for DynWorkFn {
    type T<'a> = dyn Fn(usize) + Sync + 'a;
}

/// Status of the dispatching thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MainStatus {
    /// The dispatching thread is waiting for the participants of the current
    /// round to finish.
    Waiting,
    /// The last participant has finished the round.
    Ready,
}

/// What a worker thread observed when waking up.
pub(crate) enum Wake {
    /// The worker is a participant of a new parallel round.
    Round,
    /// A fire-and-forget task to run.
    Task(Task),
    /// The pool is shutting down.
    Finished,
}

/// Commands observable by the worker threads.
struct Inbox {
    /// Generation of the current parallel round.
    round: u64,
    /// Number of workers participating in the current round. Workers with a
    /// larger index sit the round out.
    participants: usize,
    /// Queued fire-and-forget tasks.
    tasks: VecDeque<Task>,
    /// Set when the pool is shutting down.
    finished: bool,
}

/// Context shared between the dispatching thread and the worker threads.
struct SharedContext {
    /// Inbox of commands for the worker threads.
    inbox: Mutex<Inbox>,
    /// Signalled whenever the inbox changes.
    inbox_signal: Condvar,
    /// Bumped on every inbox update; spun on by idle workers under the
    /// low-latency hint, on its own cache line so that spinning doesn't
    /// disturb the other shared counters.
    epoch: CachePadded<AtomicU64>,
    /// Whether idle workers may currently spin.
    spinning: AtomicBool,
    /// Whether this pool was built with the low-latency hint.
    low_latency_hint: bool,
    /// Number of workers still active in the current round.
    num_active_threads: CachePadded<AtomicUsize>,
    /// Number of workers that panicked in the current round.
    num_panicking_threads: CachePadded<AtomicUsize>,
    /// Status of the dispatching thread.
    main_status: Status<MainStatus>,
    /// Work closure shared with the participants of the current round.
    work: RwLock<DynLifetimeView<DynWorkFn>>,
}

/// Creates a [`Dispatcher`] paired with `num_threads` [`WorkerGate`]s.
pub(crate) fn make_dispatch_group(
    num_threads: usize,
    low_latency_hint: bool,
) -> (Dispatcher, Vec<WorkerGate>) {
    let shared_context = Arc::new(SharedContext {
        inbox: Mutex::new(Inbox {
            round: 0,
            participants: 0,
            tasks: VecDeque::new(),
            finished: false,
        }),
        inbox_signal: Condvar::new(),
        epoch: CachePadded::new(AtomicU64::new(0)),
        spinning: AtomicBool::new(true),
        low_latency_hint,
        num_active_threads: CachePadded::new(AtomicUsize::new(0)),
        num_panicking_threads: CachePadded::new(AtomicUsize::new(0)),
        main_status: Status::new(MainStatus::Waiting),
        work: RwLock::new(DynLifetimeView::empty()),
    });

    let gates = (0..num_threads)
        .map(|id| WorkerGate {
            id,
            last_round: 0,
            last_epoch: 0,
            shared_context: shared_context.clone(),
        })
        .collect();

    let dispatcher = Dispatcher { shared_context };

    (dispatcher, gates)
}

/// The dispatching side: publishes rounds and tasks to the worker threads.
pub(crate) struct Dispatcher {
    shared_context: Arc<SharedContext>,
}

impl Dispatcher {
    /// Publishes a new parallel round running `work` on `participants`
    /// workers, `participants >= 1`. The closure is borrowed by the workers
    /// until [`join_round()`](Self::join_round) returns; the caller must pair
    /// every `begin_round()` with a `join_round()` before the closure goes
    /// out of scope, including on its own panic path.
    pub fn begin_round(&self, work: &(dyn Fn(usize) + Sync), participants: usize) {
        debug_assert!(participants >= 1);
        self.shared_context
            .num_active_threads
            .store(participants, Ordering::SeqCst);

        // Safety note: The reference set here is valid until the call to
        // `clear()` in `join_round()`, which runs after all the participants
        // are done reading it (as synchronized with `main_status`).
        self.shared_context.work.write().unwrap().set(work);

        {
            let mut inbox = self.shared_context.inbox.lock().unwrap();
            inbox.round = inbox.round.wrapping_add(1);
            inbox.participants = participants;
            log_debug!(
                "[dispatcher, round {}] Dispatching to {participants} worker(s).",
                inbox.round
            );
        }
        self.shared_context.epoch.fetch_add(1, Ordering::Release);
        self.shared_context.inbox_signal.notify_all();
    }

    /// Waits for all participants of the current round to finish, then
    /// invalidates the shared work closure. Returns the number of
    /// participants that panicked during the round.
    pub fn join_round(&self) -> usize {
        let mut guard = self
            .shared_context
            .main_status
            .wait_while(|status| *status == MainStatus::Waiting);
        assert_eq!(*guard, MainStatus::Ready);
        *guard = MainStatus::Waiting;
        drop(guard);

        log_debug!("[dispatcher] All participants finished the round.");
        // Safety note: the reference (previously set in `begin_round()`) is
        // cleared here after all the participants are done reading it (as
        // synchronized with `main_status`).
        self.shared_context.work.write().unwrap().clear();

        self.shared_context
            .num_panicking_threads
            .swap(0, Ordering::SeqCst)
    }

    /// Enqueues a fire-and-forget task on some worker thread.
    pub fn schedule(&self, task: Task) {
        {
            let mut inbox = self.shared_context.inbox.lock().unwrap();
            inbox.tasks.push_back(task);
        }
        self.shared_context.epoch.fetch_add(1, Ordering::Release);
        self.shared_context.inbox_signal.notify_all();
    }

    /// Notifies the worker threads to exit once the task queue drains.
    pub fn finish_workers(&self) {
        log_debug!("[dispatcher] Notifying threads to finish...");
        {
            let mut inbox = self.shared_context.inbox.lock().unwrap();
            inbox.finished = true;
        }
        self.shared_context.epoch.fetch_add(1, Ordering::Release);
        self.shared_context.inbox_signal.notify_all();
    }

    /// Allows or forbids idle workers to spin. Spinning also requires the
    /// pool-construction low-latency hint.
    pub fn set_spinning(&self, enabled: bool) {
        self.shared_context.spinning.store(enabled, Ordering::Relaxed);
    }
}

/// The worker side: waits for rounds and tasks from the dispatcher.
pub(crate) struct WorkerGate {
    /// Worker index.
    id: usize,
    /// Generation of the last round observed by this worker.
    last_round: u64,
    /// Epoch at the last inbox observation, the spin exit condition.
    last_epoch: u64,
    /// Context shared with the dispatcher.
    shared_context: Arc<SharedContext>,
}

impl WorkerGate {
    /// Blocks until there is something for this worker to do.
    pub fn wait(&mut self) -> Wake {
        if self.shared_context.low_latency_hint
            && self.shared_context.spinning.load(Ordering::Relaxed)
        {
            for _ in 0..SPIN_ITERATIONS {
                if self.shared_context.epoch.load(Ordering::Acquire) != self.last_epoch {
                    break;
                }
                std::hint::spin_loop();
            }
        }

        let mut inbox = self.shared_context.inbox.lock().unwrap();
        loop {
            self.last_epoch = self.shared_context.epoch.load(Ordering::Acquire);
            if inbox.round != self.last_round {
                self.last_round = inbox.round;
                if self.id < inbox.participants {
                    log_debug!(
                        "[thread {}, round {}] Received start signal. Processing...",
                        self.id,
                        inbox.round
                    );
                    return Wake::Round;
                }
                // This round doesn't involve this worker.
                continue;
            }
            if let Some(task) = inbox.tasks.pop_front() {
                return Wake::Task(task);
            }
            if inbox.finished {
                log_debug!("[thread {}] Received finish signal", self.id);
                return Wake::Finished;
            }
            inbox = self.shared_context.inbox_signal.wait(inbox).unwrap();
        }
    }

    /// Runs the current round's work closure with the given work-item index.
    ///
    /// Must be called exactly once after [`wait()`](Self::wait) returned
    /// [`Wake::Round`]: the dispatcher counts one completion per participant.
    pub fn run_work(&self, work_item: usize) {
        // Regardless of the outcome (success or panic), we want to notify the
        // dispatching thread that this worker is done with the work closure.
        // This happens when the notifier is dropped (whether at the end of
        // this scope or when a panic is unwound).
        let notifier = Notifier {
            #[cfg(feature = "log")]
            id: self.id,
            shared_context: &self.shared_context,
        };

        {
            let guard = self.shared_context.work.read().unwrap();
            // SAFETY:
            // - The output lifetime doesn't outlive the underlying closure, as
            //   the dispatching thread waits until the [`Notifier`]s from all
            //   participants are dropped before returning from `join_round()`.
            // - The underlying closure isn't mutated during this scope: all
            //   the threads only manipulate immutable references to it.
            let work = unsafe { guard.get() }.expect("no work closure for the current round");
            work(work_item);
        }

        // Explicit drop for clarity.
        drop(notifier);
    }
}

/// Object whose destructor notifies the dispatching thread that a worker has
/// finished its round (or has panicked).
struct Notifier<'a> {
    /// Worker index.
    #[cfg(feature = "log")]
    id: usize,
    /// Context shared with the dispatcher.
    shared_context: &'a SharedContext,
}

impl Drop for Notifier<'_> {
    fn drop(&mut self) {
        // The work closure may panic, and we want to notify the dispatching
        // thread in that case to avoid using garbage output.
        if std::thread::panicking() {
            log_error!(
                "[thread {}] Detected panic in this thread, notifying the dispatcher",
                self.id
            );
            self.shared_context
                .num_panicking_threads
                .fetch_add(1, Ordering::SeqCst);
        }

        let thread_count = self
            .shared_context
            .num_active_threads
            .fetch_sub(1, Ordering::SeqCst);
        assert!(thread_count > 0);

        if thread_count == 1 {
            // We're the last participant: wake up the dispatching thread.
            match self
                .shared_context
                .main_status
                .try_notify_one(MainStatus::Ready)
            {
                Ok(_) => log_debug!("[thread {}] Notified the dispatcher.", self.id),
                Err(e) => {
                    log_error!(
                        "[thread {}] Failed to notify the dispatcher, the mutex was poisoned: {e:?}",
                        self.id
                    );
                    panic!("Failed to notify the dispatcher, the mutex was poisoned: {e:?}");
                }
            }
        } else {
            log_debug!(
                "[thread {}] Waiting for other participants to finish.",
                self.id
            );
        }
    }
}
