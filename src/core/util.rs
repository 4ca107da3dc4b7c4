// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::ptr::NonNull;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Attempts to set the status to the given value and notifies one waiting
    /// thread.
    ///
    /// Fails if the [`Mutex`] is poisoned.
    pub fn try_notify_one(&self, t: T) -> Result<(), PoisonError<MutexGuard<'_, T>>> {
        *self.mutex.lock()? = t;
        self.condvar.notify_one();
        Ok(())
    }

    /// Waits until the predicate is true on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify the
    /// status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<T> {
        self.condvar
            .wait_while(self.mutex.lock().unwrap(), predicate)
            .unwrap()
    }
}

/// A proxy trait for types that have a lifetime parameter.
///
/// Because Rust doesn't directly support higher-kinded types, we use a generic
/// associated type with a lifetime parameter to represent that.
pub trait LifetimeParameterized {
    type T<'a>: ?Sized;
}

/// A lifetime-erased reference, where the underlying type is generic over a
/// lifetime. This acts as a [`&'a T<'a>`](reference) but whose lifetime can be
/// adjusted via the `unsafe` function [`get()`](Self::get).
///
/// The dispatcher uses this to share the work closure of the current round,
/// which lives on the dispatching thread's stack, with the worker threads.
pub struct DynLifetimeView<T: LifetimeParameterized> {
    ptr: Option<NonNull<T::T<'static>>>,
}

impl<T: LifetimeParameterized> DynLifetimeView<T> {
    /// Creates a new empty reference.
    pub fn empty() -> Self {
        Self { ptr: None }
    }

    /// Sets the underlying value to the given reference. Subsequent calls to
    /// [`get()`](Self::get) must ensure that the obtained reference doesn't
    /// outlive the reference that was set here.
    // The cast is necessary because the lifetime is coerced to 'static.
    #[allow(clippy::unnecessary_cast)]
    pub fn set(&mut self, value: &T::T<'_>) {
        self.ptr = NonNull::new(NonNull::from(value).as_ptr() as *mut T::T<'static>);
    }

    /// Clears the underlying reference. Subsequent calls to
    /// [`get()`](Self::get) will obtain [`None`].
    pub fn clear(&mut self) {
        self.ptr = None;
    }

    /// Returns the reference that was previously set with [`set()`](Self::set),
    /// or [`None`] if no reference was set or if the last reference was
    /// erased by a call to [`clear()`](Self::clear).
    ///
    /// # Safety
    ///
    /// The underlying object must be valid and not mutated during the whole
    /// output lifetime.
    // The cast is necessary because the lifetime is coerced to 'a.
    #[allow(clippy::unnecessary_cast)]
    pub unsafe fn get<'a>(&self) -> Option<&'a T::T<'a>> {
        self.ptr.map(|static_ptr| {
            let ptr = static_ptr.as_ptr() as *mut T::T<'a>;
            // SAFETY:
            // - This pointer points to a valid initialized `T`, as previously set via
            //   `set()`.
            // - The underlying `T` outlives the output lifetime, as ensured by the caller.
            // - The underlying `T` isn't mutated during the whole output lifetime, as
            //   ensured by the caller.
            unsafe { &*ptr }
        })
    }
}

/// SAFETY:
///
/// A [`DynLifetimeView`] acts as a [`&'a T<'a>`](reference). Therefore it is
/// [`Send`] if and only if `T<'_>` is [`Sync`].
unsafe impl<T: LifetimeParameterized> Send for DynLifetimeView<T> where for<'a> T::T<'a>: Sync {}
/// SAFETY:
///
/// A [`DynLifetimeView`] acts as a [`&'a T<'a>`](reference). Therefore it is
/// [`Sync`] if and only if `T<'_>` is [`Sync`].
unsafe impl<T: LifetimeParameterized> Sync for DynLifetimeView<T> where for<'a> T::T<'a>: Sync {}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, RwLock};

    // A type that doesn't have a lifetime parameter trivially implements
    // `LifetimeParameterized`.
    impl LifetimeParameterized for i32 {
        type T<'a> = Self;
    }

    #[test]
    fn view_basic_usage() {
        let mut view = DynLifetimeView::<i32>::empty();
        assert!(unsafe { view.get() }.is_none());

        let foo = 42;
        view.set(&foo);
        let bar = unsafe { view.get().unwrap() };
        assert_eq!(*bar, 42);

        view.clear();
        assert!(unsafe { view.get() }.is_none());
    }

    struct DynCounterFn;

    impl LifetimeParameterized for DynCounterFn {
        type T<'a> = dyn Fn(usize) + Sync + 'a;
    }

    // The dispatcher's usage pattern: a closure borrowing the current stack
    // frame is shared with other threads for the duration of one round.
    #[test]
    fn view_shares_work_closure() {
        const NUM_THREADS: usize = 2;

        let view = Arc::new(RwLock::new(DynLifetimeView::<DynCounterFn>::empty()));
        let steps: Arc<[_; 2]> = Arc::new(std::array::from_fn(|_| Barrier::new(NUM_THREADS + 1)));

        let counter = AtomicUsize::new(0);
        let work = |amount: usize| {
            counter.fetch_add(amount, Ordering::Relaxed);
        };
        view.write().unwrap().set(&work);

        std::thread::scope(|s| {
            for _ in 0..NUM_THREADS {
                let view = view.clone();
                let steps = steps.clone();
                s.spawn(move || {
                    steps[0].wait();
                    let guard = view.read().unwrap();
                    let f = unsafe { guard.get().unwrap() };
                    f(10);
                    drop(guard);
                    steps[1].wait();
                });
            }

            steps[0].wait();
            steps[1].wait();
        });

        view.write().unwrap().clear();
        assert_eq!(counter.load(Ordering::Relaxed), 10 * NUM_THREADS);
    }

    #[test]
    fn status_notify_wakes_waiter() {
        let status = Arc::new(Status::new(0));

        std::thread::scope(|s| {
            let handle = s.spawn({
                let status = status.clone();
                move || {
                    let guard = status.wait_while(|value| *value == 0);
                    *guard
                }
            });

            status.try_notify_one(7).unwrap();
            assert_eq!(handle.join().unwrap(), 7);
        });
    }
}
