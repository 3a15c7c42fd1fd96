//! Compute/present/mutation coordination.
//!
//! Two sync flags and a shared mutex form a priority barrier: at most one of
//! {compute pass, present pass, mutation} runs at a time, and the present
//! thread wins ties because it raises its flag before contending for the
//! mutex. Halt flags park the worker loops while a mutation drains the
//! compute thread out of its readiness barrier.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct HaltFlags {
    compute: bool,
    present: bool,
    /// True while the compute thread sits in its readiness barrier.
    compute_wait: bool,
}

pub(crate) struct Coordinator {
    shared: Mutex<()>,
    compute_cond: Condvar,
    present_cond: Condvar,
    compute_sync: AtomicBool,
    present_sync: AtomicBool,
    halt: Mutex<HaltFlags>,
    halt_cond: Condvar,
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            shared: Mutex::new(()),
            compute_cond: Condvar::new(),
            present_cond: Condvar::new(),
            compute_sync: AtomicBool::new(false),
            present_sync: AtomicBool::new(false),
            halt: Mutex::new(HaltFlags::default()),
            halt_cond: Condvar::new(),
        }
    }

    /// Run one compute pass under the shared mutex, yielding first to a
    /// pending present pass.
    pub fn compute_pass<R>(&self, f: impl FnOnce() -> R) -> R {
        let result = {
            let mut shared = self.shared.lock();
            while self.present_sync.load(Ordering::Acquire) {
                self.compute_cond.wait(&mut shared);
            }
            self.compute_sync.store(true, Ordering::Release);
            let result = f();
            self.compute_sync.store(false, Ordering::Release);
            result
        };
        self.present_cond.notify_all();
        result
    }

    /// Run one present pass under the shared mutex. The priority flag is
    /// raised before contending for the mutex so the compute loop defers its
    /// next pass.
    pub fn present_pass<R>(&self, f: impl FnOnce() -> R) -> R {
        self.present_sync.store(true, Ordering::Release);
        let result = {
            let mut shared = self.shared.lock();
            while self.compute_sync.load(Ordering::Acquire) {
                self.present_cond.wait(&mut shared);
            }
            let result = f();
            self.present_sync.store(false, Ordering::Release);
            result
        };
        self.compute_cond.notify_all();
        result
    }

    /// Total fence for structural mutations: halt both loops, wait for the
    /// compute thread to leave its readiness barrier, then run `f` with both
    /// sync flags held.
    pub fn mutation_fence<R>(&self, f: impl FnOnce() -> R) -> R {
        {
            let mut halt = self.halt.lock();
            halt.compute = true;
            halt.present = true;
            while halt.compute_wait {
                self.halt_cond.wait(&mut halt);
            }
        }

        let result = {
            let _shared = self.shared.lock();
            self.compute_sync.store(true, Ordering::Release);
            self.present_sync.store(true, Ordering::Release);
            let result = f();
            self.compute_sync.store(false, Ordering::Release);
            self.present_sync.store(false, Ordering::Release);
            result
        };
        self.compute_cond.notify_all();
        self.present_cond.notify_all();

        {
            let mut halt = self.halt.lock();
            halt.compute = false;
            halt.present = false;
        }
        self.halt_cond.notify_all();

        result
    }

    pub fn compute_halted(&self) -> bool {
        self.halt.lock().compute
    }

    pub fn present_halted(&self) -> bool {
        self.halt.lock().present
    }

    /// Park the compute thread until the pending mutation finishes.
    pub fn wait_compute_unhalted(&self) {
        let mut halt = self.halt.lock();
        while halt.compute {
            self.halt_cond.wait(&mut halt);
        }
    }

    pub fn enter_ready_barrier(&self) {
        self.halt.lock().compute_wait = true;
    }

    pub fn exit_ready_barrier(&self) {
        {
            self.halt.lock().compute_wait = false;
        }
        self.halt_cond.notify_all();
    }
}
