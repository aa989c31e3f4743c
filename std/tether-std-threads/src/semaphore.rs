//!
//! Counting Semaphore
//!
//! A count guarded by a `Mutex`, with a waitqueue for threads waiting for
//! the count to reach their threshold. `signal` wakes every waiter when any
//! are blocked; each re-checks its own threshold, so a waiter asking for
//! more than is available goes back to sleep.
//!
//! Usage from compiled code:
//! ```text
//! s = tether_semaphore_new("free slots", 4)
//! tether_semaphore_wait(s, 1)
//! ...
//! tether_semaphore_signal(s, 1)
//! ```
//!

use std::alloc::{alloc, dealloc, Layout};
use std::ffi::c_char;
use std::sync::atomic::{AtomicUsize, Ordering};

use tether_std_core::{set_status, HeapHeader, HeapTag, STATUS_INVALID_ARGUMENT, STATUS_OK};

use crate::error::{fatal, SyncError};
use crate::layout::DiagnosticName;
use crate::mutex::Mutex;
use crate::waitqueue::{WaitQueue, Waitqueue};

pub struct Semaphore<Q: WaitQueue = Waitqueue> {
    mutex: Mutex,
    queue: Q,
    // Both only change with `mutex` held.
    count: AtomicUsize,
    waitcount: AtomicUsize,
}

impl<Q: WaitQueue> Semaphore<Q> {
    pub fn new(name: &'static str, initial: usize) -> Self {
        Self {
            mutex: Mutex::new(name),
            queue: Q::with_name(name),
            count: AtomicUsize::new(initial),
            waitcount: AtomicUsize::new(0),
        }
    }

    fn with_diagnostic_name(name: DiagnosticName, initial: usize) -> Self {
        Self {
            mutex: Mutex::with_name(name),
            queue: Q::with_name(name.display()),
            count: AtomicUsize::new(initial),
            waitcount: AtomicUsize::new(0),
        }
    }

    /// Block until the count is at least `n`, then take `n`.
    ///
    /// An interruption that unwinds the wait returns `SyncError::Interrupted`
    /// without taking anything.
    pub fn wait_for_count(&self, n: usize) -> Result<(), SyncError> {
        self.mutex.acquire();
        while self.count.load(Ordering::Relaxed) < n {
            self.waitcount.fetch_add(1, Ordering::Relaxed);
            let waited = self.queue.wait(&self.mutex);
            if let Err(err) = waited {
                // The mutex is released when a wait unwinds.
                self.mutex.acquire();
                self.waitcount.fetch_sub(1, Ordering::Relaxed);
                self.unlock();
                return Err(err);
            }
            self.waitcount.fetch_sub(1, Ordering::Relaxed);
        }
        self.count.fetch_sub(n, Ordering::Relaxed);
        self.unlock();
        Ok(())
    }

    /// Take `n` without blocking. False when the count is below `n`.
    pub fn try_wait_for_count(&self, n: usize) -> bool {
        let _guard = self.mutex.lock();
        let count = self.count.load(Ordering::Relaxed);
        if count < n {
            return false;
        }
        self.count.store(count - n, Ordering::Relaxed);
        true
    }

    pub fn signal(&self, n: usize) {
        let _guard = self.mutex.lock();
        self.count.fetch_add(n, Ordering::Relaxed);
        if self.waitcount.load(Ordering::Relaxed) > 0 {
            self.queue.notify_all();
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Threads currently blocked in `wait_for_count`
    pub fn waitcount(&self) -> usize {
        self.waitcount.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> Option<&'static str> {
        self.mutex.name()
    }

    fn unlock(&self) {
        if let Err(err) = self.mutex.release() {
            fatal(format_args!("semaphore lock lost: {}", err));
        }
    }
}

impl<Q: WaitQueue> std::fmt::Debug for Semaphore<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("name", &self.name())
            .field("count", &self.count())
            .field("waitcount", &self.waitcount())
            .finish()
    }
}

///
/// Semaphore objects for compiled code
///

#[repr(C)]
pub struct TetherSemaphore {
    pub header: HeapHeader,
    semaphore: Semaphore,
}

unsafe fn live_semaphore<'a>(s: *mut TetherSemaphore) -> &'a TetherSemaphore {
    let semaphore = unsafe { &*s };
    if !semaphore.header.is_live(HeapTag::Semaphore) {
        fatal(format_args!("stale or foreign semaphore object at {:p}", s));
    }
    semaphore
}

fn count_arg(n: i64) -> Option<usize> {
    match usize::try_from(n) {
        Ok(n) => Some(n),
        Err(_) => {
            set_status(STATUS_INVALID_ARGUMENT);
            None
        }
    }
}

/// Create a semaphore. A negative initial count is treated as 0.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_semaphore_new(name: *const c_char, initial: i64) -> *mut TetherSemaphore {
    unsafe {
        let layout = Layout::new::<TetherSemaphore>();
        let ptr = alloc(layout) as *mut TetherSemaphore;
        if ptr.is_null() {
            std::alloc::handle_alloc_error(layout);
        }

        std::ptr::write(ptr, TetherSemaphore {
            header: HeapHeader::new(HeapTag::Semaphore),
            semaphore: Semaphore::with_diagnostic_name(
                DiagnosticName::from_c_str(name),
                initial.max(0) as usize,
            ),
        });

        ptr
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_semaphore_incref(s: *mut TetherSemaphore) {
    if !s.is_null() {
        unsafe { live_semaphore(s).header.incref(); }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_semaphore_decref(s: *mut TetherSemaphore) {
    if !s.is_null() {
        unsafe {
            if live_semaphore(s).header.decref() {
                std::ptr::drop_in_place(s);
                let layout = Layout::new::<TetherSemaphore>();
                dealloc(s as *mut u8, layout);
            }
        }
    }
}

/// Returns 1 once `n` was taken, 0 when interrupted or `n` is negative.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_semaphore_wait(s: *mut TetherSemaphore, n: i64) -> i64 {
    if s.is_null() {
        return 0;
    }
    let Some(n) = count_arg(n) else {
        return 0;
    };
    match unsafe { live_semaphore(s).semaphore.wait_for_count(n) } {
        Ok(()) => {
            set_status(STATUS_OK);
            1
        }
        Err(err) => {
            set_status(err.status_code());
            0
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_semaphore_signal(s: *mut TetherSemaphore, n: i64) {
    if s.is_null() {
        return;
    }
    if let Some(n) = count_arg(n) {
        unsafe { live_semaphore(s).semaphore.signal(n) };
        set_status(STATUS_OK);
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_semaphore_count(s: *mut TetherSemaphore) -> i64 {
    if s.is_null() {
        return 0;
    }
    unsafe { live_semaphore(s).semaphore.count() as i64 }
}
