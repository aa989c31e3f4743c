//!
//! Mutex Implementation
//!
//! An exclusive lock on a single 32-bit state word:
//! - 0: unlocked
//! - 1: locked, no waiters
//! - 2: locked, possibly with blocked waiters
//!
//! The uncontended path is one compare-and-swap. A contended acquire spins
//! for a configurable number of iterations and then blocks on the state
//! word with a futex wait; release wakes one waiter only when the word says
//! somebody may be sleeping. Builds without futex support keep the same
//! state word and replace the blocking with `yield_now`.
//!
//! The `owner` word records which thread record holds the lock. It is only
//! for diagnostics and the release check, never for handing the lock over.
//!
//! Usage from compiled code:
//! ```text
//! m = tether_mutex_new("symbol table lock")
//! tether_mutex_acquire(m)
//! ...
//! tether_mutex_release(m)
//! ```
//!

use std::alloc::{alloc, dealloc, Layout};
use std::cell::UnsafeCell;
use std::ffi::c_char;
use std::mem::offset_of;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tether_std_core::{set_status, HeapHeader, HeapTag, STATUS_OK};

use crate::error::{fatal, SyncError};
use crate::layout::DiagnosticName;
use crate::thread::{current_id, ThreadId};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

static SPIN_LIMIT: AtomicU32 = AtomicU32::new(tether_std_core::DEFAULT_SPIN_LIMIT);

/// Set how long a contended acquire spins before blocking.
pub fn set_spin_limit(limit: u32) {
    SPIN_LIMIT.store(limit, Ordering::Relaxed);
}

pub fn spin_limit() -> u32 {
    SPIN_LIMIT.load(Ordering::Relaxed)
}

#[repr(C)]
pub struct Mutex {
    state: AtomicU32,
    owner: AtomicU64,
    name: DiagnosticName,
}

const _: () = {
    assert!(offset_of!(Mutex, state) == 0);
    assert!(offset_of!(Mutex, owner) == 8);
    assert!(offset_of!(Mutex, name) == 16);
};

impl Mutex {
    pub const fn new(name: &'static str) -> Self {
        Self::with_name(DiagnosticName::new(name))
    }

    pub const fn anonymous() -> Self {
        Self::with_name(DiagnosticName::NONE)
    }

    pub const fn with_name(name: DiagnosticName) -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            owner: AtomicU64::new(0),
            name,
        }
    }

    pub fn name(&self) -> Option<&'static str> {
        self.name.as_str()
    }

    /// Block until the calling thread holds the lock.
    pub fn acquire(&self) {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.acquire_contended();
        }
        self.owner.store(current_id().as_raw(), Ordering::Relaxed);
    }

    /// Take the lock if it is free. Never blocks.
    pub fn try_acquire(&self) -> bool {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(current_id().as_raw(), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Release a lock held by the calling thread.
    pub fn release(&self) -> Result<(), SyncError> {
        let caller = current_id();
        let owner = self.owner();
        if owner != Some(caller) {
            return Err(SyncError::NotOwner {
                name: self.name.display(),
                caller,
                owner,
            });
        }
        self.unlock();
        Ok(())
    }

    /// Acquire and return a guard releasing on drop.
    pub fn lock(&self) -> MutexGuard<'_> {
        self.acquire();
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_>> {
        if self.try_acquire() {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn owner(&self) -> Option<ThreadId> {
        match self.owner.load(Ordering::Relaxed) {
            0 => None,
            raw => Some(ThreadId::from_raw(raw)),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    pub fn is_held_by_current(&self) -> bool {
        self.owner() == Some(current_id())
    }

    /// Release without the owner check. The caller must hold the lock.
    pub(crate) fn unlock(&self) {
        self.owner.store(0, Ordering::Relaxed);
        self.release_state();
    }

    #[cfg(all(feature = "futex", target_os = "linux"))]
    fn acquire_contended(&self) {
        if self.spin() {
            return;
        }
        tracing::trace!(mutex = self.name.display(), "blocking on contended mutex");
        let mut observed = self.state.swap(CONTENDED, Ordering::Acquire);
        while observed != UNLOCKED {
            crate::sys::futex_wait(&self.state, CONTENDED);
            observed = self.state.swap(CONTENDED, Ordering::Acquire);
        }
    }

    #[cfg(not(all(feature = "futex", target_os = "linux")))]
    fn acquire_contended(&self) {
        loop {
            if self.spin() {
                return;
            }
            std::thread::yield_now();
        }
    }

    /// Busy-wait for the lock to come free. True if it was taken.
    fn spin(&self) -> bool {
        for _ in 0..spin_limit() {
            if self.state.load(Ordering::Relaxed) == UNLOCKED
                && self
                    .state
                    .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return true;
            }
            std::hint::spin_loop();
        }
        false
    }

    #[cfg(all(feature = "futex", target_os = "linux"))]
    fn release_state(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            crate::sys::futex_wake(&self.state, 1);
        }
    }

    #[cfg(not(all(feature = "futex", target_os = "linux")))]
    fn release_state(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("name", &self.name.as_str())
            .field("locked", &self.is_locked())
            .field("owner", &self.owner())
            .finish()
    }
}

pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// A value that is only reachable while its mutex is held
pub struct Locked<T> {
    mutex: Mutex,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is serialized by `mutex`.
unsafe impl<T: Send> Sync for Locked<T> {}

impl<T> Locked<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            mutex: Mutex::new(name),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> LockedGuard<'_, T> {
        self.mutex.acquire();
        LockedGuard { locked: self }
    }

    pub fn try_lock(&self) -> Option<LockedGuard<'_, T>> {
        if self.mutex.try_acquire() {
            Some(LockedGuard { locked: self })
        } else {
            None
        }
    }

    pub fn mutex(&self) -> &Mutex {
        &self.mutex
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for Locked<T> {
    fn default() -> Self {
        Self {
            mutex: Mutex::anonymous(),
            value: UnsafeCell::new(T::default()),
        }
    }
}

pub struct LockedGuard<'a, T> {
    locked: &'a Locked<T>,
}

impl<T> Deref for LockedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the mutex is held.
        unsafe { &*self.locked.value.get() }
    }
}

impl<T> DerefMut for LockedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the mutex is held.
        unsafe { &mut *self.locked.value.get() }
    }
}

impl<T> Drop for LockedGuard<'_, T> {
    fn drop(&mut self) {
        self.locked.mutex.unlock();
    }
}

///
/// Mutex objects for compiled code
///

#[repr(C)]
pub struct TetherMutex {
    pub header: HeapHeader,
    mutex: Mutex,
}

unsafe fn live_mutex<'a>(m: *mut TetherMutex) -> &'a TetherMutex {
    let mutex = unsafe { &*m };
    if !mutex.header.is_live(HeapTag::Mutex) {
        fatal(format_args!("stale or foreign mutex object at {:p}", m));
    }
    mutex
}

/// Create a mutex. `name` must be null or a static NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_mutex_new(name: *const c_char) -> *mut TetherMutex {
    unsafe {
        let layout = Layout::new::<TetherMutex>();
        let ptr = alloc(layout) as *mut TetherMutex;
        if ptr.is_null() {
            std::alloc::handle_alloc_error(layout);
        }

        std::ptr::write(ptr, TetherMutex {
            header: HeapHeader::new(HeapTag::Mutex),
            mutex: Mutex::with_name(DiagnosticName::from_c_str(name)),
        });

        ptr
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_mutex_incref(m: *mut TetherMutex) {
    if !m.is_null() {
        unsafe { live_mutex(m).header.incref(); }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_mutex_decref(m: *mut TetherMutex) {
    if !m.is_null() {
        unsafe {
            if live_mutex(m).header.decref() {
                std::ptr::drop_in_place(m);
                let layout = Layout::new::<TetherMutex>();
                dealloc(m as *mut u8, layout);
            }
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_mutex_acquire(m: *mut TetherMutex) {
    if m.is_null() {
        return;
    }
    unsafe { live_mutex(m).mutex.acquire(); }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_mutex_try_acquire(m: *mut TetherMutex) -> i64 {
    if m.is_null() {
        return 0;
    }
    unsafe { live_mutex(m).mutex.try_acquire() as i64 }
}

/// Returns 1 on success, 0 when the caller does not hold the mutex.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tether_mutex_release(m: *mut TetherMutex) -> i64 {
    if m.is_null() {
        return 0;
    }
    match unsafe { live_mutex(m).mutex.release() } {
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
