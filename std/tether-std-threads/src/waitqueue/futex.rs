//!
//! Futex-backed waitqueue
//!
//! The whole queue is one token word. Waiters snapshot the token while they
//! still hold the paired mutex, release it, and sleep for as long as the
//! word still holds the snapshot. Every notification bumps the token before
//! waking, so a notify landing between the release and the futex call makes
//! the futex call return at once instead of being lost.
//!

use std::mem::offset_of;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::SyncError;
use crate::layout::DiagnosticName;
use crate::mutex::Mutex;
use crate::sys::futex_wake;
use crate::thread::{self, BlockedOn, WakeHook};

use super::{check_held, finish_wait, WaitQueue};

#[repr(C)]
pub struct FutexWaitqueue {
    token: AtomicU32,
    waiters: AtomicU32,
    name: DiagnosticName,
}

const _: () = {
    assert!(offset_of!(FutexWaitqueue, token) == 0);
    assert!(offset_of!(FutexWaitqueue, waiters) == 4);
    assert!(offset_of!(FutexWaitqueue, name) == 8);
};

impl FutexWaitqueue {
    pub const fn new(name: &'static str) -> Self {
        Self {
            token: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
            name: DiagnosticName::new(name),
        }
    }

    pub const fn anonymous() -> Self {
        Self {
            token: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
            name: DiagnosticName::NONE,
        }
    }

    fn bump_and_wake(&self, count: i32) {
        self.token.fetch_add(1, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            futex_wake(&self.token, count);
        }
    }
}

impl WakeHook for FutexWaitqueue {
    fn wake(&self) {
        // Other waiters see a spurious wakeup, which the contract allows.
        self.bump_and_wake(i32::MAX);
    }
}

impl WaitQueue for FutexWaitqueue {
    fn with_name(name: &'static str) -> Self {
        Self::new(name)
    }

    fn wait(&self, mutex: &Mutex) -> Result<(), SyncError> {
        check_held(mutex)?;

        let record = thread::current();
        let snapshot = self.token.load(Ordering::SeqCst);
        self.waiters.fetch_add(1, Ordering::SeqCst);

        let blocking = match &record {
            Some(record) => record.register_wait(self, BlockedOn::waitqueue(self)),
            None => true,
        };

        mutex.unlock();

        if blocking {
            while self.token.load(Ordering::SeqCst) == snapshot {
                if record.as_ref().is_some_and(|r| r.has_pending_interruptions()) {
                    break;
                }
                crate::sys::futex_wait(&self.token, snapshot);
            }
        }

        if let Some(record) = &record {
            record.unregister_wait();
        }
        self.waiters.fetch_sub(1, Ordering::AcqRel);

        let notified = self.token.load(Ordering::Acquire) != snapshot;
        finish_wait(record.as_deref(), mutex, || {
            if notified {
                self.notify_one();
            }
        })
    }

    fn notify_one(&self) {
        self.bump_and_wake(1);
    }

    fn notify_all(&self) {
        self.bump_and_wake(i32::MAX);
    }

    fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire) as usize
    }

    fn name(&self) -> Option<&'static str> {
        self.name.as_str()
    }
}

impl std::fmt::Debug for FutexWaitqueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FutexWaitqueue")
            .field("name", &self.name.as_str())
            .field("token", &self.token.load(Ordering::Relaxed))
            .field("waiters", &self.waiters())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waitqueue::tests::*;

    #[test]
    fn test_futex_wait_requires_mutex() {
        check_wait_requires_mutex::<FutexWaitqueue>();
    }

    #[test]
    fn test_futex_no_lost_wakeup() {
        check_no_lost_wakeup::<FutexWaitqueue>();
    }

    #[test]
    fn test_futex_notify_all() {
        check_notify_all::<FutexWaitqueue>();
    }

    #[test]
    fn test_futex_notify_without_waiters() {
        check_notify_without_waiters::<FutexWaitqueue>();
    }

    #[test]
    fn test_notify_bumps_token() {
        let queue = FutexWaitqueue::new("token");
        queue.notify_one();
        queue.notify_all();
        assert_eq!(queue.token.load(Ordering::Relaxed), 2);
    }
}
