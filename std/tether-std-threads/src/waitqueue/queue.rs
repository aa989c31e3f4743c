//!
//! Explicit-queue waitqueue
//!
//! Blocked threads are kept in a FIFO of waiter nodes. The FIFO is guarded
//! by a private lock that is never the mutex paired with the queue, so a
//! notifier can wake threads whether or not it holds that mutex. A waiter
//! is woken by flagging its node and unparking its native thread; it is
//! removed from the FIFO by whoever wakes it, or by itself when it leaves
//! because of an interruption.
//!

use std::collections::VecDeque;
use std::mem::offset_of;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::SyncError;
use crate::layout::DiagnosticName;
use crate::mutex::{Locked, Mutex};
use crate::thread::{self, current_id, BlockedOn, ThreadId, WakeHook};

use super::{check_held, finish_wait, WaitQueue};

struct Waiter {
    thread: std::thread::Thread,
    id: ThreadId,
    woken: AtomicBool,
}

impl WakeHook for Waiter {
    fn wake(&self) {
        self.thread.unpark();
    }
}

#[repr(C)]
pub struct QueueWaitqueue {
    name: DiagnosticName,
    owner: AtomicU64,
    queue: Locked<VecDeque<Arc<Waiter>>>,
}

const _: () = {
    assert!(offset_of!(QueueWaitqueue, name) == 0);
    assert!(offset_of!(QueueWaitqueue, owner) == 16);
};

impl QueueWaitqueue {
    pub const fn new(name: &'static str) -> Self {
        Self::with_diagnostic_name(DiagnosticName::new(name))
    }

    pub const fn anonymous() -> Self {
        Self::with_diagnostic_name(DiagnosticName::NONE)
    }

    const fn with_diagnostic_name(name: DiagnosticName) -> Self {
        Self {
            name,
            owner: AtomicU64::new(0),
            queue: Locked::new("waitqueue private lock", VecDeque::new()),
        }
    }

    /// Thread that last waited here while holding the paired mutex
    pub fn owner(&self) -> Option<ThreadId> {
        match self.owner.load(Ordering::Relaxed) {
            0 => None,
            raw => Some(ThreadId::from_raw(raw)),
        }
    }

    /// Ids of the blocked threads, oldest first
    pub fn queued(&self) -> Vec<ThreadId> {
        self.queue.lock().iter().map(|waiter| waiter.id).collect()
    }

    fn wake(&self, waiters: Vec<Arc<Waiter>>) {
        for waiter in waiters {
            waiter.thread.unpark();
        }
    }

    /// Unlink `node` if it is still queued. False when a notifier got there
    /// first, meaning a notification was consumed.
    fn unlink(&self, node: &Arc<Waiter>) -> bool {
        let mut queue = self.queue.lock();
        match queue.iter().position(|waiter| Arc::ptr_eq(waiter, node)) {
            Some(index) => {
                queue.remove(index);
                true
            }
            None => false,
        }
    }
}

impl WaitQueue for QueueWaitqueue {
    fn with_name(name: &'static str) -> Self {
        Self::new(name)
    }

    fn wait(&self, mutex: &Mutex) -> Result<(), SyncError> {
        check_held(mutex)?;

        let record = thread::current();
        let node = Arc::new(Waiter {
            thread: std::thread::current(),
            id: current_id(),
            woken: AtomicBool::new(false),
        });
        self.queue.lock().push_back(Arc::clone(&node));
        self.owner.store(node.id.as_raw(), Ordering::Relaxed);

        let blocking = match &record {
            Some(record) => record.register_wait(&*node, BlockedOn::waitqueue(self)),
            None => true,
        };

        mutex.unlock();

        if blocking {
            while !node.woken.load(Ordering::Acquire) {
                if record.as_ref().is_some_and(|r| r.has_pending_interruptions()) {
                    break;
                }
                std::thread::park();
            }
        }

        if let Some(record) = &record {
            record.unregister_wait();
        }

        let notified = !self.unlink(&node);
        finish_wait(record.as_deref(), mutex, || {
            if notified {
                self.notify_one();
            }
        })
    }

    fn notify_one(&self) {
        let woken = {
            let mut queue = self.queue.lock();
            match queue.pop_front() {
                Some(waiter) => {
                    waiter.woken.store(true, Ordering::Release);
                    vec![waiter]
                }
                None => Vec::new(),
            }
        };
        self.wake(woken);
    }

    fn notify_all(&self) {
        let woken: Vec<_> = {
            let mut queue = self.queue.lock();
            queue
                .drain(..)
                .inspect(|waiter| waiter.woken.store(true, Ordering::Release))
                .collect()
        };
        self.wake(woken);
    }

    fn waiters(&self) -> usize {
        self.queue.lock().len()
    }

    fn name(&self) -> Option<&'static str> {
        self.name.as_str()
    }
}

impl std::fmt::Debug for QueueWaitqueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWaitqueue")
            .field("name", &self.name.as_str())
            .field("owner", &self.owner())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waitqueue::tests::*;

    #[test]
    fn test_queue_wait_requires_mutex() {
        check_wait_requires_mutex::<QueueWaitqueue>();
    }

    #[test]
    fn test_queue_no_lost_wakeup() {
        check_no_lost_wakeup::<QueueWaitqueue>();
    }

    #[test]
    fn test_queue_notify_all() {
        check_notify_all::<QueueWaitqueue>();
    }

    #[test]
    fn test_queue_notify_without_waiters() {
        check_notify_without_waiters::<QueueWaitqueue>();
    }

    #[test]
    fn test_queue_holds_each_waiter_once() {
        let shared = Arc::new((Mutex::new("once lock"), QueueWaitqueue::new("once queue")));
        let release = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let shared = Arc::clone(&shared);
                let release = Arc::clone(&release);
                std::thread::spawn(move || {
                    let (mutex, queue) = &*shared;
                    mutex.acquire();
                    while !release.load(Ordering::Relaxed) {
                        queue.wait(mutex).unwrap();
                    }
                    mutex.release().unwrap();
                })
            })
            .collect();

        eventually("three queued waiters", || shared.1.waiters() == 3);
        let mut queued = shared.1.queued();
        queued.sort();
        queued.dedup();
        assert_eq!(queued.len(), 3);
        assert!(shared.1.owner().is_some());

        release.store(true, Ordering::Relaxed);
        shared.1.notify_one();
        eventually("one waiter to leave", || shared.1.waiters() == 2);
        shared.1.notify_all();

        for h in handles {
            h.join().unwrap();
        }
        assert!(shared.1.queued().is_empty());
    }
}
