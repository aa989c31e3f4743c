//!
//! Waitqueue (condition variable)
//!
//! A waitqueue blocks threads until another thread notifies it, always in
//! partnership with a `Mutex` the waiter holds when it calls `wait`. Two
//! backends share one trait:
//!
//! - `FutexWaitqueue` keeps a token word. A waiter snapshots the token while
//!   still holding the mutex and sleeps on the word; notifying bumps the
//!   token and issues a futex wake. Linux only.
//! - `QueueWaitqueue` keeps an explicit FIFO of blocked threads behind its
//!   own private lock and wakes them individually with `unpark`. Used when
//!   futexes are unavailable, and wherever waiters must be woken without the
//!   paired mutex being involved.
//!
//! `Waitqueue` names the backend selected by the build.
//!
//! Neither backend requires the notifier to hold the paired mutex. Waiters
//! must re-check their predicate in a loop: a wait may end spuriously.
//!
//! ## Interruptions
//!
//! A waiting thread that has a thread record registers a wake hook with it.
//! Posting an interruption to the record fires the hook, the waiter wakes,
//! and runs its pending interruptions with the mutex released. If one of
//! them unwinds, the waiter leaves the queue, passes on any notification it
//! had already consumed, and `wait` returns `SyncError::Interrupted` with
//! the mutex NOT held. Otherwise the wait ends like a spurious wakeup.
//!

#[cfg(target_os = "linux")]
mod futex;
mod queue;

#[cfg(target_os = "linux")]
pub use futex::FutexWaitqueue;
pub use queue::QueueWaitqueue;

use crate::error::SyncError;
use crate::mutex::Mutex;
use crate::thread::Thread;

pub trait WaitQueue: Send + Sync {
    fn with_name(name: &'static str) -> Self
    where
        Self: Sized;

    /// Release `mutex`, block until notified, and re-acquire `mutex`.
    /// The caller must hold `mutex`.
    fn wait(&self, mutex: &Mutex) -> Result<(), SyncError>;

    /// Wake at least one waiter, if any. Which one is unspecified.
    fn notify_one(&self);

    fn notify_all(&self);

    /// Number of threads currently blocked in `wait`
    fn waiters(&self) -> usize;

    fn name(&self) -> Option<&'static str>;
}

#[cfg(all(feature = "futex", target_os = "linux"))]
pub type Waitqueue = FutexWaitqueue;

#[cfg(not(all(feature = "futex", target_os = "linux")))]
pub type Waitqueue = QueueWaitqueue;

fn check_held(mutex: &Mutex) -> Result<(), SyncError> {
    if mutex.is_held_by_current() {
        return Ok(());
    }
    Err(SyncError::NotOwner {
        name: mutex.name().unwrap_or("<anonymous>"),
        caller: crate::thread::current_id(),
        owner: mutex.owner(),
    })
}

/// Common tail of both backends, entered with `mutex` released and the wake
/// hook already removed. `pass_on` forwards a consumed notification when the
/// waiter unwinds instead of returning normally.
fn finish_wait(
    record: Option<&Thread>,
    mutex: &Mutex,
    pass_on: impl FnOnce(),
) -> Result<(), SyncError> {
    if let Some(record) = record {
        if record.has_pending_interruptions() {
            if let Err(err) = record.run_pending_interruptions() {
                pass_on();
                return Err(err);
            }
        }
    }
    mutex.acquire();
    Ok(())
}
