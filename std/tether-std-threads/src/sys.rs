//!
//! Native Threading Layer
//!
//! Thin wrappers over the kernel and libc calls the primitives sit on:
//! futex wait/wake, native thread identity, and signal masks.
//!

use std::io;
use std::sync::atomic::AtomicU32;

/// True when the build blocks through futexes.
pub const FUTEX_AVAILABLE: bool = cfg!(all(feature = "futex", target_os = "linux"));

/// Why a futex wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// A wake call was delivered
    Woken,
    /// The word no longer held the expected value
    Changed,
    /// Signal or other spurious return
    Spurious,
}

/// Block while `word` still holds `expected`.
#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32) -> WakeReason {
    // SAFETY: `word` is a live aligned u32 for the whole call; null timeout.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            std::ptr::null::<libc::timespec>(),
        )
    };
    if rc == 0 {
        return WakeReason::Woken;
    }
    match io::Error::last_os_error().raw_os_error() {
        Some(libc::EAGAIN) => WakeReason::Changed,
        _ => WakeReason::Spurious,
    }
}

/// Wake up to `count` threads blocked on `word`. Returns how many woke.
#[cfg(target_os = "linux")]
pub fn futex_wake(word: &AtomicU32, count: i32) -> usize {
    // SAFETY: `word` is a live aligned u32.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            count,
        )
    };
    if rc < 0 { 0 } else { rc as usize }
}

/// Kernel thread id of the caller
#[cfg(target_os = "linux")]
pub fn current_os_id() -> u64 {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn current_os_id() -> u64 {
    native_handle() as u64
}

/// Native handle (`pthread_t`) of the caller, never 0 for a live thread
#[cfg(unix)]
pub fn native_handle() -> usize {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() as usize }
}

/// Block `signal` in the calling thread. Threads it creates inherit the mask.
#[cfg(unix)]
pub fn block_signal(signal: i32) -> io::Result<()> {
    let set = signal_set(signal)?;
    // SAFETY: `set` is an initialized sigset; old mask is not requested.
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

/// Wait for `signal`, which must be blocked in the calling thread.
#[cfg(unix)]
pub fn wait_signal(signal: i32) -> io::Result<i32> {
    let set = signal_set(signal)?;
    let mut received: libc::c_int = 0;
    // SAFETY: both pointers refer to live locals.
    let rc = unsafe { libc::sigwait(&set, &mut received) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(received)
}

/// Send `signal` to the native thread `handle`.
#[cfg(unix)]
pub fn send_signal(handle: usize, signal: i32) -> io::Result<()> {
    // SAFETY: the caller guarantees `handle` names a live thread.
    let rc = unsafe { libc::pthread_kill(handle as libc::pthread_t, signal) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

#[cfg(unix)]
fn signal_set(signal: i32) -> io::Result<libc::sigset_t> {
    // SAFETY: sigset_t is plain data; sigemptyset initializes it.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        if libc::sigaddset(&mut set, signal) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_identity_is_per_thread() {
        let here = (native_handle(), current_os_id());
        assert_ne!(here.0, 0);
        assert_ne!(here.1, 0);

        let there = std::thread::spawn(|| (native_handle(), current_os_id()))
            .join()
            .unwrap();
        assert_ne!(here.0, there.0);
        assert_ne!(here.1, there.1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_futex_wait_returns_on_mismatch() {
        let word = AtomicU32::new(5);
        assert_eq!(futex_wait(&word, 4), WakeReason::Changed);
        assert_eq!(futex_wake(&word, 1), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_futex_wake_releases_waiter() {
        use std::sync::Arc;
        use std::sync::atomic::Ordering;

        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = Arc::clone(&word);
            std::thread::spawn(move || {
                while word.load(Ordering::Acquire) == 0 {
                    futex_wait(&word, 0);
                }
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        word.store(1, Ordering::Release);
        futex_wake(&word, 1);
        waiter.join().unwrap();
    }

    #[test]
    fn test_invalid_signal_set() {
        assert!(signal_set(-1).is_err());
    }
}
