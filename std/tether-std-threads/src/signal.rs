//!
//! Signal-Handling Threads
//!
//! Under the strict signal mask configuration asynchronous signals are not
//! handled on whatever thread the kernel picks. Each such signal is blocked
//! and routed to one dedicated thread that receives it with `sigwait` and
//! runs the handler in ordinary thread context.
//!
//! The signal is blocked in the spawning thread, so the handler thread and
//! every thread created afterwards from it inherit the mask. The runtime
//! spawns these threads during startup, before its other threads exist.
//!

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tether_std_core::SignalConfig;

use crate::error::SyncError;
use crate::registry;
use crate::sys;
use crate::thread::{StartupPayload, Thread, ThreadKind, ThreadStatus, Value};

const MAX_SIGNAL: i32 = 64;

fn validate_signal(signal: i32) -> Result<(), SyncError> {
    if !(1..=MAX_SIGNAL).contains(&signal) || signal == libc::SIGKILL || signal == libc::SIGSTOP {
        return Err(SyncError::InvalidSignal(signal));
    }
    Ok(())
}

pub struct SignalHandlingThread {
    record: Arc<Thread>,
    signal: i32,
    stop: Arc<AtomicBool>,
}

impl SignalHandlingThread {
    /// Block `signal` and start a thread that calls `handler` each time it
    /// arrives.
    pub fn spawn<F>(config: &SignalConfig, signal: i32, handler: F) -> Result<Self, SyncError>
    where
        F: FnMut(i32) + Send + 'static,
    {
        if !config.strict_mask {
            return Err(SyncError::SignalThreadUnavailable);
        }
        validate_signal(signal)?;
        sys::block_signal(signal).map_err(SyncError::Signal)?;

        let stop = Arc::new(AtomicBool::new(false));
        let stopping = Arc::clone(&stop);
        let payload = StartupPayload::new(&[], move |_| {
            let mut handler = handler;
            let mut handled: Value = 0;
            loop {
                let received = sys::wait_signal(signal).map_err(SyncError::Signal)?;
                if stopping.load(Ordering::Acquire) {
                    break;
                }
                handled += 1;
                handler(received);
            }
            Ok(vec![handled])
        })?;

        let record = registry::create_thread(
            format!("signal handler {}", signal),
            false,
            ThreadKind::SignalHandler { signal },
            true,
            payload,
        )?;
        record.start()?;
        tracing::debug!(signal, id = %record.id(), "signal-handling thread started");

        Ok(Self { record, signal, stop })
    }

    /// Send the signal to the handler thread.
    pub fn deliver(&self) -> Result<(), SyncError> {
        let handle = self.record.native_handle();
        if handle == 0 {
            return Err(SyncError::NotRunning {
                name: self.record.name().to_string(),
            });
        }
        sys::send_signal(handle, self.signal).map_err(SyncError::Signal)
    }

    /// Stop the handler thread and return how many signals it handled.
    pub fn stop(self) -> Result<usize, SyncError> {
        self.stop.store(true, Ordering::Release);
        while self.record.status() == ThreadStatus::Created {
            std::thread::yield_now();
        }
        if self.record.status() == ThreadStatus::Running {
            self.deliver()?;
        }
        let values = self.record.join()?;
        Ok(values.first().copied().unwrap_or(0) as usize)
    }

    pub fn signal(&self) -> i32 {
        self.signal
    }

    pub fn record(&self) -> &Arc<Thread> {
        &self.record
    }
}

impl std::fmt::Debug for SignalHandlingThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHandlingThread")
            .field("signal", &self.signal)
            .field("record", &self.record)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waitqueue::tests::eventually;
    use std::sync::atomic::AtomicUsize;
    use tether_std_core::RuntimeConfig;

    fn strict() -> SignalConfig {
        SignalConfig { strict_mask: true }
    }

    #[test]
    fn test_requires_strict_mask() {
        registry::init(&RuntimeConfig::default());
        let err = SignalHandlingThread::spawn(&SignalConfig::default(), libc::SIGUSR1, |_| {})
            .unwrap_err();
        assert!(matches!(err, SyncError::SignalThreadUnavailable));
    }

    #[test]
    fn test_rejects_invalid_signals() {
        registry::init(&RuntimeConfig::default());
        for signal in [0, -1, 65, libc::SIGKILL, libc::SIGSTOP] {
            let err = SignalHandlingThread::spawn(&strict(), signal, |_| {}).unwrap_err();
            assert!(matches!(err, SyncError::InvalidSignal(s) if s == signal));
        }
    }

    #[test]
    fn test_routes_signal_to_handler() {
        registry::init(&RuntimeConfig::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handler = SignalHandlingThread::spawn(&strict(), libc::SIGUSR1, move |signal| {
            assert_eq!(signal, libc::SIGUSR1);
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let record = Arc::clone(handler.record());
        assert_eq!(record.signal(), Some(libc::SIGUSR1));
        assert_eq!(record.kind(), ThreadKind::SignalHandler { signal: libc::SIGUSR1 });

        eventually("handler thread to run", || record.native_handle() != 0);
        handler.deliver().unwrap();
        eventually("first signal", || seen.load(Ordering::SeqCst) == 1);
        handler.deliver().unwrap();
        eventually("second signal", || seen.load(Ordering::SeqCst) == 2);

        assert_eq!(handler.stop().unwrap(), 2);
        assert_eq!(record.status(), ThreadStatus::Dead);
    }

    #[test]
    fn test_stop_before_any_signal() {
        registry::init(&RuntimeConfig::default());
        let handler = SignalHandlingThread::spawn(&strict(), libc::SIGUSR2, |_| {}).unwrap();
        assert_eq!(handler.signal(), libc::SIGUSR2);
        assert_eq!(handler.stop().unwrap(), 0);
    }
}
