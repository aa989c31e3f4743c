///
/// # Integration Tests for the threading primitives
///
/// End-to-end scenarios through the public API: mutual exclusion between
/// threads, partial release of a semaphore, interruption of a blocked
/// waiter, and joining a finished thread.
///

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tether_std_core::RuntimeConfig;
use tether_std_threads::{
    registry, Mutex, QueueWaitqueue, Semaphore, StartupPayload, SyncError, Thread, ThreadStatus,
    Value, WaitQueue, Waitqueue,
};

fn setup() {
    registry::init(&RuntimeConfig::default());
}

fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_try_acquire_fails_while_held_elsewhere() {
    let m = Arc::new(Mutex::new("scenario lock"));
    let tried = Arc::new(AtomicBool::new(false));
    m.acquire();

    let contender = {
        let m = Arc::clone(&m);
        let tried = Arc::clone(&tried);
        thread::spawn(move || {
            let first = m.try_acquire();
            tried.store(true, Ordering::Release);
            m.acquire();
            let held = m.is_held_by_current();
            m.release().unwrap();
            (first, held)
        })
    };

    eventually("contender to try", || tried.load(Ordering::Acquire));
    m.release().unwrap();
    assert_eq!(contender.join().unwrap(), (false, true));
    assert!(!m.is_locked());
}

fn check_semaphore_partial_release<Q: WaitQueue + 'static>() {
    let s = Arc::new(Semaphore::<Q>::new("scenario semaphore", 0));
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let s = Arc::clone(&s);
            thread::spawn(move || s.wait_for_count(1))
        })
        .collect();

    eventually("three blocked waiters", || s.waitcount() == 3);
    thread::spawn({
        let s = Arc::clone(&s);
        move || s.signal(2)
    })
    .join()
    .unwrap();

    eventually("two waiters released", || {
        waiters.iter().filter(|w| w.is_finished()).count() == 2
    });
    eventually("third waiter blocked again", || s.waitcount() == 1);

    s.signal(1);
    for w in waiters {
        w.join().unwrap().unwrap();
    }
    assert_eq!(s.count(), 0);
}

#[test]
fn test_semaphore_partial_release() {
    check_semaphore_partial_release::<Waitqueue>();
    check_semaphore_partial_release::<QueueWaitqueue>();
}

fn check_interrupted_waiter<Q: WaitQueue + 'static>() {
    setup();
    let shared = Arc::new((Mutex::new("interrupt lock"), Q::with_name("interrupt queue")));
    let body = Arc::clone(&shared);
    let waiter = Thread::spawn(
        "interrupted waiter",
        StartupPayload::new(&[], move |_| {
            let (mutex, queue) = &*body;
            mutex.acquire();
            loop {
                queue.wait(mutex)?;
            }
        })
        .unwrap(),
    )
    .unwrap();

    eventually("waiter to block", || shared.1.waiters() == 1);
    waiter.post_interruption(|| ControlFlow::Break(())).unwrap();

    // Unwound bodies finish without a result.
    assert!(matches!(waiter.join(), Err(SyncError::NoResult { .. })));
    assert_eq!(waiter.status(), ThreadStatus::Dead);
    assert_eq!(shared.1.waiters(), 0);
    assert!(!shared.0.is_locked());
    assert_eq!(shared.0.owner(), None);

    // The queue still works for other threads.
    shared.0.acquire();
    shared.1.notify_all();
    shared.0.release().unwrap();
}

#[test]
fn test_interruption_unwinds_blocked_waiter() {
    check_interrupted_waiter::<Waitqueue>();
    check_interrupted_waiter::<QueueWaitqueue>();
}

#[test]
fn test_interrupted_waiter_forwards_notification() {
    setup();
    let shared = Arc::new((Mutex::new("forward lock"), QueueWaitqueue::new("forward queue")));
    let ready = Arc::new(AtomicBool::new(false));

    let spawn_waiter = |name: &'static str| {
        let body = Arc::clone(&shared);
        let ready = Arc::clone(&ready);
        Thread::spawn(
            name,
            StartupPayload::new(&[], move |_| {
                let (mutex, queue) = &*body;
                mutex.acquire();
                while !ready.load(Ordering::Acquire) {
                    queue.wait(mutex)?;
                }
                mutex.release()?;
                Ok(vec![1])
            })
            .unwrap(),
        )
        .unwrap()
    };

    let first = spawn_waiter("first waiter");
    eventually("first waiter queued", || shared.1.waiters() == 1);
    let second = spawn_waiter("second waiter");
    eventually("second waiter queued", || shared.1.waiters() == 2);

    // Interrupt the first waiter, then notify once. Whichever order the two
    // land in, the second waiter must be released.
    first.post_interruption(|| ControlFlow::Break(())).unwrap();
    {
        let _guard = shared.0.lock();
        ready.store(true, Ordering::Release);
    }
    shared.1.notify_one();

    assert!(first.join().is_err());
    assert_eq!(second.join().unwrap(), vec![1]);
    assert_eq!(shared.1.waiters(), 0);
}

#[test]
fn test_join_returns_result_once_per_joiner() {
    setup();
    let gate = Arc::new(AtomicBool::new(false));
    let body_gate = Arc::clone(&gate);
    let worker = Thread::spawn(
        "worker",
        StartupPayload::new(&[21], move |args| {
            while !body_gate.load(Ordering::Acquire) {
                thread::yield_now();
            }
            Ok(vec![args[0] * 2])
        })
        .unwrap(),
    )
    .unwrap();

    let before = {
        let worker = Arc::clone(&worker);
        thread::spawn(move || worker.join())
    };
    gate.store(true, Ordering::Release);

    assert_eq!(before.join().unwrap().unwrap(), vec![42 as Value]);
    eventually("native handle cleared", || worker.native_handle() == 0);
    assert_eq!(worker.join().unwrap(), vec![42]);
}
