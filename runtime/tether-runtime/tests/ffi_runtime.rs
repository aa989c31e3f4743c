///
/// # Integration Test for the runtime entry points
///
/// Drives the library the way compiled code does: through the exported
/// `extern "C"` functions, from initialization to shutdown. A single test
/// because the registry is process-wide.
///

use std::ffi::CString;
use std::fs;
use tempfile::TempDir;

use tether_runtime::*;

#[test]
fn test_runtime_through_ffi() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let path = temp_dir.path().join(CONFIG_FILE_NAME);
    fs::write(
        &path,
        r#"[threads]
free_list_limit = 4

[mutex]
spin_limit = 10

[logging]
level = "off"
"#,
    )
    .expect("Failed to write config");
    let c_path = CString::new(path.to_str().expect("utf-8 temp path")).expect("no NUL in path");

    let bad = CString::new(temp_dir.path().join("absent.toml").to_str().unwrap()).unwrap();
    assert_eq!(unsafe { tether_runtime_init(bad.as_ptr()) }, 0);
    assert_eq!(tether_status_get(), STATUS_INVALID_ARGUMENT);
    assert!(!registry::is_initialized());

    assert_eq!(unsafe { tether_runtime_init(c_path.as_ptr()) }, 1);
    assert_eq!(tether_status_get(), STATUS_OK);
    assert_eq!(spin_limit(), 10);

    // Mutex handed across threads as a raw object.
    let m = unsafe { tether_mutex_new(c"runtime lock".as_ptr()) };
    unsafe { tether_mutex_acquire(m) };
    let addr = m as usize;
    let released_elsewhere = std::thread::spawn(move || {
        let m = addr as *mut TetherMutex;
        let ok = unsafe { tether_mutex_release(m) };
        (ok, tether_status_get())
    })
    .join()
    .unwrap();
    assert_eq!(released_elsewhere, (0, STATUS_NOT_OWNER));
    assert_eq!(unsafe { tether_mutex_release(m) }, 1);
    unsafe { tether_mutex_decref(m) };

    // Semaphore released by a managed thread.
    let s = unsafe { tether_semaphore_new(c"runtime semaphore".as_ptr(), 0) };
    let s_addr = s as usize;
    let signaller = Thread::spawn(
        "signaller",
        StartupPayload::new(&[3], move |args| {
            let s = s_addr as *mut TetherSemaphore;
            unsafe { tether_semaphore_signal(s, args[0]) };
            Ok(vec![tether_thread_current_id()])
        })
        .unwrap(),
    )
    .unwrap();
    assert_eq!(unsafe { tether_semaphore_wait(s, 3) }, 1);
    let values = signaller.join().unwrap();
    assert_eq!(values, vec![signaller.id().as_raw() as Value]);
    assert_eq!(unsafe { tether_semaphore_count(s) }, 0);
    unsafe { tether_semaphore_decref(s) };

    // A foreign thread attaches, runs a safepoint, and detaches.
    let foreign = std::thread::spawn(|| {
        let id = tether_foreign_attach();
        let record = registry::find(ThreadId::from_raw(id as u64)).expect("registered");
        record
            .post_interruption(|| std::ops::ControlFlow::Continue(()))
            .unwrap();
        let ran = tether_safepoint();
        let detached = tether_foreign_detach();
        (id, ran, detached)
    })
    .join()
    .unwrap();
    assert!(foreign.0 > 0);
    assert_eq!((foreign.1, foreign.2), (1, 1));

    // Records leave the registry before their joiners are released.
    assert_eq!(registry::thread_count(), 0);
    assert_eq!(tether_runtime_shutdown(), 0);
    assert!(!registry::is_initialized());
}
