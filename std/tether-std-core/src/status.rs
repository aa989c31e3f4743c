//!
//! Status Codes for Compiled Code
//!
//! Entry points called from compiled code cannot return Rust errors. They
//! return a plain word and leave the detailed status in thread-local storage,
//! where the caller can inspect it with `tether_status_get`.
//!
//! Status codes:
//! - 0: OK
//! - 1: NotOwner (mutex not held by the caller)
//! - 2: Interrupted (wait abandoned by an interruption)
//! - 3: NotJoinable
//! - 4: InvalidState (double start, dead thread, ...)
//! - 5: ThreadCreate (native thread creation failed)
//! - 6: Uninitialized (runtime not initialized)
//! - 7: NotAttached
//! - 8: Unsupported (configuration does not allow the operation)
//! - 9: InvalidArgument
//!

use std::cell::Cell;

thread_local! {
    static LAST_STATUS: Cell<i64> = const { Cell::new(0) };
}

pub const STATUS_OK: i64 = 0;
pub const STATUS_NOT_OWNER: i64 = 1;
pub const STATUS_INTERRUPTED: i64 = 2;
pub const STATUS_NOT_JOINABLE: i64 = 3;
pub const STATUS_INVALID_STATE: i64 = 4;
pub const STATUS_THREAD_CREATE: i64 = 5;
pub const STATUS_UNINITIALIZED: i64 = 6;
pub const STATUS_NOT_ATTACHED: i64 = 7;
pub const STATUS_UNSUPPORTED: i64 = 8;
pub const STATUS_INVALID_ARGUMENT: i64 = 9;

/// Record the status of the last runtime call on this thread
pub fn set_status(code: i64) {
    LAST_STATUS.with(|status| status.set(code));
}

/// Get the status of the last runtime call on this thread
#[unsafe(no_mangle)]
pub extern "C" fn tether_status_get() -> i64 {
    LAST_STATUS.with(|status| status.get())
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_status_clear() {
    LAST_STATUS.with(|status| status.set(STATUS_OK));
}

/// Check if the last runtime call on this thread failed
#[unsafe(no_mangle)]
pub extern "C" fn tether_status_failed() -> i64 {
    LAST_STATUS.with(|status| if status.get() == STATUS_OK { 0 } else { 1 })
}
