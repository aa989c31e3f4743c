//!
//! Foreign Threads
//!
//! Native threads created outside the runtime get a record the first time
//! they call into managed code. The record is named "foreign callback", is
//! ephemeral and not joinable, and starts out running. Detaching marks it
//! dead.
//!
//! A thread must detach before it exits, or its record stays registered.
//! A thread that attaches while holding a `Mutex` must release it before
//! detaching: attaching changes the id the mutex records as its owner.
//!

use std::sync::Arc;

use tether_std_core::{set_status, STATUS_OK};

use crate::error::SyncError;
use crate::registry;
use crate::thread::{self, Thread, ThreadKind};

pub const FOREIGN_THREAD_NAME: &str = "foreign callback";

/// Attach the calling thread, or return its existing record.
pub fn attach_current() -> Result<Arc<Thread>, SyncError> {
    if let Some(record) = thread::current() {
        return Ok(record);
    }

    let record = Arc::new(Thread::new_attached(
        FOREIGN_THREAD_NAME.to_string(),
        ThreadKind::Foreign,
    ));
    registry::register_attached(&record)?;
    thread::set_current(Some(Arc::clone(&record)));
    tracing::debug!(id = %record.id(), os_id = record.os_id(), "foreign thread attached");
    Ok(record)
}

/// Detach the calling foreign thread and mark its record dead.
pub fn detach_current() -> Result<(), SyncError> {
    let record = match thread::current() {
        Some(record) if record.kind() == ThreadKind::Foreign => record,
        _ => return Err(SyncError::NotAttached),
    };
    thread::set_current(None);
    record.mark_dead()?;
    tracing::debug!(id = %record.id(), "foreign thread detached");
    Ok(())
}

pub fn is_attached() -> bool {
    thread::current().is_some()
}

struct DetachOnDrop;

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        if let Err(err) = detach_current() {
            tracing::warn!(error = %err, "foreign thread detach failed");
        }
    }
}

/// Run `f` with the calling thread attached. A thread that was not attached
/// before is detached again when `f` returns or panics.
pub fn with_attached<R>(f: impl FnOnce(&Arc<Thread>) -> R) -> Result<R, SyncError> {
    if let Some(record) = thread::current() {
        return Ok(f(&record));
    }
    let record = attach_current()?;
    let _detach = DetachOnDrop;
    Ok(f(&record))
}

/// Attach the calling thread. Returns its thread id, or 0 on failure.
#[unsafe(no_mangle)]
pub extern "C" fn tether_foreign_attach() -> i64 {
    match attach_current() {
        Ok(record) => {
            set_status(STATUS_OK);
            record.id().as_raw() as i64
        }
        Err(err) => {
            set_status(err.status_code());
            0
        }
    }
}

/// Returns 1 on success, 0 when the calling thread was not attached.
#[unsafe(no_mangle)]
pub extern "C" fn tether_foreign_detach() -> i64 {
    match detach_current() {
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
