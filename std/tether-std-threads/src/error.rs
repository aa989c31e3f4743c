///
/// Errors raised by the threading primitives.
///
/// Misuse (releasing an unheld mutex, starting a thread twice, joining a
/// detached thread) and resource exhaustion are reported to the caller.
/// Corruption of shared bookkeeping is not recoverable and goes through
/// `fatal`, which aborts the process.
///

use std::fmt::Display;

use thiserror::Error;
use tether_std_core::{
    STATUS_INTERRUPTED, STATUS_INVALID_ARGUMENT, STATUS_INVALID_STATE, STATUS_NOT_ATTACHED,
    STATUS_NOT_JOINABLE, STATUS_NOT_OWNER, STATUS_THREAD_CREATE, STATUS_UNINITIALIZED,
    STATUS_UNSUPPORTED,
};

use crate::thread::ThreadId;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Mutex '{name}' is not held by thread {caller} (owner: {})", format_owner(*owner))]
    NotOwner {
        name: &'static str,
        caller: ThreadId,
        owner: Option<ThreadId>,
    },

    #[error("Wait interrupted")]
    Interrupted,

    #[error("Thread '{name}' has already been started")]
    AlreadyStarted { name: String },

    #[error("Thread '{name}' is not running")]
    NotRunning { name: String },

    #[error("Thread '{name}' is not joinable")]
    NotJoinable { name: String },

    #[error("Thread '{name}' cannot join itself")]
    JoinSelf { name: String },

    #[error("Thread '{name}' terminated without a result")]
    NoResult { name: String },

    #[error("Result of thread '{name}' was already recorded")]
    ResultAlreadySet { name: String },

    #[error("Operation on thread '{name}' must be performed by that thread")]
    NotCurrentThread { name: String },

    #[error("Failed to create native thread '{name}': {source}")]
    ThreadCreate {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Too many startup arguments: {count} (limit {limit})")]
    TooManyArguments { count: usize, limit: usize },

    #[error("Invalid thread name {name:?}")]
    InvalidName { name: String },

    #[error("Thread registry is not initialized")]
    RegistryUninitialized,

    #[error("Current thread is not attached to the runtime")]
    NotAttached,

    #[error("Signal-handling threads require the strict signal mask configuration")]
    SignalThreadUnavailable,

    #[error("Invalid signal number {0}")]
    InvalidSignal(i32),

    #[error("Signal operation failed: {0}")]
    Signal(#[source] std::io::Error),
}

fn format_owner(owner: Option<ThreadId>) -> String {
    match owner {
        Some(id) => id.to_string(),
        None => "none".to_string(),
    }
}

impl SyncError {
    /// Status code reported to compiled code
    pub fn status_code(&self) -> i64 {
        match self {
            SyncError::NotOwner { .. } => STATUS_NOT_OWNER,
            SyncError::Interrupted => STATUS_INTERRUPTED,
            SyncError::NotJoinable { .. } => STATUS_NOT_JOINABLE,
            SyncError::AlreadyStarted { .. }
            | SyncError::NotRunning { .. }
            | SyncError::JoinSelf { .. }
            | SyncError::NoResult { .. }
            | SyncError::ResultAlreadySet { .. }
            | SyncError::NotCurrentThread { .. } => STATUS_INVALID_STATE,
            SyncError::ThreadCreate { .. } => STATUS_THREAD_CREATE,
            SyncError::RegistryUninitialized => STATUS_UNINITIALIZED,
            SyncError::NotAttached => STATUS_NOT_ATTACHED,
            SyncError::SignalThreadUnavailable | SyncError::Signal(_) => STATUS_UNSUPPORTED,
            SyncError::TooManyArguments { .. }
            | SyncError::InvalidName { .. }
            | SyncError::InvalidSignal(_) => STATUS_INVALID_ARGUMENT,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, SyncError::Interrupted)
    }
}

/// Abort the process after an unrecoverable corruption.
#[cold]
pub fn fatal(message: impl Display) -> ! {
    tracing::error!(%message, "fatal runtime error");
    eprintln!("tether: fatal runtime error: {}", message);
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = SyncError::NotOwner {
            name: "gc lock",
            caller: ThreadId::from_raw(7),
            owner: None,
        };
        assert!(err.to_string().contains("gc lock"));
        assert!(err.to_string().contains("thread 7"));
        assert!(err.to_string().contains("owner: none"));

        let err = SyncError::NotOwner {
            name: "gc lock",
            caller: ThreadId::from_raw(7),
            owner: Some(ThreadId::from_raw(3)),
        };
        assert!(err.to_string().contains("owner: 3"));

        let err = SyncError::NotJoinable {
            name: "finalizer".to_string(),
        };
        assert!(err.to_string().contains("finalizer"));
        assert!(err.to_string().contains("not joinable"));

        let err = SyncError::TooManyArguments { count: 9, limit: 8 };
        assert!(err.to_string().contains("9"));
        assert!(err.to_string().contains("limit 8"));

        let err = SyncError::ThreadCreate {
            name: "worker".to_string(),
            source: std::io::Error::from_raw_os_error(libc::EAGAIN),
        };
        assert!(err.to_string().contains("worker"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(SyncError::Interrupted.status_code(), STATUS_INTERRUPTED);
        assert_eq!(SyncError::NotAttached.status_code(), STATUS_NOT_ATTACHED);
        assert_eq!(SyncError::InvalidSignal(0).status_code(), STATUS_INVALID_ARGUMENT);
        assert_eq!(
            SyncError::AlreadyStarted { name: "t".to_string() }.status_code(),
            STATUS_INVALID_STATE
        );
        assert!(SyncError::Interrupted.is_interrupted());
        assert!(!SyncError::NotAttached.is_interrupted());
    }
}
