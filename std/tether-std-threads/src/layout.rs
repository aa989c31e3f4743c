//!
//! Fixed Layout of Synchronization Objects
//!
//! Debuggers and crash tools read lock names and owners straight out of
//! memory, so `Mutex`, `FutexWaitqueue` and `QueueWaitqueue` are `#[repr(C)]`
//! with offsets pinned by compile-time assertions. Any change to those
//! offsets must bump `SYNC_LAYOUT_VERSION`.
//!
//! Version 1:
//!
//! ```text
//! Mutex            state: u32 @0   owner: u64 @8    name: {ptr, len} @16
//! FutexWaitqueue   token: u32 @0   waiters: u32 @4  name: {ptr, len} @8
//! QueueWaitqueue   name: {ptr, len} @0              owner: u64 @16
//! ```
//!
//! A name is a pointer/length pair of UTF-8 bytes; a null pointer means the
//! object is anonymous. An owner of 0 means no thread.
//!

use std::ffi::{c_char, CStr};

pub const SYNC_LAYOUT_VERSION: u32 = 1;

/// Exported so external tooling can check which layout a process uses.
#[unsafe(no_mangle)]
pub static TETHER_SYNC_LAYOUT_VERSION: u32 = SYNC_LAYOUT_VERSION;

/// Name of a synchronization object, readable from a raw address
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DiagnosticName {
    ptr: *const u8,
    len: usize,
}

// SAFETY: the pointer only ever refers to immutable 'static bytes.
unsafe impl Send for DiagnosticName {}
unsafe impl Sync for DiagnosticName {}

impl DiagnosticName {
    pub const NONE: DiagnosticName = DiagnosticName {
        ptr: std::ptr::null(),
        len: 0,
    };

    pub const fn new(name: &'static str) -> Self {
        Self {
            ptr: name.as_ptr(),
            len: name.len(),
        }
    }

    /// Name taken from a NUL-terminated string owned by compiled code.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or point to a NUL-terminated string that stays
    /// valid and unmodified for the rest of the process (a static literal).
    pub unsafe fn from_c_str(ptr: *const c_char) -> Self {
        if ptr.is_null() {
            return Self::NONE;
        }
        let bytes = unsafe { CStr::from_ptr(ptr) }.to_bytes();
        match std::str::from_utf8(bytes) {
            Ok(_) => Self {
                ptr: bytes.as_ptr(),
                len: bytes.len(),
            },
            Err(_) => Self::NONE,
        }
    }

    pub fn as_str(&self) -> Option<&'static str> {
        if self.ptr.is_null() {
            return None;
        }
        // SAFETY: constructors only accept 'static UTF-8 bytes.
        unsafe {
            let bytes = std::slice::from_raw_parts(self.ptr, self.len);
            Some(std::str::from_utf8_unchecked(bytes))
        }
    }

    pub fn display(&self) -> &'static str {
        self.as_str().unwrap_or("<anonymous>")
    }
}

impl std::fmt::Debug for DiagnosticName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DiagnosticName").field(&self.as_str()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(DiagnosticName::new("gc lock").as_str(), Some("gc lock"));
        assert_eq!(DiagnosticName::NONE.as_str(), None);
        assert_eq!(DiagnosticName::NONE.display(), "<anonymous>");
    }

    #[test]
    fn test_from_c_str() {
        let name = unsafe { DiagnosticName::from_c_str(c"finalizer queue".as_ptr()) };
        assert_eq!(name.as_str(), Some("finalizer queue"));

        let none = unsafe { DiagnosticName::from_c_str(std::ptr::null()) };
        assert_eq!(none.as_str(), None);
    }
}
