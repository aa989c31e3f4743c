//!
//! Runtime Object Header
//!
//! Objects handed out to compiled code (mutexes, semaphores) live on the heap
//! behind a common header. The header carries an atomic reference count and a
//! type tag; entry points check the tag before trusting a pointer so that a
//! stale or foreign pointer is caught instead of silently reused.
//!

use std::sync::atomic::{AtomicUsize, Ordering};

/// Runtime values are 64-bit words.
pub type Value = i64;

/// Type tags for heap objects
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapTag {
    Mutex = 0,
    Semaphore = 1,
}

/// Header for all heap-allocated objects
#[repr(C)]
pub struct HeapHeader {
    pub refcount: AtomicUsize,
    pub tag: HeapTag,
    pub _pad: [u8; 7],
}

impl HeapHeader {
    pub fn new(tag: HeapTag) -> Self {
        Self {
            refcount: AtomicUsize::new(1),
            tag,
            _pad: [0; 7],
        }
    }

    pub fn incref(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decref(&self) -> bool {
        if self.refcount.fetch_sub(1, Ordering::Release) == 1 {
            std::sync::atomic::fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Relaxed)
    }

    /// True when the object carries `tag` and is still referenced.
    pub fn is_live(&self, tag: HeapTag) -> bool {
        self.tag == tag && self.refcount() > 0
    }
}
