//!
//! Thread Registry
//!
//! Process-wide bookkeeping of every live thread record, behind the
//! "all threads lock". The registry:
//!
//! - hands out native blocks to new records, reusing the blocks of dead
//!   records from a bounded free list before allocating fresh ones
//! - snapshots the record set for stop-the-world enumeration
//! - must be initialized with `init` before records can be created
//!
//! Dead records on the free list are linked through their own
//! `Lifecycle::Dead { free_next }` slot. A head that is not dead means the
//! list is corrupt, and the process aborts.
//!
//! Lock order: the registry lock is taken before any record lifecycle lock.
//!

use std::collections::BTreeMap;
use std::sync::Arc;

use tether_std_core::{RuntimeConfig, MAX_FREE_LIST_LIMIT};

use crate::error::{fatal, SyncError};
use crate::mutex::{set_spin_limit, Locked};
use crate::thread::{NativeBlock, StartupPayload, Thread, ThreadId, ThreadKind};

struct RegistryState {
    initialized: bool,
    threads: BTreeMap<ThreadId, Arc<Thread>>,
    free_head: Option<Arc<Thread>>,
    free_len: usize,
    free_limit: usize,
    stack_size: usize,
    next_block: u64,
}

impl RegistryState {
    const fn new() -> Self {
        Self {
            initialized: false,
            threads: BTreeMap::new(),
            free_head: None,
            free_len: 0,
            free_limit: 0,
            stack_size: 0,
            next_block: 1,
        }
    }

    fn take_block(&mut self) -> NativeBlock {
        if let Some(head) = self.free_head.take() {
            let Some(next) = head.take_free_next() else {
                fatal(format_args!(
                    "thread free list corrupted: head '{}' ({}) is not dead",
                    head.name(),
                    head.id()
                ));
            };
            self.free_head = next;
            self.free_len -= 1;
            if let Some(block) = head.block() {
                return block;
            }
        }

        let block = NativeBlock {
            index: self.next_block,
            stack_size: self.stack_size,
        };
        self.next_block += 1;
        block
    }
}

static REGISTRY: Locked<RegistryState> = Locked::new("all threads lock", RegistryState::new());

/// Initialize the registry. Returns false if it was already initialized,
/// in which case `config` is ignored.
pub fn init(config: &RuntimeConfig) -> bool {
    let mut state = REGISTRY.lock();
    if state.initialized {
        return false;
    }
    set_spin_limit(config.mutex.spin_limit);
    state.initialized = true;
    state.free_limit = config.threads.free_list_limit.min(MAX_FREE_LIST_LIMIT);
    state.stack_size = config.threads.stack_size;
    tracing::debug!(
        stack_size = state.stack_size,
        free_list_limit = state.free_limit,
        "thread registry initialized"
    );
    true
}

/// Forget every record and recycled block. Threads still running keep
/// their records; they are no longer enumerated. Returns how many live
/// records were dropped.
pub fn teardown() -> usize {
    let (live, free_head) = {
        let mut state = REGISTRY.lock();
        let live = state.threads.len();
        state.threads.clear();
        state.free_len = 0;
        state.initialized = false;
        (live, state.free_head.take())
    };
    // Unlinked one record at a time outside the lock, so dropping the list
    // never recurses through the chain.
    let mut next = free_head;
    while let Some(record) = next {
        next = record.take_free_next().flatten();
    }
    tracing::debug!(live, "thread registry torn down");
    live
}

pub fn is_initialized() -> bool {
    REGISTRY.lock().initialized
}

pub(crate) fn create_thread(
    name: String,
    ephemeral: bool,
    kind: ThreadKind,
    joinable: bool,
    payload: StartupPayload,
) -> Result<Arc<Thread>, SyncError> {
    if name.contains('\0') {
        return Err(SyncError::InvalidName { name });
    }

    let mut state = REGISTRY.lock();
    if !state.initialized {
        return Err(SyncError::RegistryUninitialized);
    }
    let block = state.take_block();
    let record = Arc::new(Thread::new_created(name, ephemeral, kind, block, joinable, payload));
    state.threads.insert(record.id(), Arc::clone(&record));
    Ok(record)
}

/// Register a record created for an already running native thread.
pub(crate) fn register_attached(record: &Arc<Thread>) -> Result<(), SyncError> {
    let mut state = REGISTRY.lock();
    if !state.initialized {
        return Err(SyncError::RegistryUninitialized);
    }
    state.threads.insert(record.id(), Arc::clone(record));
    Ok(())
}

/// Run `mark` under the registry lock, then remove the record. The flag is
/// true when the record was registered, so its block may be recycled.
pub(crate) fn unregister<T>(
    record: &Arc<Thread>,
    mark: impl FnOnce() -> Result<T, SyncError>,
) -> Result<(bool, T), SyncError> {
    let mut state = REGISTRY.lock();
    let marked = mark()?;
    let registered = state.threads.remove(&record.id()).is_some() && state.initialized;
    Ok((registered, marked))
}

/// Keep the native block of an unregistered dead record for reuse.
pub(crate) fn recycle(record: &Arc<Thread>) {
    let mut state = REGISTRY.lock();
    if !state.initialized || state.free_len >= state.free_limit {
        return;
    }
    match record.block() {
        Some(block) if block.stack_size == state.stack_size => {}
        _ => return,
    }

    let previous = state.free_head.take();
    if !record.set_free_next(previous) {
        fatal(format_args!(
            "thread '{}' ({}) retired while not dead",
            record.name(),
            record.id()
        ));
    }
    state.free_head = Some(Arc::clone(record));
    state.free_len += 1;
}

/// Records with `visible` set, in creation order
pub fn enumerate_visible() -> ThreadSnapshot {
    snapshot(|record| record.is_visible())
}

/// Every registered record, ephemeral ones included
pub fn enumerate_all() -> ThreadSnapshot {
    snapshot(|_| true)
}

fn snapshot(filter: impl Fn(&Thread) -> bool) -> ThreadSnapshot {
    let state = REGISTRY.lock();
    let records = state
        .threads
        .values()
        .filter(|record| filter(record))
        .cloned()
        .collect();
    ThreadSnapshot {
        records,
        position: 0,
    }
}

pub fn find(id: ThreadId) -> Option<Arc<Thread>> {
    REGISTRY.lock().threads.get(&id).cloned()
}

/// Number of registered (not yet dead) records
pub fn thread_count() -> usize {
    REGISTRY.lock().threads.len()
}

pub fn free_list_len() -> usize {
    REGISTRY.lock().free_len
}

/// Records registered at the moment of the snapshot. Iterating does not
/// hold the registry lock; `restart` rewinds to the first record.
#[derive(Debug, Clone)]
pub struct ThreadSnapshot {
    records: Vec<Arc<Thread>>,
    position: usize,
}

impl ThreadSnapshot {
    pub fn restart(&mut self) {
        self.position = 0;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.records.iter().any(|record| record.id() == id)
    }
}

impl Iterator for ThreadSnapshot {
    type Item = Arc<Thread>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.get(self.position)?;
        self.position += 1;
        Some(Arc::clone(record))
    }
}
