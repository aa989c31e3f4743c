//!
//! tether-std-threads - Thread and Synchronization Primitives
//!
//! The layer a managed runtime uses to coordinate its own threads and to
//! bridge them to native OS threads.
//!
//! ## Locks and Waiting
//!
//! - `Mutex` - exclusive lock, futex-backed when the `futex` feature is on
//! - `Locked<T>` - data guarded by a `Mutex`
//! - `Waitqueue` - wait/notify paired with a `Mutex`; `FutexWaitqueue` or
//!   `QueueWaitqueue` depending on the build
//! - `Semaphore` - counting semaphore built from a mutex and a waitqueue
//!
//! ## Thread Records
//!
//! Every native thread running managed code has one `Thread` record. The
//! registry tracks all records, hands out snapshots for stop-the-world
//! enumeration, and recycles native memory blocks of dead threads. Records
//! carry a queue of interruptions that the owning thread runs at safepoints
//! and while blocked in a wait.
//!
//! - `foreign` - records for threads that enter from outside the runtime
//! - `signal` - dedicated threads receiving one asynchronous signal
//!

pub mod sys;
pub mod layout;
pub mod error;
pub mod mutex;
pub mod waitqueue;
pub mod semaphore;
pub mod thread;
pub mod registry;
pub mod foreign;
pub mod signal;

pub use error::*;
pub use layout::*;
pub use mutex::*;
pub use waitqueue::*;
pub use semaphore::*;
pub use thread::*;
pub use registry::{enumerate_all, enumerate_visible, ThreadSnapshot};
pub use foreign::*;
pub use signal::*;
