//!
//! tether-std-core - Core Runtime Types
//!
//! This crate provides the fundamental types shared across the tether crates:
//!
//! - `HeapHeader` and `HeapTag` for reference-counted objects handed to compiled code
//! - Status codes recorded per thread by `extern "C"` entry points
//! - `RuntimeConfig`, loaded from `tether.toml`
//! - Logging initialization on top of `tracing-subscriber`
//!
//! All heap objects use atomic reference counting for thread safety.
//!

pub mod value;
pub mod status;
pub mod config;
pub mod logging;

pub use value::*;
pub use status::*;
pub use config::*;
pub use logging::*;
