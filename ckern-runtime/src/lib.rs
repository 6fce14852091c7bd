//! # C-kern Runtime Library
//!
//! A thread-local service context on top of raw virtual memory:
//!
//! - **VM Pages**: Aligned OS mappings with guard pages
//! - **Page Cache**: Power-of-two pages from 256 B to 1 MiB carved from large chunks
//! - **Block Array**: Sparse B-tree array built from page-cache pages only
//! - **Heaps**: The system allocator behind an interface, and a test heap
//!   that catches overflow, underflow and double free
//! - **Thread Context**: Every service of a thread, built into the thread's
//!   own store in a fixed order and torn down transactionally
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  THREAD-LOCAL STORE (2 MiB)                      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │ ThreadContext (threadcontext.rs)                         │   │
//! │  │   pagecache ─ mm ─ syncrunner ─ objectcache ─ log        │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │         │              │                           │             │
//! │  ┌──────────────┐ ┌──────────────┐         ┌──────────────┐     │
//! │  │  Page Cache  │ │  Heap/TestMm │         │  LogWriter   │     │
//! │  │(pagecache.rs)│ │(mm, testmm)  │         │(logwriter.rs)│     │
//! │  └──────────────┘ └──────────────┘         └──────────────┘     │
//! │         │                │                                       │
//! │  ┌──────────────┐ ┌──────────────┐                              │
//! │  │ Block Array  │ │   VM Pages   │                              │
//! │  │(blockarray.rs│ │   (vm.rs)    │                              │
//! │  └──────────────┘ └──────────────┘                              │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Services are reached through [`IObj`]s: a pointer to the object plus the
//! vtable of its interface trait.
//!
//! ## Example
//!
//! ```rust,ignore
//! use ckern_runtime::{init_from_env, thread, threadcontext};
//!
//! let pc = init_from_env();
//! let handle = thread::spawn(&pc, || {
//!     threadcontext::with_current(|tc| {
//!         let mm = tc.mm().unwrap();
//!         let mut block = mm.malloc(128).unwrap();
//!         mm.mfree(&mut block).unwrap();
//!     });
//!     0
//! })?;
//! assert_eq!(handle.join()?, 0);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod blockarray;
pub mod config;
pub mod error;
pub mod errortimer;
pub mod iobj;
pub(crate) mod list;
pub mod log;
pub mod logwriter;
pub mod memblock;
pub mod mm;
pub mod objectcache;
pub mod pagecache;
pub mod process;
pub mod syncrunner;
pub mod testmm;
pub mod thread;
pub mod threadcontext;
pub mod threadlocalstore;
pub mod vm;

use std::sync::Arc;

pub use blockarray::{BlockArray, TypedBlockArray};
pub use config::{ConfigError, RuntimeConfig, RuntimeConfigBuilder};
pub use error::{Error, Result, EINVARIANT};
pub use errortimer::ErrorTimer;
pub use iobj::IObj;
pub use log::{Log, LogChannel, LogMain, LogState};
pub use memblock::MemBlock;
pub use mm::{Mm, MmImpl};
pub use pagecache::{PageCache, PageCacheImpl, PageSize};
pub use process::ProcessContext;
pub use testmm::TestMm;
pub use thread::{spawn, ThreadHandle};
pub use threadcontext::{ContextType, ThreadContext};
pub use threadlocalstore::{ThreadLocalStore, STORE_SIZE};
pub use vm::{AccessMode, VmPage};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create the process context with `config`.
pub fn init_with_runtime_config(config: RuntimeConfig) -> Arc<ProcessContext> {
    Arc::new(ProcessContext::new(config))
}

/// Create the process context from environment variables.
///
/// Reads configuration from `CKERN_*` environment variables.
/// See `RuntimeConfig::from_env()` for the full list of supported variables.
pub fn init_from_env() -> Arc<ProcessContext> {
    init_with_runtime_config(RuntimeConfig::from_env())
}
