//! Process Context
//!
//! State shared by every thread of a process: the runtime configuration, the
//! thread-id counter and the failure-injection timers of thread context
//! construction and teardown.
//!
//! A thread context keeps an `Arc<ProcessContext>` for its lifetime.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ckern_runtime::{ProcessContext, RuntimeConfig};
//!
//! let pc = Arc::new(ProcessContext::new(RuntimeConfig::from_env()));
//! let handle = ckern_runtime::thread::spawn(&pc, || 0)?;
//! assert_eq!(handle.join()?, 0);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::errortimer::ErrorTimer;

/// Process-wide state.
#[derive(Debug)]
pub struct ProcessContext {
    config: RuntimeConfig,
    /// Next id handed to a non-main thread.
    next_thread_id: AtomicUsize,
    initialized: bool,
    init_timer: Mutex<ErrorTimer>,
    free_timer: Mutex<ErrorTimer>,
}

impl ProcessContext {
    /// An initialised process context using `config`.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            next_thread_id: AtomicUsize::new(0),
            initialized: true,
            init_timer: Mutex::new(ErrorTimer::DISARMED),
            free_timer: Mutex::new(ErrorTimer::DISARMED),
        }
    }

    /// The process context before initialisation. Thread contexts refuse it.
    pub fn new_static() -> Self {
        Self {
            initialized: false,
            ..Self::new(RuntimeConfig::default())
        }
    }

    /// Runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Whether the context was initialised.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Current value of the thread-id counter.
    pub fn thread_id_counter(&self) -> usize {
        self.next_thread_id.load(Ordering::SeqCst)
    }

    /// Make the `timer`-th next construction step of a thread context fail.
    pub fn set_init_err(&self, timer: ErrorTimer) {
        *self.init_timer.lock() = timer;
    }

    /// Make the `timer`-th next teardown step of a thread context fail.
    pub fn set_free_err(&self, timer: ErrorTimer) {
        *self.free_timer.lock() = timer;
    }

    /// Assign a thread id. The main thread is 1 and restarts the counter
    /// at 2; every other thread gets the next counter value above 1.
    pub(crate) fn next_thread_id(&self, is_main: bool) -> usize {
        if is_main {
            self.next_thread_id.store(2, Ordering::SeqCst);
            return 1;
        }
        loop {
            let id = self.next_thread_id.fetch_add(1, Ordering::SeqCst);
            if id > 1 {
                return id;
            }
        }
    }

    /// Called when the main thread context is freed.
    pub(crate) fn reset_thread_ids(&self) {
        self.next_thread_id.store(0, Ordering::SeqCst);
    }

    pub(crate) fn process_init_err(&self) -> Result<()> {
        self.init_timer.lock().process()
    }

    pub(crate) fn process_free_err(&self, result: Result<()>) -> Result<()> {
        self.free_timer.lock().process_result(result)
    }
}

impl Default for ProcessContext {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_static_context() {
        let pc = ProcessContext::new_static();
        assert!(!pc.is_initialized());
        assert!(ProcessContext::default().is_initialized());
    }

    #[test]
    fn test_thread_ids() {
        let pc = ProcessContext::default();
        assert_eq!(pc.next_thread_id(false), 2);
        assert_eq!(pc.next_thread_id(false), 3);
        assert_eq!(pc.next_thread_id(true), 1);
        assert_eq!(pc.thread_id_counter(), 2);
        assert_eq!(pc.next_thread_id(false), 2);
        pc.reset_thread_ids();
        assert_eq!(pc.thread_id_counter(), 0);
    }

    #[test]
    fn test_thread_ids_skip_wrap() {
        let pc = ProcessContext::default();
        pc.next_thread_id.store(usize::MAX, Ordering::SeqCst);
        assert_eq!(pc.next_thread_id(false), usize::MAX);
        // 0 and 1 are skipped after the wrap
        assert_eq!(pc.next_thread_id(false), 2);
    }

    #[test]
    fn test_timers() {
        let pc = ProcessContext::default();
        pc.set_init_err(ErrorTimer::new(2, Error::NoMemory));
        assert!(pc.process_init_err().is_ok());
        assert_eq!(pc.process_init_err(), Err(Error::NoMemory));
        assert!(pc.process_init_err().is_ok());

        pc.set_free_err(ErrorTimer::new(1, Error::Busy));
        // a real failure is not masked by the injected one
        assert_eq!(pc.process_free_err(Err(Error::InvalidArgument)), Err(Error::InvalidArgument));
        assert!(pc.process_free_err(Ok(())).is_ok());

        pc.set_free_err(ErrorTimer::new(2, Error::Busy));
        assert!(pc.process_free_err(Ok(())).is_ok());
        assert_eq!(pc.process_free_err(Ok(())), Err(Error::Busy));
    }
}
