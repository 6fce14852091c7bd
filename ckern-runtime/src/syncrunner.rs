//! Cooperative function runner of a thread.
//!
//! Functions queued with [`SyncRunner::add`] are called once per
//! [`SyncRunner::run_once`] until they report [`SyncStatus::Exit`].

use std::fmt;

/// What a queued function wants after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Run again next time.
    Continue,
    /// Remove from the queue.
    Exit,
}

/// A queued function.
pub type SyncFunc = Box<dyn FnMut() -> SyncStatus>;

/// Queue of cooperative functions.
#[derive(Default)]
pub struct SyncRunner {
    queue: Vec<SyncFunc>,
    running: bool,
}

impl SyncRunner {
    /// Create an empty runner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `func`.
    pub fn add(&mut self, func: impl FnMut() -> SyncStatus + 'static) {
        self.queue.push(Box::new(func));
    }

    /// Number of queued functions.
    pub fn size(&self) -> usize {
        self.queue.len()
    }

    /// Call every queued function once and drop those which exit.
    ///
    /// Returns the number of functions called.
    pub fn run_once(&mut self) -> usize {
        if self.running {
            return 0;
        }
        self.running = true;
        let called = self.queue.len();
        self.queue.retain_mut(|func| func() == SyncStatus::Continue);
        self.running = false;
        called
    }

    /// Drop every queued function without calling it.
    pub fn terminate(&mut self) {
        if !self.queue.is_empty() {
            tracing::debug!(dropped = self.queue.len(), "sync runner terminated");
        }
        self.queue.clear();
    }
}

impl fmt::Debug for SyncRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncRunner")
            .field("queued", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_run_until_exit() {
        let mut runner = SyncRunner::new();
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        runner.add(move || {
            counter.set(counter.get() + 1);
            if counter.get() == 3 {
                SyncStatus::Exit
            } else {
                SyncStatus::Continue
            }
        });
        runner.add(|| SyncStatus::Exit);
        assert_eq!(runner.size(), 2);

        assert_eq!(runner.run_once(), 2);
        assert_eq!(runner.size(), 1);
        assert_eq!(runner.run_once(), 1);
        assert_eq!(runner.run_once(), 1);
        assert_eq!(runner.size(), 0);
        assert_eq!(calls.get(), 3);
        assert_eq!(runner.run_once(), 0);
    }

    #[test]
    fn test_terminate() {
        let mut runner = SyncRunner::new();
        runner.add(|| SyncStatus::Continue);
        runner.add(|| SyncStatus::Continue);
        runner.terminate();
        assert_eq!(runner.size(), 0);
    }
}
