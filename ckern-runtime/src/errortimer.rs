//! Error Timers
//!
//! A pre-armed countdown that makes the N-th call of an instrumented
//! operation fail with a chosen error, once. Components that support failure
//! injection own their timers; tests arm them, production code only ever
//! sees a disarmed timer.
//!
//! ```rust,ignore
//! let mut timer = ErrorTimer::new(2, Error::NoMemory);
//! assert!(timer.process().is_ok());
//! assert_eq!(timer.process(), Err(Error::NoMemory));
//! assert!(timer.process().is_ok()); // disarmed after firing
//! ```

use crate::error::{Error, Result};

/// Countdown that fires one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorTimer {
    /// Calls left until the timer fires; 0 means disarmed.
    count: u32,
    /// Error returned when the timer fires.
    err: Option<Error>,
}

impl ErrorTimer {
    /// A disarmed timer.
    pub const DISARMED: ErrorTimer = ErrorTimer { count: 0, err: None };

    /// Arm a timer which fires on the `count`-th call of [`process`](Self::process).
    ///
    /// A `count` of 0 creates a disarmed timer.
    pub fn new(count: u32, err: Error) -> Self {
        Self {
            count,
            err: (count != 0).then_some(err),
        }
    }

    /// Whether the timer will fire in the future.
    pub fn is_armed(&self) -> bool {
        self.count != 0
    }

    /// Calls left until the timer fires.
    pub fn remaining(&self) -> u32 {
        self.count
    }

    /// Count one call. Returns the armed error on the call the timer fires.
    pub fn process(&mut self) -> Result<()> {
        if self.count == 0 {
            return Ok(());
        }
        self.count -= 1;
        if self.count != 0 {
            return Ok(());
        }
        match self.err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Like [`process`](Self::process) but replaces `result` only if it is `Ok`.
    ///
    /// Used on teardown paths where the real result must not be masked.
    pub fn process_result(&mut self, result: Result<()>) -> Result<()> {
        let fired = self.process();
        result.and(fired)
    }

    /// Disarm the timer.
    pub fn disarm(&mut self) {
        *self = Self::DISARMED;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disarmed_never_fires() {
        let mut timer = ErrorTimer::DISARMED;
        for _ in 0..10 {
            assert!(timer.process().is_ok());
        }
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_fires_once_on_nth_call() {
        let mut timer = ErrorTimer::new(3, Error::Errno(3));
        assert!(timer.is_armed());
        assert!(timer.process().is_ok());
        assert!(timer.process().is_ok());
        assert_eq!(timer.process(), Err(Error::Errno(3)));
        assert!(!timer.is_armed());
        assert!(timer.process().is_ok());
    }

    #[test]
    fn test_zero_count_is_disarmed() {
        let timer = ErrorTimer::new(0, Error::NoMemory);
        assert_eq!(timer, ErrorTimer::DISARMED);
    }

    #[test]
    fn test_process_result_keeps_real_error() {
        let mut timer = ErrorTimer::new(1, Error::NoMemory);
        assert_eq!(timer.process_result(Err(Error::Busy)), Err(Error::Busy));
        assert!(!timer.is_armed());

        let mut timer = ErrorTimer::new(1, Error::NoMemory);
        assert_eq!(timer.process_result(Ok(())), Err(Error::NoMemory));
    }
}
