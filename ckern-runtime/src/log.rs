//! Logging Infrastructure
//!
//! The log service of a thread context. Messages go to one of four
//! channels, each of which is ignored, buffered or written immediately.
//!
//! # Channels
//!
//! | Channel | Output | Purpose |
//! |---------|--------|---------|
//! | `Err` | stderr | errors of the runtime and of services |
//! | `UserErr` | stderr | errors meant for the user of a program |
//! | `Console` | stdout | console output |
//! | `Test` | stdout | output of tests |
//!
//! Two implementations exist: [`LogWriter`](crate::logwriter::LogWriter),
//! owned by an initialised thread context, and [`LogMain`], a stateless sink
//! wired into every context before its log service exists. LogMain never
//! buffers, so it may also be used from signal handlers.
//!
//! # Example
//!
//! ```rust,ignore
//! use ckern_runtime::log_error;
//!
//! log_error!(tc.log(), "cannot map {} bytes: {}", size, err);
//! ```

use std::fmt::{self, Write as _};
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::memblock::MemStream;

/// Number of log channels.
pub const NR_LOGCHANNEL: usize = 4;

/// Log channel enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogChannel {
    /// Runtime and service errors.
    Err = 0,
    /// Errors for the user.
    UserErr = 1,
    /// Console output.
    Console = 2,
    /// Test output.
    Test = 3,
}

impl LogChannel {
    /// All channels in ordinal order.
    pub const ALL: [LogChannel; NR_LOGCHANNEL] = [
        LogChannel::Err,
        LogChannel::UserErr,
        LogChannel::Console,
        LogChannel::Test,
    ];

    /// Get the channel name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogChannel::Err => "ERR",
            LogChannel::UserErr => "USERERR",
            LogChannel::Console => "CONSOLE",
            LogChannel::Test => "TEST",
        }
    }

    /// Get the channel from a u8.
    pub fn from_u8(v: u8) -> Option<Self> {
        LogChannel::ALL.get(v as usize).copied()
    }

    /// Whether output goes to stderr (or stdout).
    pub fn is_stderr(&self) -> bool {
        matches!(self, LogChannel::Err | LogChannel::UserErr)
    }
}

impl fmt::Display for LogChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogState {
    /// Messages are dropped.
    Ignored = 0,
    /// Messages collect in the buffer until it is nearly full or flushed.
    Buffered = 1,
    /// Messages are written immediately.
    Unbuffered = 2,
}

impl LogState {
    /// Get the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogState::Ignored => "IGNORED",
            LogState::Buffered => "BUFFERED",
            LogState::Unbuffered => "UNBUFFERED",
        }
    }
}

impl fmt::Display for LogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flags of a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LogFlags(u8);

impl LogFlags {
    /// Part of a longer message.
    pub const NONE: Self = Self(0);
    /// Last part of a message; a buffered channel may be flushed after it.
    pub const LAST: Self = Self(1);

    /// Check if all bits of `other` are set.
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// Source location printed before a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    /// Function or module name.
    pub func: &'static str,
    /// Source file.
    pub file: &'static str,
    /// Source line.
    pub line: u32,
}

impl LogHeader {
    /// Create a header.
    pub const fn new(func: &'static str, file: &'static str, line: u32) -> Self {
        Self { func, file, line }
    }

    /// Write `[<secs>.<micros>] <func>() <file>:<line>` and a newline.
    pub fn write_to(&self, out: &mut impl fmt::Write) -> fmt::Result {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        writeln!(
            out,
            "[{}.{:06}] {}() {}:{}",
            now.as_secs(),
            now.subsec_micros(),
            self.func,
            self.file,
            self.line
        )
    }
}

/// Interface of a log service.
pub trait Log {
    /// Format `args`, preceded by `header` if given, into `channel`.
    fn printf(
        &mut self,
        channel: LogChannel,
        flags: LogFlags,
        header: Option<&LogHeader>,
        args: fmt::Arguments<'_>,
    );

    /// Write the buffered content of `channel` and clear it.
    fn flushbuffer(&mut self, channel: LogChannel);

    /// Drop the buffered content of `channel`.
    fn clearbuffer(&mut self, channel: LogChannel);

    /// Buffered content of `channel`.
    fn getbuffer(&self, channel: LogChannel) -> &[u8];

    /// State of `channel`.
    fn getstate(&self, channel: LogChannel) -> LogState;

    /// Change the state of `channel`. Leaving the buffered state flushes.
    fn setstate(&mut self, channel: LogChannel, state: LogState);

    /// Compare the buffered content of `channel` with `text`.
    ///
    /// Fails with [`Error::InvalidArgument`] on a mismatch.
    fn compare(&self, channel: LogChannel, text: &[u8]) -> Result<()>;
}

/// Write `bytes` to the output of `channel`.
pub(crate) fn write_channel(channel: LogChannel, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    if channel.is_stderr() {
        let _ = std::io::stderr().write_all(bytes);
    } else {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(bytes);
        let _ = stdout.flush();
    }
}

/// Size of the stack buffer LogMain formats a message into.
const LOGMAIN_BUFFER_SIZE: usize = 512;

/// Unbuffered sink used before a thread has its own log service.
///
/// It has no state: every instance behaves the same, so the thread context
/// refers to it through a dangling, well-aligned pointer.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMain;

impl LogMain {
    /// Fixed state of `channel`.
    pub const fn state(channel: LogChannel) -> LogState {
        match channel {
            LogChannel::UserErr => LogState::Ignored,
            _ => LogState::Unbuffered,
        }
    }
}

impl Log for LogMain {
    fn printf(
        &mut self,
        channel: LogChannel,
        _flags: LogFlags,
        header: Option<&LogHeader>,
        args: fmt::Arguments<'_>,
    ) {
        if LogMain::state(channel) == LogState::Ignored {
            return;
        }
        let mut buffer = [0u8; LOGMAIN_BUFFER_SIZE];
        let mut stream = MemStream::new(&mut buffer);
        // a truncated message is still written
        if let Some(header) = header {
            let _ = header.write_to(&mut stream);
        }
        let _ = stream.write_fmt(args);
        let len = LOGMAIN_BUFFER_SIZE - stream.size();
        write_channel(channel, &buffer[..len]);
    }

    fn flushbuffer(&mut self, _channel: LogChannel) {}

    fn clearbuffer(&mut self, _channel: LogChannel) {}

    fn getbuffer(&self, _channel: LogChannel) -> &[u8] {
        &[]
    }

    fn getstate(&self, channel: LogChannel) -> LogState {
        LogMain::state(channel)
    }

    fn setstate(&mut self, _channel: LogChannel, _state: LogState) {}

    fn compare(&self, _channel: LogChannel, text: &[u8]) -> Result<()> {
        if text.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidArgument)
        }
    }
}

/// Log a formatted message with a source header to a channel.
#[macro_export]
macro_rules! log_printf {
    ($log:expr, $channel:expr, $($arg:tt)*) => {{
        let header = $crate::log::LogHeader::new(module_path!(), file!(), line!());
        $crate::log::Log::printf(
            $log,
            $channel,
            $crate::log::LogFlags::LAST,
            Some(&header),
            format_args!($($arg)*),
        );
    }};
}

/// Log a formatted message to the `Err` channel.
#[macro_export]
macro_rules! log_error {
    ($log:expr, $($arg:tt)*) => {
        $crate::log_printf!($log, $crate::log::LogChannel::Err, $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_from_u8() {
        assert_eq!(LogChannel::from_u8(0), Some(LogChannel::Err));
        assert_eq!(LogChannel::from_u8(3), Some(LogChannel::Test));
        assert_eq!(LogChannel::from_u8(4), None);
    }

    #[test]
    fn test_channel_display() {
        assert_eq!(format!("{}", LogChannel::UserErr), "USERERR");
        assert_eq!(format!("{}", LogState::Unbuffered), "UNBUFFERED");
    }

    #[test]
    fn test_channel_outputs() {
        assert!(LogChannel::Err.is_stderr());
        assert!(LogChannel::UserErr.is_stderr());
        assert!(!LogChannel::Console.is_stderr());
        assert!(!LogChannel::Test.is_stderr());
    }

    #[test]
    fn test_header_format() {
        let header = LogHeader::new("init", "src/threadcontext.rs", 42);
        let mut out = String::new();
        header.write_to(&mut out).unwrap();
        assert!(out.starts_with('['));
        assert!(out.ends_with("] init() src/threadcontext.rs:42\n"));
        let stamp = &out[1..out.find(']').unwrap()];
        let (secs, micros) = stamp.split_once('.').unwrap();
        assert!(secs.parse::<u64>().is_ok());
        assert_eq!(micros.len(), 6);
    }

    #[test]
    fn test_logmain_is_stateless() {
        let mut log = LogMain;
        assert_eq!(log.getstate(LogChannel::Err), LogState::Unbuffered);
        assert_eq!(log.getstate(LogChannel::UserErr), LogState::Ignored);
        log.setstate(LogChannel::Err, LogState::Ignored);
        assert_eq!(log.getstate(LogChannel::Err), LogState::Unbuffered);
        log.printf(LogChannel::UserErr, LogFlags::LAST, None, format_args!("dropped"));
        assert!(log.getbuffer(LogChannel::Err).is_empty());
        assert!(log.compare(LogChannel::Err, b"").is_ok());
        assert_eq!(log.compare(LogChannel::Err, b"x"), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_flags() {
        assert!(LogFlags::LAST.contains(LogFlags::LAST));
        assert!(LogFlags::LAST.contains(LogFlags::NONE));
        assert!(!LogFlags::NONE.contains(LogFlags::LAST));
    }
}
