//! Log Writer
//!
//! The buffered [`Log`] service of an initialised thread context. Its buffer
//! is carved from the thread's static memory and split evenly between the
//! channels. A buffered channel is flushed as soon as fewer than
//! `flush_threshold` bytes remain in its slice, so a message of up to that
//! size always fits.

use std::fmt::{self, Write as _};

use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::log::{write_channel, Log, LogChannel, LogFlags, LogHeader, LogState, NR_LOGCHANNEL};
use crate::memblock::{MemBlock, MemStream};

#[derive(Debug)]
struct ChannelBuffer {
    start: *mut u8,
    capacity: usize,
    len: usize,
    state: LogState,
}

impl ChannelBuffer {
    fn content(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: [start, start + len) is written part of the slice
        unsafe { std::slice::from_raw_parts(self.start, self.len) }
    }

    fn free_bytes(&self) -> usize {
        self.capacity - self.len
    }

    fn append(&mut self, header: Option<&LogHeader>, args: fmt::Arguments<'_>) {
        // SAFETY: [start + len, start + capacity) is unwritten part of the slice
        let rest = unsafe {
            std::slice::from_raw_parts_mut(self.start.add(self.len), self.capacity - self.len)
        };
        let mut stream = MemStream::new(rest);
        // a message which does not fit is truncated
        if let Some(header) = header {
            let _ = header.write_to(&mut stream);
        }
        let _ = stream.write_fmt(args);
        self.len = self.capacity - stream.size();
    }

    fn flush(&mut self, channel: LogChannel) {
        write_channel(channel, self.content());
        self.len = 0;
    }
}

/// Default state of `channel` in a fresh writer.
pub const fn default_state(channel: LogChannel) -> LogState {
    match channel {
        LogChannel::Err => LogState::Buffered,
        LogChannel::UserErr => LogState::Ignored,
        LogChannel::Console => LogState::Unbuffered,
        LogChannel::Test => LogState::Buffered,
    }
}

/// Buffered log service.
#[derive(Debug)]
pub struct LogWriter {
    buffer: MemBlock,
    channels: [ChannelBuffer; NR_LOGCHANNEL],
    flush_threshold: usize,
}

impl LogWriter {
    /// Create a writer over `buffer`, which must stay valid until
    /// [`free`](Self::free) hands it back.
    pub fn new(buffer: MemBlock, config: &LogConfig) -> Result<LogWriter> {
        let capacity = buffer.size() / NR_LOGCHANNEL;
        if buffer.is_free() || capacity <= config.flush_threshold {
            return Err(Error::InvalidArgument);
        }
        let channels = std::array::from_fn(|i| ChannelBuffer {
            start: buffer.addr().wrapping_add(i * capacity),
            capacity,
            len: 0,
            state: default_state(LogChannel::ALL[i]),
        });
        Ok(LogWriter {
            buffer,
            channels,
            flush_threshold: config.flush_threshold,
        })
    }

    /// Flush every buffered channel and give the buffer back.
    pub fn free(&mut self) -> MemBlock {
        for channel in LogChannel::ALL {
            self.flushbuffer(channel);
        }
        let buffer = self.buffer;
        self.buffer = MemBlock::FREE;
        for channel in &mut self.channels {
            channel.start = std::ptr::null_mut();
            channel.capacity = 0;
            channel.len = 0;
        }
        buffer
    }

    /// Bytes a channel can buffer.
    pub fn channel_capacity(&self) -> usize {
        self.channels[0].capacity
    }

    fn channel(&mut self, channel: LogChannel) -> &mut ChannelBuffer {
        &mut self.channels[channel as usize]
    }
}

impl Log for LogWriter {
    fn printf(
        &mut self,
        channel: LogChannel,
        flags: LogFlags,
        header: Option<&LogHeader>,
        args: fmt::Arguments<'_>,
    ) {
        let threshold = self.flush_threshold;
        let buffer = self.channel(channel);
        match buffer.state {
            LogState::Ignored => {}
            LogState::Unbuffered => {
                // keeps buffered content of a former buffered state in order
                buffer.append(header, args);
                buffer.flush(channel);
            }
            LogState::Buffered => {
                if buffer.free_bytes() < threshold {
                    buffer.flush(channel);
                }
                buffer.append(header, args);
                if flags.contains(LogFlags::LAST) && buffer.free_bytes() < threshold {
                    buffer.flush(channel);
                }
            }
        }
    }

    fn flushbuffer(&mut self, channel: LogChannel) {
        let buffer = self.channel(channel);
        if buffer.len != 0 {
            buffer.flush(channel);
        }
    }

    fn clearbuffer(&mut self, channel: LogChannel) {
        self.channel(channel).len = 0;
    }

    fn getbuffer(&self, channel: LogChannel) -> &[u8] {
        self.channels[channel as usize].content()
    }

    fn getstate(&self, channel: LogChannel) -> LogState {
        self.channels[channel as usize].state
    }

    fn setstate(&mut self, channel: LogChannel, state: LogState) {
        let buffer = self.channel(channel);
        if buffer.state == LogState::Buffered && state != LogState::Buffered {
            buffer.flush(channel);
        }
        buffer.state = state;
    }

    fn compare(&self, channel: LogChannel, text: &[u8]) -> Result<()> {
        if self.getbuffer(channel) == text {
            Ok(())
        } else {
            Err(Error::InvalidArgument)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer(buf: &mut [u8], threshold: usize) -> LogWriter {
        let config = LogConfig {
            buffer_size: buf.len(),
            flush_threshold: threshold,
        };
        LogWriter::new(MemBlock::new(buf.as_mut_ptr(), buf.len()), &config).unwrap()
    }

    #[test]
    fn test_default_states() {
        let mut buf = vec![0u8; 4096];
        let log = writer(&mut buf, 64);
        assert_eq!(log.getstate(LogChannel::Err), LogState::Buffered);
        assert_eq!(log.getstate(LogChannel::UserErr), LogState::Ignored);
        assert_eq!(log.getstate(LogChannel::Console), LogState::Unbuffered);
        assert_eq!(log.getstate(LogChannel::Test), LogState::Buffered);
        assert_eq!(log.channel_capacity(), 1024);
    }

    #[test]
    fn test_buffered_printf_and_compare() {
        let mut buf = vec![0u8; 4096];
        let mut log = writer(&mut buf, 64);
        log.printf(LogChannel::Test, LogFlags::NONE, None, format_args!("a={} ", 1));
        log.printf(LogChannel::Test, LogFlags::LAST, None, format_args!("b={}", 2));
        assert_eq!(log.getbuffer(LogChannel::Test), b"a=1 b=2");
        assert!(log.compare(LogChannel::Test, b"a=1 b=2").is_ok());
        assert_eq!(log.compare(LogChannel::Test, b"a=1"), Err(Error::InvalidArgument));
        log.clearbuffer(LogChannel::Test);
        assert!(log.getbuffer(LogChannel::Test).is_empty());
    }

    #[test]
    fn test_ignored_channel_drops() {
        let mut buf = vec![0u8; 4096];
        let mut log = writer(&mut buf, 64);
        log.printf(LogChannel::UserErr, LogFlags::LAST, None, format_args!("dropped"));
        assert!(log.getbuffer(LogChannel::UserErr).is_empty());
    }

    #[test]
    fn test_header_is_prepended() {
        let mut buf = vec![0u8; 4096];
        let mut log = writer(&mut buf, 64);
        let header = LogHeader::new("alloc", "src/pagecache.rs", 7);
        log.printf(LogChannel::Test, LogFlags::LAST, Some(&header), format_args!("oops"));
        let text = std::str::from_utf8(log.getbuffer(LogChannel::Test)).unwrap();
        assert!(text.contains("] alloc() src/pagecache.rs:7\n"));
        assert!(text.ends_with("\noops"));
        log.clearbuffer(LogChannel::Test);
    }

    #[test]
    fn test_flush_when_nearly_full() {
        let mut buf = vec![0u8; 1024];
        let mut log = writer(&mut buf, 32);
        assert_eq!(log.channel_capacity(), 256);
        let line = "x".repeat(100);
        log.setstate(LogChannel::Test, LogState::Buffered);
        log.printf(LogChannel::Test, LogFlags::LAST, None, format_args!("{}", line));
        log.printf(LogChannel::Test, LogFlags::LAST, None, format_args!("{}", line));
        assert_eq!(log.getbuffer(LogChannel::Test).len(), 200);
        // the third message fills the slice and is flushed
        log.printf(LogChannel::Test, LogFlags::LAST, None, format_args!("{}", line));
        assert!(log.getbuffer(LogChannel::Test).is_empty());
    }

    #[test]
    fn test_leaving_buffered_state_flushes() {
        let mut buf = vec![0u8; 4096];
        let mut log = writer(&mut buf, 64);
        log.printf(LogChannel::Test, LogFlags::LAST, None, format_args!("pending"));
        log.setstate(LogChannel::Test, LogState::Ignored);
        assert!(log.getbuffer(LogChannel::Test).is_empty());
        assert_eq!(log.getstate(LogChannel::Test), LogState::Ignored);
    }

    #[test]
    fn test_free_returns_buffer() {
        let mut buf = vec![0u8; 4096];
        let addr = buf.as_mut_ptr();
        let mut log = writer(&mut buf, 64);
        let block = log.free();
        assert_eq!(block.addr(), addr);
        assert_eq!(block.size(), 4096);
        assert!(log.getbuffer(LogChannel::Err).is_empty());
    }

    #[test]
    fn test_new_rejects_small_buffer() {
        let mut buf = vec![0u8; 256];
        let config = LogConfig {
            buffer_size: 256,
            flush_threshold: 64,
        };
        let result = LogWriter::new(MemBlock::new(buf.as_mut_ptr(), buf.len()), &config);
        assert_eq!(result.unwrap_err(), Error::InvalidArgument);
    }
}
