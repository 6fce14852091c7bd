//! Memory Blocks and Streams
//!
//! [`MemBlock`] is the (address, size) descriptor every allocator of the
//! runtime hands out and takes back. It is not an owner: whoever allocated
//! the block frees it by passing the descriptor back.
//!
//! [`MemStream`] and [`MemStreamRo`] view a byte region as a stream whose
//! unread part shrinks as bytes are consumed or written.

use std::fmt;
use std::ptr;

use crate::error::{Error, Result};

/// Descriptor of a memory region owned by the caller.
///
/// The free state is `(null, 0)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemBlock {
    addr: *mut u8,
    size: usize,
}

impl MemBlock {
    /// The free block `(null, 0)`.
    pub const FREE: MemBlock = MemBlock {
        addr: ptr::null_mut(),
        size: 0,
    };

    /// Describe the region `[addr, addr + size)`.
    pub const fn new(addr: *mut u8, size: usize) -> Self {
        Self { addr, size }
    }

    /// Start address.
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    /// Start address as integer.
    pub fn addr_usize(&self) -> usize {
        self.addr as usize
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// First address after the block.
    pub fn end(&self) -> usize {
        self.addr as usize + self.size
    }

    /// Whether this is the free block.
    pub fn is_free(&self) -> bool {
        self.addr.is_null() && self.size == 0
    }

    /// Whether `addr` lies inside the block.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr as usize && addr < self.end()
    }

    /// Whether `[addr, addr + len)` lies inside the block.
    pub fn contains_range(&self, addr: usize, len: usize) -> bool {
        addr >= self.addr as usize && addr.checked_add(len).is_some_and(|end| end <= self.end())
    }

    /// Reset to the free block.
    pub fn clear(&mut self) {
        *self = Self::FREE;
    }

    /// Remove `n` bytes from the start of the block.
    pub fn shrink_left(&mut self, n: usize) -> Result<()> {
        if n > self.size {
            return Err(Error::InvalidArgument);
        }
        self.addr = self.addr.wrapping_add(n);
        self.size -= n;
        Ok(())
    }

    /// Remove `n` bytes from the end of the block.
    pub fn shrink_right(&mut self, n: usize) -> Result<()> {
        if n > self.size {
            return Err(Error::InvalidArgument);
        }
        self.size -= n;
        Ok(())
    }

    /// Fill every byte of the block with `value`.
    ///
    /// # Safety
    ///
    /// The block must describe writable memory.
    pub unsafe fn fill(&self, value: u8) {
        if !self.addr.is_null() {
            ptr::write_bytes(self.addr, value, self.size);
        }
    }

    /// View the block as a byte slice.
    ///
    /// # Safety
    ///
    /// The block must describe readable memory that stays valid and is not
    /// written through another path for `'a`.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.addr.is_null() {
            return &[];
        }
        std::slice::from_raw_parts(self.addr, self.size)
    }

    /// View the block as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The block must describe writable memory that stays valid and is not
    /// accessed through another path for `'a`.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        if self.addr.is_null() {
            return &mut [];
        }
        std::slice::from_raw_parts_mut(self.addr, self.size)
    }
}

impl Default for MemBlock {
    fn default() -> Self {
        Self::FREE
    }
}

impl fmt::Debug for MemBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemBlock")
            .field("addr", &format_args!("{:#x}", self.addr as usize))
            .field("size", &self.size)
            .finish()
    }
}

/// Writable stream over a byte region.
///
/// `size()` bytes remain between the next position and the end.
pub struct MemStream<'a> {
    rest: &'a mut [u8],
}

impl<'a> MemStream<'a> {
    /// Stream over `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { rest: buf }
    }

    /// Bytes between next and end.
    pub fn size(&self) -> usize {
        self.rest.len()
    }

    /// Whether at least one byte remains.
    pub fn is_next(&self) -> bool {
        !self.rest.is_empty()
    }

    /// Address of the next byte.
    pub fn next(&self) -> *const u8 {
        self.rest.as_ptr()
    }

    /// Advance next by `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        if n > self.rest.len() {
            return Err(Error::InvalidArgument);
        }
        let rest = std::mem::take(&mut self.rest);
        self.rest = &mut rest[n..];
        Ok(())
    }

    /// Write `data` at next and advance. Nothing is written if it does not fit.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.rest.len() {
            return Err(Error::NoMemory);
        }
        let rest = std::mem::take(&mut self.rest);
        let (head, tail) = rest.split_at_mut(data.len());
        head.copy_from_slice(data);
        self.rest = tail;
        Ok(())
    }

    /// Write as much of `data` as fits. Returns the number of bytes written.
    pub fn write_truncated(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.rest.len());
        // n fits by construction
        let _ = self.write(&data[..n]);
        n
    }

    /// Write one byte.
    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.write(&[byte])
    }
}

impl fmt::Write for MemStream<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.write_truncated(s.as_bytes()) == s.len() {
            Ok(())
        } else {
            Err(fmt::Error)
        }
    }
}

/// Read-only stream over a byte region.
#[derive(Debug, Clone, Copy)]
pub struct MemStreamRo<'a> {
    rest: &'a [u8],
}

impl<'a> MemStreamRo<'a> {
    /// Stream over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { rest: data }
    }

    /// Bytes between next and end.
    pub fn size(&self) -> usize {
        self.rest.len()
    }

    /// Whether at least one byte remains.
    pub fn is_next(&self) -> bool {
        !self.rest.is_empty()
    }

    /// Address of the next byte.
    pub fn next(&self) -> *const u8 {
        self.rest.as_ptr()
    }

    /// The unread bytes.
    pub fn as_slice(&self) -> &'a [u8] {
        self.rest
    }

    /// Advance next by `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        if n > self.rest.len() {
            return Err(Error::InvalidArgument);
        }
        self.rest = &self.rest[n..];
        Ok(())
    }

    /// Consume and return the next byte.
    pub fn next_byte(&mut self) -> Option<u8> {
        let (&first, rest) = self.rest.split_first()?;
        self.rest = rest;
        Some(first)
    }

    /// Offset of the first occurrence of `byte` in the unread bytes.
    pub fn find_byte(&self, byte: u8) -> Option<usize> {
        self.rest.iter().position(|&b| b == byte)
    }

    /// Consume bytes up to and including the next `byte`, returning them
    /// without the delimiter.
    pub fn read_until(&mut self, byte: u8) -> Option<&'a [u8]> {
        let pos = self.find_byte(byte)?;
        let line = &self.rest[..pos];
        self.rest = &self.rest[pos + 1..];
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write as _;

    #[test]
    fn test_memblock_free() {
        let block = MemBlock::FREE;
        assert!(block.is_free());
        assert_eq!(block.size(), 0);
        assert_eq!(MemBlock::default(), MemBlock::FREE);
    }

    #[test]
    fn test_memblock_contains() {
        let mut buf = [0u8; 16];
        let block = MemBlock::new(buf.as_mut_ptr(), buf.len());
        let start = buf.as_ptr() as usize;
        assert!(block.contains(start));
        assert!(block.contains(start + 15));
        assert!(!block.contains(start + 16));
        assert!(block.contains_range(start + 8, 8));
        assert!(!block.contains_range(start + 8, 9));
        assert!(!block.contains_range(usize::MAX, 2));
    }

    #[test]
    fn test_memblock_shrink() {
        let mut buf = [0u8; 16];
        let mut block = MemBlock::new(buf.as_mut_ptr(), buf.len());
        block.shrink_left(4).unwrap();
        assert_eq!(block.size(), 12);
        assert_eq!(block.addr_usize(), buf.as_ptr() as usize + 4);
        block.shrink_right(2).unwrap();
        assert_eq!(block.size(), 10);
        assert_eq!(block.shrink_left(11), Err(Error::InvalidArgument));
        assert_eq!(block.size(), 10);
    }

    #[test]
    fn test_memstream_write_and_skip() {
        let mut buf = [0u8; 8];
        {
            let mut stream = MemStream::new(&mut buf);
            stream.write(b"abc").unwrap();
            assert_eq!(stream.size(), 5);
            stream.skip(1).unwrap();
            stream.write_byte(b'z').unwrap();
            assert_eq!(stream.write(b"12345"), Err(Error::NoMemory));
            assert_eq!(stream.size(), 3);
            assert_eq!(stream.write_truncated(b"12345"), 3);
            assert!(!stream.is_next());
        }
        assert_eq!(&buf, b"abc\0z123");
    }

    #[test]
    fn test_memstream_fmt_truncates() {
        let mut buf = [0u8; 4];
        let mut stream = MemStream::new(&mut buf);
        assert!(write!(stream, "{}", 12345).is_err());
        assert_eq!(&buf, b"1234");
    }

    #[test]
    fn test_memstream_ro() {
        let mut stream = MemStreamRo::new(b"ab\ncd");
        assert_eq!(stream.size(), 5);
        assert_eq!(stream.find_byte(b'\n'), Some(2));
        assert_eq!(stream.read_until(b'\n'), Some(&b"ab"[..]));
        assert_eq!(stream.next_byte(), Some(b'c'));
        assert_eq!(stream.skip(2), Err(Error::InvalidArgument));
        stream.skip(1).unwrap();
        assert!(!stream.is_next());
        assert_eq!(stream.next_byte(), None);
    }
}
