//! Object Cache
//!
//! Per-thread cache of objects too large for the stack. It currently holds a
//! single I/O buffer, one 64 KiB page of the thread's page cache, which is
//! lent to one user at a time.

use crate::error::{Error, Result};
use crate::memblock::MemBlock;
use crate::pagecache::{PageCache, PageSize};

/// Page size class of the I/O buffer.
pub const IOBUFFER_PAGESIZE: PageSize = PageSize::Size64K;

/// Interface of an object cache.
pub trait ObjectCache {
    /// Borrow the I/O buffer. Fails with [`Error::Busy`] while it is lent out.
    fn lock_iobuffer(&mut self) -> Result<MemBlock>;

    /// Return the I/O buffer and clear `iobuffer`.
    fn unlock_iobuffer(&mut self, iobuffer: &mut MemBlock) -> Result<()>;
}

/// Object cache with one I/O buffer.
#[derive(Debug)]
pub struct ObjectCacheImpl {
    iobuffer: MemBlock,
    locked: bool,
}

impl ObjectCacheImpl {
    /// Allocate the I/O buffer from `pc`.
    pub fn new(pc: &mut dyn PageCache) -> Result<Self> {
        let iobuffer = pc.alloc_page(IOBUFFER_PAGESIZE)?;
        Ok(Self {
            iobuffer,
            locked: false,
        })
    }

    /// Return the I/O buffer to `pc`, even if it is still lent out.
    pub fn free(&mut self, pc: &mut dyn PageCache) -> Result<()> {
        if self.locked {
            tracing::warn!("object cache freed with locked io buffer");
        }
        self.locked = false;
        pc.release_page(&mut self.iobuffer)
    }

    /// Whether the I/O buffer is lent out.
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl ObjectCache for ObjectCacheImpl {
    fn lock_iobuffer(&mut self) -> Result<MemBlock> {
        if self.locked || self.iobuffer.is_free() {
            return Err(Error::Busy);
        }
        self.locked = true;
        Ok(self.iobuffer)
    }

    fn unlock_iobuffer(&mut self, iobuffer: &mut MemBlock) -> Result<()> {
        if iobuffer.is_free() {
            return Ok(());
        }
        if !self.locked || *iobuffer != self.iobuffer {
            return Err(Error::InvalidArgument);
        }
        self.locked = false;
        iobuffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PageCacheConfig;
    use crate::pagecache::PageCacheImpl;

    #[test]
    fn test_lock_unlock() {
        let mut pc = PageCacheImpl::new(&PageCacheConfig {
            subblocks_per_block: 1,
        });
        let mut cache = ObjectCacheImpl::new(&mut pc).unwrap();
        assert_eq!(pc.size_allocated(), 65536);

        let mut buffer = cache.lock_iobuffer().unwrap();
        assert_eq!(buffer.size(), 65536);
        assert!(cache.is_locked());
        assert_eq!(cache.lock_iobuffer(), Err(Error::Busy));

        let mut wrong = MemBlock::new(buffer.addr(), 4096);
        assert_eq!(cache.unlock_iobuffer(&mut wrong), Err(Error::InvalidArgument));

        cache.unlock_iobuffer(&mut buffer).unwrap();
        assert!(buffer.is_free());
        assert!(!cache.is_locked());

        cache.free(&mut pc).unwrap();
        assert_eq!(pc.size_allocated(), 0);
        assert_eq!(cache.lock_iobuffer(), Err(Error::Busy));
        pc.free().unwrap();
    }
}
