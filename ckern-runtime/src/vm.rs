//! # Virtual Memory Pages
//!
//! The only code of the runtime that talks to the OS memory mapper.
//!
//! ## Design
//!
//! - A [`VmPage`] is a region whose address and size are multiples of the
//!   OS page size. It is created by [`VmPage::new`] and must be returned with
//!   [`VmPage::free`]; there is no `Drop`, owners tear their pages down
//!   explicitly so that errors can be reported.
//! - [`VmPage::protect`] flips the access mode of a mapped range between
//!   [`AccessMode::NONE`] (guard page) and [`AccessMode::RDWR`].
//! - [`mapped_regions`] reads the mapping table of the process, which lets
//!   tests check that guard pages and unmapped ranges are what they claim.
//!
//! Mappings are private, anonymous and `MAP_NORESERVE`: the page cache
//! reserves large address ranges and touches them lazily.

use std::fmt;
use std::sync::OnceLock;

use nix::libc;

use crate::error::{Error, Result};
use crate::memblock::MemBlock;
use crate::pagecache::PageSize;

/// Size of an OS page in bytes.
pub fn pagesize_vm() -> usize {
    static PAGESIZE: OnceLock<usize> = OnceLock::new();
    *PAGESIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            4096
        } else {
            size as usize
        }
    })
}

/// Round `n` up to a multiple of the power of two `align`.
pub(crate) fn align_up(n: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    n.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Access mode of a mapped range.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessMode(u8);

impl AccessMode {
    /// No access (guard page).
    pub const NONE: Self = Self(0);
    /// Readable.
    pub const READ: Self = Self(0b001);
    /// Writable.
    pub const WRITE: Self = Self(0b010);
    /// Readable and writable.
    pub const RDWR: Self = Self(0b011);
    /// Executable.
    pub const EXEC: Self = Self(0b100);
    /// Shared with other processes.
    pub const SHARED: Self = Self(0b1000);

    /// Combine modes.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Check if all bits of `other` are set.
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// The read/write/exec bits only.
    pub const fn access(self) -> Self {
        Self(self.0 & 0b111)
    }

    fn prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

impl fmt::Debug for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |mode: Self, c: char| if self.contains(mode) { c } else { '-' };
        write!(
            f,
            "AccessMode({}{}{}{})",
            flag(Self::READ, 'r'),
            flag(Self::WRITE, 'w'),
            flag(Self::EXEC, 'x'),
            if self.contains(Self::SHARED) { 's' } else { 'p' }
        )
    }
}

/// A range of mapped OS pages.
#[derive(PartialEq, Eq)]
pub struct VmPage {
    addr: *mut u8,
    size: usize,
}

impl VmPage {
    /// The unmapped page `(null, 0)`.
    pub const FREE: VmPage = VmPage {
        addr: std::ptr::null_mut(),
        size: 0,
    };

    /// Map `nbytes` rounded up to the OS page size, readable and writable.
    pub fn new(nbytes: usize) -> Result<VmPage> {
        if nbytes == 0 {
            return Err(Error::InvalidArgument);
        }
        let size = align_up(nbytes, pagesize_vm()).ok_or(Error::NoMemory)?;
        let addr = map_anonymous(size)?;
        Ok(VmPage { addr, size })
    }

    /// Map one page of a page-cache size class.
    pub fn new_class(class: PageSize) -> Result<VmPage> {
        Self::new(class.bytes())
    }

    /// Map `nbytes` at an address aligned to `align`.
    ///
    /// `align` must be a power of two. The range is over-mapped and the
    /// unaligned head and tail are returned to the OS.
    pub fn new_aligned(nbytes: usize, align: usize) -> Result<VmPage> {
        let pagesize = pagesize_vm();
        if nbytes == 0 || !align.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }
        if align <= pagesize {
            return Self::new(nbytes);
        }
        let size = align_up(nbytes, pagesize).ok_or(Error::NoMemory)?;
        let total = size.checked_add(align).ok_or(Error::NoMemory)?;
        let raw = map_anonymous(total)?;
        let start = raw as usize;
        let aligned = (start + align - 1) & !(align - 1);
        let head = aligned - start;
        let tail = total - head - size;
        unsafe {
            if head != 0 {
                unmap(raw, head)?;
            }
            if tail != 0 {
                unmap((aligned + size) as *mut u8, tail)?;
            }
        }
        Ok(VmPage {
            addr: aligned as *mut u8,
            size,
        })
    }

    /// Start address.
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the page is unmapped.
    pub fn is_free(&self) -> bool {
        self.addr.is_null()
    }

    /// Descriptor of the mapped range.
    pub fn as_memblock(&self) -> MemBlock {
        MemBlock::new(self.addr, self.size)
    }

    /// Return the range to the OS. A free page is left alone.
    pub fn free(&mut self) -> Result<()> {
        if self.is_free() {
            return Ok(());
        }
        unsafe { unmap(self.addr, self.size)? };
        *self = Self::FREE;
        Ok(())
    }

    /// Change the access mode of the whole page.
    pub fn protect(&self, mode: AccessMode) -> Result<()> {
        protect_range(self.as_memblock(), mode)
    }
}

impl fmt::Debug for VmPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmPage")
            .field("addr", &format_args!("{:#x}", self.addr as usize))
            .field("size", &self.size)
            .finish()
    }
}

/// Change the access mode of a page-aligned sub-range of a mapping.
///
/// On failure the range stays mapped with its previous mode.
pub fn protect_range(block: MemBlock, mode: AccessMode) -> Result<()> {
    let pagesize = pagesize_vm();
    if block.addr_usize() % pagesize != 0 || block.size() % pagesize != 0 {
        return Err(Error::InvalidArgument);
    }
    if block.size() == 0 {
        return Ok(());
    }
    let rc = unsafe { libc::mprotect(block.addr().cast(), block.size(), mode.prot()) };
    if rc != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

fn map_anonymous(size: usize) -> Result<*mut u8> {
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        let err = Error::last_os_error();
        tracing::debug!(size, %err, "mmap failed");
        return Err(err);
    }
    Ok(addr.cast())
}

unsafe fn unmap(addr: *mut u8, size: usize) -> Result<()> {
    if libc::munmap(addr.cast(), size) != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// One entry of the process mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    /// Start address.
    pub addr: usize,
    /// First address after the region.
    pub end: usize,
    /// Access mode, including [`AccessMode::SHARED`].
    pub mode: AccessMode,
}

impl MappedRegion {
    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.end - self.addr
    }

    fn parse(line: &str) -> Option<MappedRegion> {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let perms = fields.next()?.as_bytes();
        let (start, end) = range.split_once('-')?;
        let addr = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        if perms.len() < 4 {
            return None;
        }
        let mut mode = AccessMode::NONE;
        if perms[0] == b'r' {
            mode = mode.union(AccessMode::READ);
        }
        if perms[1] == b'w' {
            mode = mode.union(AccessMode::WRITE);
        }
        if perms[2] == b'x' {
            mode = mode.union(AccessMode::EXEC);
        }
        if perms[3] == b's' {
            mode = mode.union(AccessMode::SHARED);
        }
        Some(MappedRegion { addr, end, mode })
    }
}

/// Read the mapping table of the calling process, sorted by address.
#[cfg(target_os = "linux")]
pub fn mapped_regions() -> Result<Vec<MappedRegion>> {
    let maps = std::fs::read_to_string("/proc/self/maps")
        .map_err(|e| Error::from_errno(e.raw_os_error().unwrap_or(libc::EIO)))?;
    let mut regions: Vec<MappedRegion> = maps.lines().filter_map(MappedRegion::parse).collect();
    regions.sort_by_key(|r| r.addr);
    Ok(regions)
}

/// Read the mapping table of the calling process, sorted by address.
#[cfg(not(target_os = "linux"))]
pub fn mapped_regions() -> Result<Vec<MappedRegion>> {
    Err(Error::Errno(libc::ENOSYS))
}

/// Whether every byte of `block` is mapped with exactly the access bits of `mode`.
pub fn is_mapped(block: MemBlock, mode: AccessMode) -> Result<bool> {
    let regions = mapped_regions()?;
    let mut next = block.addr_usize();
    let end = block.end();
    for region in &regions {
        if next >= end {
            break;
        }
        if region.end <= next {
            continue;
        }
        if region.addr > next || region.mode.access() != mode.access() {
            return Ok(false);
        }
        next = region.end;
    }
    Ok(next >= end)
}

/// Whether no byte of `block` is mapped.
pub fn is_unmapped(block: MemBlock) -> Result<bool> {
    let regions = mapped_regions()?;
    let start = block.addr_usize();
    let end = block.end();
    Ok(!regions.iter().any(|r| r.addr < end && r.end > start))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagesize_is_power_of_two() {
        assert!(pagesize_vm().is_power_of_two());
        assert!(pagesize_vm() >= 4096);
    }

    #[test]
    fn test_new_rounds_up() {
        let mut page = VmPage::new(1).unwrap();
        assert_eq!(page.size(), pagesize_vm());
        assert_eq!(page.addr() as usize % pagesize_vm(), 0);
        unsafe { page.as_memblock().fill(0xAA) };
        page.free().unwrap();
        assert!(page.is_free());
        // double free is a no-op
        page.free().unwrap();
    }

    #[test]
    fn test_new_rejects_zero() {
        assert_eq!(VmPage::new(0), Err(Error::InvalidArgument));
        assert_eq!(VmPage::new_aligned(4096, 3000), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_new_aligned() {
        let align = 1 << 20;
        let mut page = VmPage::new_aligned(3 * pagesize_vm(), align).unwrap();
        assert_eq!(page.addr() as usize % align, 0);
        assert_eq!(page.size(), 3 * pagesize_vm());
        page.free().unwrap();
    }

    #[test]
    fn test_new_class() {
        let mut page = VmPage::new_class(PageSize::Size64K).unwrap();
        assert_eq!(page.size(), 65536);
        page.free().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_protect_and_query() {
        let pagesize = pagesize_vm();
        let mut page = VmPage::new(4 * pagesize).unwrap();
        assert!(is_mapped(page.as_memblock(), AccessMode::RDWR).unwrap());

        let guard = MemBlock::new(page.addr(), pagesize);
        protect_range(guard, AccessMode::NONE).unwrap();
        assert!(is_mapped(guard, AccessMode::NONE).unwrap());
        assert!(!is_mapped(page.as_memblock(), AccessMode::RDWR).unwrap());

        page.protect(AccessMode::RDWR).unwrap();
        assert!(is_mapped(page.as_memblock(), AccessMode::RDWR).unwrap());

        let block = page.as_memblock();
        page.free().unwrap();
        assert!(is_unmapped(block).unwrap());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_is_mapped_skips_lower_regions() {
        let pagesize = pagesize_vm();
        let mut page = VmPage::new(4 * pagesize).unwrap();
        protect_range(MemBlock::new(page.addr(), pagesize), AccessMode::NONE).unwrap();

        let upper = MemBlock::new(page.addr().wrapping_add(pagesize), 3 * pagesize);
        assert!(is_mapped(upper, AccessMode::RDWR).unwrap());
        let last = MemBlock::new(page.addr().wrapping_add(3 * pagesize), pagesize);
        assert!(is_mapped(last, AccessMode::RDWR).unwrap());
        page.free().unwrap();
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_mapping_failure_keeps_errno() {
        assert_eq!(map_anonymous(0), Err(Error::InvalidArgument));
        assert_eq!(VmPage::new(1 << 62).unwrap_err(), Error::NoMemory);
    }

    #[test]
    fn test_protect_range_rejects_unaligned() {
        let mut page = VmPage::new(pagesize_vm()).unwrap();
        let block = MemBlock::new(page.addr().wrapping_add(1), 16);
        assert_eq!(protect_range(block, AccessMode::NONE), Err(Error::InvalidArgument));
        page.free().unwrap();
    }

    #[test]
    fn test_parse_maps_line() {
        let region =
            MappedRegion::parse("7f0000000000-7f0000002000 rw-p 00000000 00:00 0").unwrap();
        assert_eq!(region.addr, 0x7f00_0000_0000);
        assert_eq!(region.size(), 0x2000);
        assert_eq!(region.mode, AccessMode::RDWR);

        let region = MappedRegion::parse("1000-2000 ---p 00000000 00:00 0").unwrap();
        assert_eq!(region.mode, AccessMode::NONE);

        let region = MappedRegion::parse("1000-2000 r-xs 00000000 00:00 0 /lib").unwrap();
        assert!(region.mode.contains(AccessMode::SHARED));
        assert_eq!(region.mode.access(), AccessMode::READ.union(AccessMode::EXEC));

        assert!(MappedRegion::parse("garbage").is_none());
    }
}
