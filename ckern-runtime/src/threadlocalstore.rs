//! # Thread-Local Store
//!
//! Every thread of the runtime lives in one mapping of [`STORE_SIZE`] bytes,
//! aligned to its own size. From low to high addresses it holds:
//!
//! ```text
//! +---------------------------+ base (multiple of STORE_SIZE)
//! | ThreadLocalStore          |  ThreadContext at offset 0, Thread after it
//! +---------------------------+
//! | guard page (NONE)         |
//! | signal stack              |
//! | guard page (NONE)         |
//! | thread stack              |  grows down towards its guard
//! | guard page (NONE)         |
//! | static memory             |  LIFO bump allocator
//! +---------------------------+ base + STORE_SIZE
//! ```
//!
//! A thread started by [`thread::spawn`](crate::thread::spawn) runs on the
//! thread stack of its store, so masking any stack address with
//! `!(STORE_SIZE - 1)` yields the store ([`ThreadLocalStore::from_address`]).
//! A store created for the main thread cannot own the stack of that thread;
//! [`ThreadLocalStore::current`] therefore reads a thread-local pointer set
//! when the thread starts.
//!
//! ## Static memory
//!
//! The top of the store is a bump allocator used while services are
//! constructed. [`StaticMemory::memfree`] only accepts the most recent
//! allocation.

use std::cell::Cell;
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use nix::libc;

use crate::config::RuntimeConfig;
use crate::error::{keep_first, Error, Result};
use crate::memblock::MemBlock;
use crate::process::ProcessContext;
use crate::thread::Thread;
use crate::threadcontext::{ContextType, ThreadContext};
use crate::vm::{align_up, pagesize_vm, protect_range, AccessMode, VmPage};

/// Size and alignment of a thread-local store.
pub const STORE_SIZE: usize = 1 << 21;

/// Smallest thread stack a store accepts.
pub const MIN_THREAD_STACK: usize = 64 * 1024;

/// Alignment of static memory allocations.
pub const STATIC_ALIGN: usize = 16;

thread_local! {
    static CURRENT: Cell<*mut ThreadLocalStore> = const { Cell::new(ptr::null_mut()) };
}

/// LIFO bump allocator over a fixed region.
#[derive(Debug)]
pub struct StaticMemory {
    region: MemBlock,
    used: usize,
    starts: Vec<usize>,
}

impl StaticMemory {
    /// Allocator over `region`, which must stay mapped while it is used.
    pub fn new(region: MemBlock) -> Self {
        Self {
            region,
            used: 0,
            starts: Vec::new(),
        }
    }

    /// Allocate `size` bytes rounded up to [`STATIC_ALIGN`].
    ///
    /// The returned block has the rounded size.
    pub fn memalloc(&mut self, size: usize) -> Result<MemBlock> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        let size = align_up(size, STATIC_ALIGN).ok_or(Error::NoMemory)?;
        if size > self.region.size() - self.used {
            return Err(Error::NoMemory);
        }
        let addr = self.region.addr().wrapping_add(self.used);
        self.starts.push(self.used);
        self.used += size;
        Ok(MemBlock::new(addr, size))
    }

    /// Free the most recent allocation and clear `block`.
    ///
    /// A free block is ignored. Any other block than the most recent one is
    /// rejected with [`Error::InvalidArgument`].
    pub fn memfree(&mut self, block: &mut MemBlock) -> Result<()> {
        if block.is_free() {
            return Ok(());
        }
        let Some(&start) = self.starts.last() else {
            return Err(Error::InvalidArgument);
        };
        if block.addr_usize() != self.region.addr_usize() + start
            || block.size() != self.used - start
        {
            return Err(Error::InvalidArgument);
        }
        self.starts.pop();
        self.used = start;
        block.clear();
        Ok(())
    }

    /// Number of allocated bytes.
    pub fn size_static(&self) -> usize {
        self.used
    }

    /// Size of the region.
    pub fn capacity(&self) -> usize {
        self.region.size()
    }
}

#[derive(Debug)]
struct StoreLayout {
    vmpage: VmPage,
    guards: [MemBlock; 3],
    signal_stack: MemBlock,
    thread_stack: MemBlock,
    static_region: MemBlock,
}

impl StoreLayout {
    /// Carve a mapping at `base` according to `config`.
    fn compute(base: *mut u8, config: &RuntimeConfig) -> Result<StoreLayout> {
        let pagesize = pagesize_vm();
        let round = |n: usize| align_up(n, pagesize).ok_or(Error::InvalidArgument);
        let header = round(size_of::<ThreadLocalStore>())?;
        let signal = round(config.thread.signal_stack_size)?;
        let statics = round(config.thread.static_size)?;
        let fixed = [header, 3 * pagesize, signal, statics]
            .into_iter()
            .try_fold(0usize, usize::checked_add)
            .ok_or(Error::InvalidArgument)?;
        if fixed > STORE_SIZE || STORE_SIZE - fixed < MIN_THREAD_STACK {
            return Err(Error::InvalidArgument);
        }
        let stack = STORE_SIZE - fixed;
        let at = |offset: usize, size: usize| MemBlock::new(base.wrapping_add(offset), size);

        let guard1 = header;
        let signal_start = guard1 + pagesize;
        let guard2 = signal_start + signal;
        let stack_start = guard2 + pagesize;
        let guard3 = stack_start + stack;
        let static_start = guard3 + pagesize;
        Ok(StoreLayout {
            vmpage: VmPage::FREE,
            guards: [at(guard1, pagesize), at(guard2, pagesize), at(guard3, pagesize)],
            signal_stack: at(signal_start, signal),
            thread_stack: at(stack_start, stack),
            static_region: at(static_start, statics),
        })
    }
}

/// Memory of one thread: its context, its stacks and its static memory.
#[repr(C)]
#[derive(Debug)]
pub struct ThreadLocalStore {
    context: ThreadContext,
    thread: Thread,
    statmem: StaticMemory,
    layout: StoreLayout,
}

impl ThreadLocalStore {
    /// Map a store laid out according to `config`.
    ///
    /// A store of the main thread becomes the [`current`](Self::current)
    /// store of the calling thread. The store is released with
    /// [`delete`](Self::delete).
    pub fn new(config: &RuntimeConfig, is_main: bool) -> Result<NonNull<ThreadLocalStore>> {
        let mut vmpage = VmPage::new_aligned(STORE_SIZE, STORE_SIZE)?;
        let base = vmpage.addr();
        let layout = match StoreLayout::compute(base, config) {
            Ok(layout) => layout,
            Err(err) => {
                let _ = vmpage.free();
                return Err(err);
            }
        };
        for guard in layout.guards {
            if let Err(err) = protect_range(guard, AccessMode::NONE) {
                let _ = vmpage.free();
                return Err(err);
            }
        }
        let store = base.cast::<ThreadLocalStore>();
        // SAFETY: the mapping is aligned to STORE_SIZE and larger than the header
        unsafe {
            store.write(ThreadLocalStore {
                context: ThreadContext::new_static(),
                thread: Thread::new(is_main),
                statmem: StaticMemory::new(layout.static_region),
                layout: StoreLayout { vmpage, ..layout },
            });
        }
        if is_main {
            CURRENT.with(|current| current.set(store));
        }
        tracing::debug!(base = ?base, is_main, "thread-local store mapped");
        // SAFETY: base of a successful mapping
        Ok(unsafe { NonNull::new_unchecked(store) })
    }

    /// Free the context if still initialised and unmap the store.
    ///
    /// # Safety
    ///
    /// `store` must come from [`new`](Self::new), must not be deleted twice,
    /// and no thread may run on its stacks.
    pub unsafe fn delete(store: NonNull<ThreadLocalStore>) -> Result<()> {
        let raw = store.as_ptr();
        let mut err = None;
        {
            let this = &mut *raw;
            if !this.context.is_static() {
                keep_first(&mut err, this.context.free(&mut this.statmem));
            }
        }
        CURRENT.with(|current| {
            if current.get() == raw {
                current.set(ptr::null_mut());
            }
        });
        let mut vmpage = ptr::read(&(*raw).layout.vmpage);
        ptr::drop_in_place(raw);
        keep_first(&mut err, vmpage.free());
        err.map_or(Ok(()), Err)
    }

    /// The store containing `addr`, provided `addr` lies in a store.
    ///
    /// On a thread started by [`thread::spawn`](crate::thread::spawn) the
    /// address of any local variable yields the store of the thread.
    pub fn from_address(addr: usize) -> Option<NonNull<ThreadLocalStore>> {
        NonNull::new((addr & !(STORE_SIZE - 1)) as *mut ThreadLocalStore)
    }

    /// Store of the calling thread, if it runs inside one.
    pub fn current() -> Option<NonNull<ThreadLocalStore>> {
        NonNull::new(CURRENT.with(Cell::get))
    }

    pub(crate) fn set_current(store: *mut ThreadLocalStore) {
        CURRENT.with(|current| current.set(store));
    }

    /// Initialise the thread context of this store.
    pub fn init_context(&mut self, pc: &Arc<ProcessContext>, ctype: ContextType) -> Result<()> {
        let is_main = self.thread.is_main();
        self.context.init(&mut self.statmem, is_main, pc, ctype)
    }

    /// Free the thread context of this store.
    pub fn free_context(&mut self) -> Result<()> {
        self.context.free(&mut self.statmem)
    }

    /// The thread context.
    pub fn context(&self) -> &ThreadContext {
        &self.context
    }

    /// The thread context.
    pub fn context_mut(&mut self) -> &mut ThreadContext {
        &mut self.context
    }

    /// The thread.
    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    pub(crate) fn thread_mut(&mut self) -> &mut Thread {
        &mut self.thread
    }

    /// Allocate from the static memory.
    pub fn memalloc(&mut self, size: usize) -> Result<MemBlock> {
        self.statmem.memalloc(size)
    }

    /// Free the most recent static allocation.
    pub fn memfree(&mut self, block: &mut MemBlock) -> Result<()> {
        self.statmem.memfree(block)
    }

    /// Number of allocated static bytes.
    pub fn size_static(&self) -> usize {
        self.statmem.size_static()
    }

    /// Whole mapping.
    pub fn memblock(&self) -> MemBlock {
        self.layout.vmpage.as_memblock()
    }

    /// Guard pages around the signal stack and the thread stack, from low to
    /// high addresses.
    pub fn guard_pages(&self) -> [MemBlock; 3] {
        self.layout.guards
    }

    /// Range of the signal stack.
    pub fn signal_stack(&self) -> MemBlock {
        self.layout.signal_stack
    }

    /// Range of the thread stack.
    pub fn thread_stack(&self) -> MemBlock {
        self.layout.thread_stack
    }

    /// Range of the static memory.
    pub fn static_region(&self) -> MemBlock {
        self.layout.static_region
    }

    /// Make the signal stack of this store the alternate signal stack of the
    /// calling thread.
    pub fn install_signal_stack(&self) -> Result<()> {
        let stack = libc::stack_t {
            ss_sp: self.layout.signal_stack.addr().cast(),
            ss_flags: 0,
            ss_size: self.layout.signal_stack.size(),
        };
        // SAFETY: the signal stack stays mapped until the store is deleted
        if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// Disable the alternate signal stack of the calling thread.
    pub fn uninstall_signal_stack() -> Result<()> {
        let stack = libc::stack_t {
            ss_sp: ptr::null_mut(),
            ss_flags: libc::SS_DISABLE,
            ss_size: 0,
        };
        // SAFETY: disabling only reads `stack`
        if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{is_mapped, is_unmapped};

    #[test]
    fn test_static_memory_lifo() {
        let mut buf = vec![0u8; 256];
        let mut statmem = StaticMemory::new(MemBlock::new(buf.as_mut_ptr(), buf.len()));
        let mut a = statmem.memalloc(10).unwrap();
        assert_eq!(a.size(), 16);
        let mut b = statmem.memalloc(32).unwrap();
        assert_eq!(b.addr_usize(), a.addr_usize() + 16);
        assert_eq!(statmem.size_static(), 48);

        assert_eq!(statmem.memfree(&mut a), Err(Error::InvalidArgument));
        assert_eq!(statmem.size_static(), 48);
        assert!(!a.is_free());

        statmem.memfree(&mut b).unwrap();
        assert!(b.is_free());
        statmem.memfree(&mut b).unwrap();
        statmem.memfree(&mut a).unwrap();
        assert_eq!(statmem.size_static(), 0);
    }

    #[test]
    fn test_static_memory_rejects_foreign_blocks() {
        let mut buf = vec![0u8; 256];
        let mut statmem = StaticMemory::new(MemBlock::new(buf.as_mut_ptr(), buf.len()));
        let mut a = statmem.memalloc(32).unwrap();
        let mut b = statmem.memalloc(32).unwrap();

        let mut both = MemBlock::new(a.addr(), 64);
        assert_eq!(statmem.memfree(&mut both), Err(Error::InvalidArgument));
        let mut tail = MemBlock::new(b.addr().wrapping_add(16), 16);
        assert_eq!(statmem.memfree(&mut tail), Err(Error::InvalidArgument));
        let mut head = MemBlock::new(b.addr(), 16);
        assert_eq!(statmem.memfree(&mut head), Err(Error::InvalidArgument));
        assert_eq!(statmem.size_static(), 64);
        assert!(!both.is_free() && !tail.is_free() && !head.is_free());

        statmem.memfree(&mut b).unwrap();
        statmem.memfree(&mut a).unwrap();
        assert_eq!(statmem.size_static(), 0);
        let mut stale = MemBlock::new(buf.as_mut_ptr(), 16);
        assert_eq!(statmem.memfree(&mut stale), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_static_memory_exhausted() {
        let mut buf = vec![0u8; 64];
        let mut statmem = StaticMemory::new(MemBlock::new(buf.as_mut_ptr(), buf.len()));
        assert_eq!(statmem.memalloc(0), Err(Error::InvalidArgument));
        let _all = statmem.memalloc(64).unwrap();
        assert_eq!(statmem.memalloc(1), Err(Error::NoMemory));
        assert_eq!(statmem.capacity(), 64);
    }

    #[test]
    fn test_layout() {
        let config = RuntimeConfig::default();
        let store = ThreadLocalStore::new(&config, false).unwrap();
        let tls = unsafe { store.as_ref() };
        let base = store.as_ptr() as usize;
        let pagesize = pagesize_vm();

        assert_eq!(base % STORE_SIZE, 0);
        assert_eq!(tls.memblock().size(), STORE_SIZE);
        assert_eq!(tls.context() as *const ThreadContext as usize, base);
        assert_eq!(
            tls.thread() as *const Thread as usize,
            base + size_of::<ThreadContext>()
        );

        let [guard1, guard2, guard3] = tls.guard_pages();
        assert_eq!(guard1.end(), tls.signal_stack().addr_usize());
        assert_eq!(guard2.addr_usize(), tls.signal_stack().end());
        assert_eq!(guard2.end(), tls.thread_stack().addr_usize());
        assert_eq!(guard3.addr_usize(), tls.thread_stack().end());
        assert_eq!(guard3.end(), tls.static_region().addr_usize());
        assert_eq!(tls.static_region().end(), base + STORE_SIZE);
        assert_eq!(tls.static_region().size(), config.thread.static_size);
        assert!(tls.thread_stack().size() >= MIN_THREAD_STACK);
        assert_eq!(guard1.size(), pagesize);

        assert!(is_mapped(guard1, AccessMode::NONE).unwrap());
        assert!(is_mapped(guard2, AccessMode::NONE).unwrap());
        assert!(is_mapped(guard3, AccessMode::NONE).unwrap());
        let below_static = MemBlock::new(
            (tls.static_region().addr_usize() - pagesize) as *mut u8,
            pagesize,
        );
        assert!(is_mapped(below_static, AccessMode::NONE).unwrap());
        assert!(is_mapped(tls.thread_stack(), AccessMode::RDWR).unwrap());
        assert!(is_mapped(tls.signal_stack(), AccessMode::RDWR).unwrap());

        let mapping = tls.memblock();
        unsafe { ThreadLocalStore::delete(store).unwrap() };
        assert!(is_unmapped(mapping).unwrap());
    }

    #[test]
    fn test_from_address() {
        let store = ThreadLocalStore::new(&RuntimeConfig::default(), false).unwrap();
        let tls = unsafe { store.as_ref() };
        let inside = [
            tls.thread_stack().addr_usize(),
            tls.thread_stack().end() - 1,
            tls.static_region().end() - 1,
            tls.signal_stack().addr_usize() + 100,
        ];
        for addr in inside {
            assert_eq!(ThreadLocalStore::from_address(addr), Some(store));
        }
        unsafe { ThreadLocalStore::delete(store).unwrap() };
    }

    #[test]
    fn test_main_store_is_current() {
        assert!(ThreadLocalStore::current().is_none());
        let store = ThreadLocalStore::new(&RuntimeConfig::default(), true).unwrap();
        assert_eq!(ThreadLocalStore::current(), Some(store));
        assert!(unsafe { store.as_ref() }.thread().is_main());
        unsafe { ThreadLocalStore::delete(store).unwrap() };
        assert!(ThreadLocalStore::current().is_none());
    }

    #[test]
    fn test_store_memalloc() {
        let store = ThreadLocalStore::new(&RuntimeConfig::default(), false).unwrap();
        let tls = unsafe { &mut *store.as_ptr() };
        let mut block = tls.memalloc(100).unwrap();
        assert_eq!(block.addr_usize(), tls.static_region().addr_usize());
        unsafe { block.fill(0x5a) };
        assert_eq!(tls.size_static(), 112);
        tls.memfree(&mut block).unwrap();
        assert_eq!(tls.size_static(), 0);
        unsafe { ThreadLocalStore::delete(store).unwrap() };
    }

    #[test]
    fn test_static_too_large() {
        let config = RuntimeConfig::builder()
            .static_size(STORE_SIZE)
            .build_unchecked();
        assert_eq!(
            ThreadLocalStore::new(&config, false).unwrap_err(),
            Error::InvalidArgument
        );
    }
}
