//! # Thread Context
//!
//! The services a thread can see: page cache, heap, sync runner, object
//! cache and log. A context starts in the STATIC state in which only the
//! stateless [`LogMain`] sink is wired, so errors can be logged from the
//! very first call.
//!
//! ## Construction
//!
//! [`ThreadContext::init`] reserves one slab of [`ThreadContext::extsize`]
//! bytes from the static memory of the thread-local store and builds the
//! services into it in a fixed order:
//!
//! | Step | Service | Object |
//! |------|---------|--------|
//! | 1 | page cache | [`PageCacheImpl`] |
//! | 2 | heap | [`MmImpl`] |
//! | 3 | sync runner | [`SyncRunner`] |
//! | 4 | object cache | [`ObjectCacheImpl`] |
//! | 5 | log | [`LogWriter`] |
//!
//! After each step `initcount` is incremented and the service is published.
//! A failing step tears down exactly the services built before it, in
//! reverse order, and leaves the context STATIC again.
//!
//! ## Failure injection
//!
//! Every construction and teardown step consults an [`ErrorTimer`] of the
//! [`ProcessContext`], see [`ProcessContext::set_init_err`] and
//! [`ProcessContext::set_free_err`].
//!
//! [`ErrorTimer`]: crate::errortimer::ErrorTimer

use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::error::{keep_first, Error, Result};
use crate::iobj::IObj;
use crate::log::{Log, LogChannel, LogMain, LogState};
use crate::log_error;
use crate::logwriter::LogWriter;
use crate::memblock::MemBlock;
use crate::mm::{Mm, MmImpl};
use crate::objectcache::{ObjectCache, ObjectCacheImpl};
use crate::pagecache::{PageCache, PageCacheImpl};
use crate::process::ProcessContext;
use crate::syncrunner::SyncRunner;
use crate::testmm::TestMm;
use crate::threadlocalstore::{StaticMemory, ThreadLocalStore, STATIC_ALIGN};

/// Policy applied to the log of a new context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextType {
    /// Default log channel states.
    #[default]
    Default,
    /// Interactive program: user errors are written at once, runtime errors
    /// are ignored.
    Console,
}

const fn slot_size(size: usize) -> usize {
    (size + STATIC_ALIGN - 1) & !(STATIC_ALIGN - 1)
}

const OFFSET_PAGECACHE: usize = 0;
const OFFSET_MM: usize = OFFSET_PAGECACHE + slot_size(size_of::<PageCacheImpl>());
const OFFSET_SYNCRUNNER: usize = OFFSET_MM + slot_size(size_of::<MmImpl>());
const OFFSET_OBJECTCACHE: usize = OFFSET_SYNCRUNNER + slot_size(size_of::<SyncRunner>());
const OFFSET_LOG: usize = OFFSET_OBJECTCACHE + slot_size(size_of::<ObjectCacheImpl>());
const EXTSIZE: usize = OFFSET_LOG + slot_size(size_of::<LogWriter>());

const _: () = {
    assert!(align_of::<PageCacheImpl>() <= STATIC_ALIGN);
    assert!(align_of::<MmImpl>() <= STATIC_ALIGN);
    assert!(align_of::<SyncRunner>() <= STATIC_ALIGN);
    assert!(align_of::<ObjectCacheImpl>() <= STATIC_ALIGN);
    assert!(align_of::<LogWriter>() <= STATIC_ALIGN);
};

/// Number of construction steps.
pub const NR_INIT_STEPS: usize = 5;

fn logmain_ptr() -> NonNull<dyn Log> {
    NonNull::<LogMain>::dangling()
}

fn logmain() -> IObj<dyn Log> {
    IObj::new(logmain_ptr())
}

/// Services of one thread.
#[repr(C)]
#[derive(Debug)]
pub struct ThreadContext {
    pcontext: Option<Arc<ProcessContext>>,
    pagecache: IObj<dyn PageCache>,
    mm: IObj<dyn Mm>,
    syncrunner: Option<NonNull<SyncRunner>>,
    objectcache: IObj<dyn ObjectCache>,
    log: IObj<dyn Log>,
    thread_id: usize,
    initcount: usize,
    static_memblock: MemBlock,
    /// Heap replaced by the test heap.
    saved_mm: IObj<dyn Mm>,
    testmm: Option<NonNull<TestMm>>,
}

impl ThreadContext {
    /// A context in the STATIC state.
    pub(crate) fn new_static() -> Self {
        Self {
            pcontext: None,
            pagecache: IObj::null(),
            mm: IObj::null(),
            syncrunner: None,
            objectcache: IObj::null(),
            log: logmain(),
            thread_id: 0,
            initcount: 0,
            static_memblock: MemBlock::FREE,
            saved_mm: IObj::null(),
            testmm: None,
        }
    }

    /// Bytes of static memory the services occupy.
    pub const fn extsize() -> usize {
        EXTSIZE
    }

    /// Whether the context is in the STATIC state.
    pub fn is_static(&self) -> bool {
        self.pcontext.is_none()
            && self.pagecache.is_null()
            && self.mm.is_null()
            && self.syncrunner.is_none()
            && self.objectcache.is_null()
            && self.log.same_object(&logmain())
            && self.thread_id == 0
            && self.initcount == 0
            && self.static_memblock.is_free()
            && self.saved_mm.is_null()
            && self.testmm.is_none()
    }

    /// Build the services of the context.
    ///
    /// `statmem` is the static memory of the store holding the context.
    /// Fails with [`Error::Protocol`] if `pc` is not initialised or the
    /// context is not STATIC. On failure the context is STATIC again.
    pub fn init(
        &mut self,
        statmem: &mut StaticMemory,
        is_main: bool,
        pc: &Arc<ProcessContext>,
        ctype: ContextType,
    ) -> Result<()> {
        if !pc.is_initialized() || !self.is_static() {
            return Err(Error::Protocol);
        }
        if let Err(err) = self.init_services(statmem, is_main, pc, ctype) {
            let step = self.initcount + 1;
            log_error!(self.log(), "thread context init failed at step {}: {}", step, err);
            let _ = self.free(statmem);
            return Err(err);
        }
        tracing::debug!(thread_id = self.thread_id, ?ctype, "thread context initialised");
        Ok(())
    }

    fn init_services(
        &mut self,
        statmem: &mut StaticMemory,
        is_main: bool,
        pc: &Arc<ProcessContext>,
        ctype: ContextType,
    ) -> Result<()> {
        let config = pc.config();
        self.pcontext = Some(Arc::clone(pc));
        self.thread_id = pc.next_thread_id(is_main);
        let slab = statmem.memalloc(EXTSIZE)?;
        self.static_memblock = slab;

        pc.process_init_err()?;
        // SAFETY: every slot lies in the slab and is suitably aligned
        let pagecache = unsafe { place(slab, OFFSET_PAGECACHE, PageCacheImpl::new(&config.pagecache)) };
        let object: NonNull<dyn PageCache> = pagecache;
        self.pagecache = IObj::new(object);
        self.initcount += 1;

        pc.process_init_err()?;
        let mm = unsafe { place(slab, OFFSET_MM, MmImpl::new()) };
        let object: NonNull<dyn Mm> = mm;
        self.mm = IObj::new(object);
        self.initcount += 1;

        pc.process_init_err()?;
        self.syncrunner = Some(unsafe { place(slab, OFFSET_SYNCRUNNER, SyncRunner::new()) });
        self.initcount += 1;

        pc.process_init_err()?;
        // SAFETY: the page cache was placed in step 1
        let cache = ObjectCacheImpl::new(unsafe { &mut *pagecache.as_ptr() })?;
        let objectcache = unsafe { place(slab, OFFSET_OBJECTCACHE, cache) };
        let object: NonNull<dyn ObjectCache> = objectcache;
        self.objectcache = IObj::new(object);
        self.initcount += 1;

        pc.process_init_err()?;
        let mut buffer = statmem.memalloc(config.log.buffer_size)?;
        let writer = match LogWriter::new(buffer, &config.log) {
            Ok(writer) => writer,
            Err(err) => {
                let _ = statmem.memfree(&mut buffer);
                return Err(err);
            }
        };
        let writer = unsafe { place(slab, OFFSET_LOG, writer) };
        let object: NonNull<dyn Log> = writer;
        self.log = IObj::new(object);
        self.initcount += 1;

        if ctype == ContextType::Console {
            let log = self.log();
            log.setstate(LogChannel::UserErr, LogState::Unbuffered);
            log.setstate(LogChannel::Err, LogState::Ignored);
        }
        Ok(())
    }

    /// Tear down the services in reverse construction order and return the
    /// context to the STATIC state.
    ///
    /// Keeps going after a failing step and returns the first error.
    pub fn free(&mut self, statmem: &mut StaticMemory) -> Result<()> {
        if self.is_static() {
            return Ok(());
        }
        let pc = self.pcontext.clone();
        let mut err = None;

        self.log().flushbuffer(LogChannel::Err);
        if self.testmm.is_some() {
            keep_first(&mut err, self.switch_off_testmm());
        }

        while self.initcount > 0 {
            // SAFETY: the service of step `initcount` was built by init
            let result = unsafe { self.free_step(self.initcount, statmem) };
            let result = match &pc {
                Some(pc) => pc.process_free_err(result),
                None => result,
            };
            keep_first(&mut err, result);
            self.initcount -= 1;
        }

        keep_first(&mut err, statmem.memfree(&mut self.static_memblock));
        if self.thread_id == 1 {
            if let Some(pc) = &pc {
                pc.reset_thread_ids();
            }
        }
        tracing::debug!(thread_id = self.thread_id, "thread context freed");
        *self = ThreadContext::new_static();
        err.map_or(Ok(()), Err)
    }

    unsafe fn free_step(&mut self, step: usize, statmem: &mut StaticMemory) -> Result<()> {
        let slab = self.static_memblock;
        match step {
            5 => {
                let writer = slot::<LogWriter>(slab, OFFSET_LOG);
                let mut buffer = (*writer.as_ptr()).free();
                ptr::drop_in_place(writer.as_ptr());
                self.log = logmain();
                statmem.memfree(&mut buffer)
            }
            4 => {
                let cache = slot::<ObjectCacheImpl>(slab, OFFSET_OBJECTCACHE);
                let pagecache = slot::<PageCacheImpl>(slab, OFFSET_PAGECACHE);
                let result = (*cache.as_ptr()).free(&mut *pagecache.as_ptr());
                ptr::drop_in_place(cache.as_ptr());
                self.objectcache.clear();
                result
            }
            3 => {
                if let Some(runner) = self.syncrunner.take() {
                    (*runner.as_ptr()).terminate();
                    ptr::drop_in_place(runner.as_ptr());
                }
                Ok(())
            }
            2 => {
                let mm = slot::<MmImpl>(slab, OFFSET_MM);
                let leaked = (*mm.as_ptr()).size_allocated();
                if leaked != 0 {
                    tracing::warn!(thread_id = self.thread_id, leaked, "heap freed with live blocks");
                }
                ptr::drop_in_place(mm.as_ptr());
                self.mm.clear();
                Ok(())
            }
            1 => {
                let pagecache = slot::<PageCacheImpl>(slab, OFFSET_PAGECACHE);
                let result = (*pagecache.as_ptr()).free();
                ptr::drop_in_place(pagecache.as_ptr());
                self.pagecache.clear();
                result
            }
            _ => Err(Error::Invariant),
        }
    }

    /// Install a [`TestMm`] as heap of the context.
    ///
    /// Does nothing if the test heap is already installed.
    pub fn switch_on_testmm(&mut self) -> Result<()> {
        if self.testmm.is_some() {
            return Ok(());
        }
        let Some(pc) = &self.pcontext else {
            return Err(Error::Protocol);
        };
        if self.mm.is_null() {
            return Err(Error::Protocol);
        }
        let testmm = TestMm::new(&pc.config().testmm)?;
        // SAFETY: Box::into_raw never returns null
        let testmm = unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(testmm))) };
        let object: NonNull<dyn Mm> = testmm;
        self.saved_mm = self.mm;
        self.mm = IObj::new(object);
        self.testmm = Some(testmm);
        Ok(())
    }

    /// Restore the heap replaced by [`switch_on_testmm`](Self::switch_on_testmm).
    ///
    /// The test heap is freed in any case. Fails with [`Error::Busy`] if it
    /// still held live blocks.
    pub fn switch_off_testmm(&mut self) -> Result<()> {
        let Some(testmm) = self.testmm.take() else {
            return Ok(());
        };
        // SAFETY: created by Box::into_raw in switch_on_testmm
        let mut testmm = unsafe { Box::from_raw(testmm.as_ptr()) };
        self.mm = self.saved_mm;
        self.saved_mm.clear();

        let mut err = None;
        if !testmm.is_empty() {
            let live = testmm.size_allocated();
            log_error!(self.log(), "test heap switched off with {} live bytes", live);
            err = Some(Error::Busy);
        }
        keep_first(&mut err, testmm.free());
        err.map_or(Ok(()), Err)
    }

    /// Whether the test heap is installed.
    pub fn is_testmm(&self) -> bool {
        self.testmm.is_some()
    }

    /// Id of the thread, 0 in the STATIC state.
    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    /// Number of constructed services.
    pub fn initcount(&self) -> usize {
        self.initcount
    }

    /// Process context the context was initialised with.
    pub fn pcontext(&self) -> Option<&Arc<ProcessContext>> {
        self.pcontext.as_ref()
    }

    /// Slab holding the services.
    pub fn static_memblock(&self) -> MemBlock {
        self.static_memblock
    }

    /// Log service; [`LogMain`] in the STATIC state.
    pub fn log(&mut self) -> &mut dyn Log {
        let object = self.log.as_ptr().unwrap_or_else(logmain_ptr);
        // SAFETY: LogMain is zero-sized, a LogWriter lives in the slab until free
        unsafe { &mut *object.as_ptr() }
    }

    /// Page cache service.
    pub fn pagecache(&mut self) -> Option<&mut dyn PageCache> {
        let object = self.pagecache.as_ptr()?;
        // SAFETY: lives in the slab until free
        Some(unsafe { &mut *object.as_ptr() })
    }

    /// Heap service.
    pub fn mm(&mut self) -> Option<&mut dyn Mm> {
        let object = self.mm.as_ptr()?;
        // SAFETY: lives in the slab or in the test heap box until free
        Some(unsafe { &mut *object.as_ptr() })
    }

    /// Sync runner service.
    pub fn syncrunner(&mut self) -> Option<&mut SyncRunner> {
        // SAFETY: lives in the slab until free
        self.syncrunner.map(|runner| unsafe { &mut *runner.as_ptr() })
    }

    /// Object cache service.
    pub fn objectcache(&mut self) -> Option<&mut dyn ObjectCache> {
        let object = self.objectcache.as_ptr()?;
        // SAFETY: lives in the slab until free
        Some(unsafe { &mut *object.as_ptr() })
    }

    /// Interface object of the page cache.
    pub fn pagecache_iobj(&self) -> IObj<dyn PageCache> {
        self.pagecache
    }

    /// Interface object of the heap.
    pub fn mm_iobj(&self) -> IObj<dyn Mm> {
        self.mm
    }

    /// Interface object of the log.
    pub fn log_iobj(&self) -> IObj<dyn Log> {
        self.log
    }
}

/// Call `f` with the thread context of the calling thread.
///
/// Returns `None` if the thread does not run in a thread-local store.
/// `f` must not call `with_current` again.
pub fn with_current<R>(f: impl FnOnce(&mut ThreadContext) -> R) -> Option<R> {
    let store = ThreadLocalStore::current()?;
    // SAFETY: the store of the calling thread outlives this call
    let context = unsafe { (*store.as_ptr()).context_mut() };
    Some(f(context))
}

unsafe fn place<T>(slab: MemBlock, offset: usize, value: T) -> NonNull<T> {
    debug_assert!(offset + size_of::<T>() <= slab.size());
    let object = slot::<T>(slab, offset);
    object.as_ptr().write(value);
    object
}

unsafe fn slot<T>(slab: MemBlock, offset: usize) -> NonNull<T> {
    NonNull::new_unchecked(slab.addr().add(offset).cast::<T>())
}
