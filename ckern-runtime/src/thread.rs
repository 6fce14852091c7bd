//! Threads
//!
//! [`spawn`] starts an OS thread whose stack is the thread stack of a fresh
//! [`ThreadLocalStore`]. The new thread installs the signal stack of its
//! store, initialises its thread context, runs the main function and frees
//! the context again. [`ThreadHandle::join`] waits for the thread, returns
//! the return code of its main function and unmaps the store.
//!
//! ```rust,ignore
//! let pc = Arc::new(ProcessContext::default());
//! let handle = thread::spawn(&pc, || {
//!     threadcontext::with_current(|tc| tc.thread_id()).unwrap_or(0) as i32
//! })?;
//! let id = handle.join()?;
//! ```

use std::fmt;
use std::mem::MaybeUninit;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use nix::libc;

use crate::error::{Error, Result};
use crate::log::LogMain;
use crate::log_error;
use crate::process::ProcessContext;
use crate::threadcontext::ContextType;
use crate::threadlocalstore::ThreadLocalStore;

/// Return code of a thread whose main function panicked.
pub const PANIC_RETURNCODE: i32 = 101;

/// Main function of a thread.
pub type ThreadMain = Box<dyn FnOnce() -> i32 + Send>;

/// Per-thread bookkeeping stored after the thread context.
pub struct Thread {
    is_main: bool,
    returncode: i32,
    main: Option<ThreadMain>,
    pcontext: Option<Arc<ProcessContext>>,
}

impl Thread {
    pub(crate) fn new(is_main: bool) -> Self {
        Self {
            is_main,
            returncode: 0,
            main: None,
            pcontext: None,
        }
    }

    /// Whether this is the main thread of the process.
    pub fn is_main(&self) -> bool {
        self.is_main
    }

    /// Return code of the main function, valid after the thread ended.
    pub fn returncode(&self) -> i32 {
        self.returncode
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("is_main", &self.is_main)
            .field("returncode", &self.returncode)
            .field("started", &self.main.is_none())
            .finish()
    }
}

/// Handle of a thread started with [`spawn`].
///
/// Dropping the handle without joining leaks the store of the thread.
#[must_use = "the thread-local store is only unmapped by join"]
#[derive(Debug)]
pub struct ThreadHandle {
    pthread: libc::pthread_t,
    store: NonNull<ThreadLocalStore>,
}

// SAFETY: the handle only touches the store after the thread has ended
unsafe impl Send for ThreadHandle {}

impl ThreadHandle {
    /// Store of the thread.
    pub fn store(&self) -> NonNull<ThreadLocalStore> {
        self.store
    }

    /// Wait for the thread, unmap its store and return its return code.
    pub fn join(self) -> Result<i32> {
        // SAFETY: pthread was created by spawn and is joined only here
        let rc = unsafe { libc::pthread_join(self.pthread, ptr::null_mut()) };
        if rc != 0 {
            return Err(Error::from_errno(rc));
        }
        // SAFETY: the thread has ended, nothing else refers to the store
        unsafe {
            let returncode = self.store.as_ref().thread().returncode();
            ThreadLocalStore::delete(self.store)?;
            Ok(returncode)
        }
    }
}

/// Start a thread running `main` in its own thread-local store.
pub fn spawn<F>(pc: &Arc<ProcessContext>, main: F) -> Result<ThreadHandle>
where
    F: FnOnce() -> i32 + Send + 'static,
{
    let store = ThreadLocalStore::new(pc.config(), false)?;
    // SAFETY: the store is not shared yet
    let stack = unsafe {
        let tls = &mut *store.as_ptr();
        let thread = tls.thread_mut();
        thread.main = Some(Box::new(main));
        thread.pcontext = Some(Arc::clone(pc));
        tls.thread_stack()
    };

    match unsafe { start(stack.addr(), stack.size(), store) } {
        Ok(pthread) => Ok(ThreadHandle { pthread, store }),
        Err(err) => {
            // SAFETY: the thread was not started
            let _ = unsafe { ThreadLocalStore::delete(store) };
            Err(err)
        }
    }
}

unsafe fn start(
    stack: *mut u8,
    stacksize: usize,
    store: NonNull<ThreadLocalStore>,
) -> Result<libc::pthread_t> {
    let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
    let rc = libc::pthread_attr_init(attr.as_mut_ptr());
    if rc != 0 {
        return Err(Error::from_errno(rc));
    }
    let mut attr = attr.assume_init();
    let mut pthread = MaybeUninit::<libc::pthread_t>::uninit();
    let mut rc = libc::pthread_attr_setstack(&mut attr, stack.cast(), stacksize);
    if rc == 0 {
        rc = libc::pthread_create(
            pthread.as_mut_ptr(),
            &attr,
            thread_main,
            store.as_ptr().cast(),
        );
    }
    libc::pthread_attr_destroy(&mut attr);
    if rc != 0 {
        return Err(Error::from_errno(rc));
    }
    Ok(pthread.assume_init())
}

extern "C" fn thread_main(arg: *mut libc::c_void) -> *mut libc::c_void {
    let store = arg.cast::<ThreadLocalStore>();
    ThreadLocalStore::set_current(store);
    // SAFETY: spawn keeps the store mapped until join
    let returncode = unsafe { run(store) };
    unsafe { (*store).thread_mut().returncode = returncode };
    let _ = ThreadLocalStore::uninstall_signal_stack();
    ThreadLocalStore::set_current(ptr::null_mut());
    ptr::null_mut()
}

unsafe fn run(store: *mut ThreadLocalStore) -> i32 {
    if let Err(err) = (*store).install_signal_stack() {
        log_error!(&mut LogMain, "cannot install signal stack: {}", err);
        return err.errno();
    }
    let (main, pc) = {
        let thread = (*store).thread_mut();
        (thread.main.take(), thread.pcontext.take())
    };
    let Some(pc) = pc else {
        return Error::Protocol.errno();
    };
    if let Err(err) = (*store).init_context(&pc, ContextType::Default) {
        return err.errno();
    }

    let mut returncode = match main {
        Some(main) => match panic::catch_unwind(AssertUnwindSafe(main)) {
            Ok(code) => code,
            Err(_) => {
                log_error!((*store).context_mut().log(), "thread main panicked");
                PANIC_RETURNCODE
            }
        },
        None => 0,
    };

    if let Err(err) = (*store).free_context() {
        if returncode == 0 {
            returncode = err.errno();
        }
    }
    returncode
}
