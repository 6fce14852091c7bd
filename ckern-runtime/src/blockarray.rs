//! # Block Array
//!
//! A sparse array built only from page-cache pages.
//!
//! Leaves (data blocks) hold `pagesize / elementsize` elements; inner nodes
//! (pointer blocks) hold `pagesize / size_of::<usize>()` child pointers.
//! The tree grows upwards: when an index needs more levels than the tree has,
//! the current root becomes child 0 of a new root. Nodes are never moved,
//! so the address of an assigned element stays valid until the array is
//! freed.
//!
//! ```text
//! depth 2          [ptr block]
//!                 /     |     \
//! depth 1   [ptr block] 0   [ptr block]
//!            /    \              \
//! depth 0 [data] [data]         [data]
//! ```

use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use crate::error::{keep_first, Error, Result};
use crate::memblock::MemBlock;
use crate::pagecache::{PageCache, PageSize};

/// Sparse array of fixed-size elements.
#[derive(Debug)]
pub struct BlockArray {
    root: *mut u8,
    /// Levels of pointer blocks above the data blocks.
    depth: u32,
    pagesize: PageSize,
    elementsize: usize,
    elements_per_block: usize,
    /// `log2(elements_per_block) + 1`, or 0 if not a power of two.
    log2_elements_per_block: u32,
    log2_ptr_per_block: u32,
}

impl BlockArray {
    /// Create an array whose nodes are pages of `pagesize` and allocate the
    /// root data block.
    ///
    /// Fails with [`Error::InvalidArgument`] if `elementsize` is 0 or larger
    /// than a page.
    pub fn new(pc: &mut dyn PageCache, pagesize: PageSize, elementsize: usize) -> Result<Self> {
        let pagebytes = pagesize.bytes();
        if elementsize == 0 || elementsize > pagebytes {
            return Err(Error::InvalidArgument);
        }
        let elements_per_block = pagebytes / elementsize;
        let log2_elements_per_block = if elements_per_block.is_power_of_two() {
            elements_per_block.trailing_zeros() + 1
        } else {
            0
        };
        let log2_ptr_per_block = (pagebytes / mem::size_of::<*mut u8>()).trailing_zeros();

        let mut array = BlockArray {
            root: ptr::null_mut(),
            depth: 0,
            pagesize,
            elementsize,
            elements_per_block,
            log2_elements_per_block,
            log2_ptr_per_block,
        };
        array.root = array.new_node(pc)?;
        Ok(array)
    }

    /// Release every node to `pc`, children before parents.
    ///
    /// Keeps going after a failed release and returns the first error.
    /// Freeing a freed array does nothing.
    pub fn free(&mut self, pc: &mut dyn PageCache) -> Result<()> {
        if self.root.is_null() {
            return Ok(());
        }
        let mut err = None;
        self.free_node(pc, self.root, self.depth, &mut err);
        self.root = ptr::null_mut();
        self.depth = 0;
        err.map_or(Ok(()), Err)
    }

    /// Address of element `index`, or `None` if its data block does not
    /// exist. Never allocates.
    pub fn at(&self, index: usize) -> Option<NonNull<u8>> {
        if self.root.is_null() {
            return None;
        }
        let (block, element) = self.split(index);
        if self.required_depth(block) > self.depth {
            return None;
        }
        let mut node = self.root;
        for level in (0..self.depth).rev() {
            // SAFETY: node is a pointer block of this array
            node = unsafe { *self.child_slot(node, block, level) };
            if node.is_null() {
                return None;
            }
        }
        // SAFETY: element < elements_per_block, so the offset stays inside the data block
        NonNull::new(unsafe { node.add(element * self.elementsize) })
    }

    /// Like [`at`](Self::at), failing with [`Error::NoData`] on a missing node.
    pub fn try_at(&self, index: usize) -> Result<NonNull<u8>> {
        self.at(index).ok_or(Error::NoData)
    }

    /// Address of element `index`, allocating missing nodes from `pc`.
    ///
    /// New data blocks are zeroed. On failure the nodes created so far stay
    /// in the tree, so a retry only allocates what is still missing.
    pub fn assign(&mut self, pc: &mut dyn PageCache, index: usize) -> Result<NonNull<u8>> {
        if self.root.is_null() {
            return Err(Error::InvalidArgument);
        }
        let (block, element) = self.split(index);
        let needed = self.required_depth(block);
        while self.depth < needed {
            let node = self.new_node(pc)?;
            // SAFETY: node is a zeroed pointer block; slot 0 takes the old root
            unsafe { (node as *mut *mut u8).write(self.root) };
            self.root = node;
            self.depth += 1;
        }

        let mut node = self.root;
        for level in (0..self.depth).rev() {
            // SAFETY: node is a pointer block of this array
            unsafe {
                let slot = self.child_slot(node, block, level);
                if (*slot).is_null() {
                    *slot = self.new_node(pc)?;
                }
                node = *slot;
            }
        }
        // SAFETY: element < elements_per_block, so the offset stays inside the data block
        NonNull::new(unsafe { node.add(element * self.elementsize) }).ok_or(Error::Invariant)
    }

    /// Levels of pointer blocks; 0 means the root is a data block.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Page size class of every node.
    pub fn pagesize(&self) -> PageSize {
        self.pagesize
    }

    /// Size of one element in bytes.
    pub fn element_size(&self) -> usize {
        self.elementsize
    }

    /// Elements stored in one data block.
    pub fn elements_per_block(&self) -> usize {
        self.elements_per_block
    }

    /// `log2(elements_per_block) + 1`, or 0 if that is not a power of two.
    pub fn log2_elements_per_block(&self) -> u32 {
        self.log2_elements_per_block
    }

    /// Whether the array has been freed.
    pub fn is_free(&self) -> bool {
        self.root.is_null()
    }

    fn split(&self, index: usize) -> (usize, usize) {
        if self.log2_elements_per_block != 0 {
            let shift = self.log2_elements_per_block - 1;
            (index >> shift, index & (self.elements_per_block - 1))
        } else {
            (
                index / self.elements_per_block,
                index % self.elements_per_block,
            )
        }
    }

    /// Smallest depth `d` with `block < P^d`.
    fn required_depth(&self, block: usize) -> u32 {
        let mut depth = 0;
        while block
            .checked_shr(depth * self.log2_ptr_per_block)
            .unwrap_or(0)
            != 0
        {
            depth += 1;
        }
        depth
    }

    /// Slot of the child on the path to `block` inside the pointer block
    /// `node`, which sits `level + 1` levels above the data blocks.
    unsafe fn child_slot(&self, node: *mut u8, block: usize, level: u32) -> *mut *mut u8 {
        let mask = (1usize << self.log2_ptr_per_block) - 1;
        let child = block
            .checked_shr(level * self.log2_ptr_per_block)
            .unwrap_or(0)
            & mask;
        (node as *mut *mut u8).add(child)
    }

    fn new_node(&self, pc: &mut dyn PageCache) -> Result<*mut u8> {
        let page = pc.alloc_page(self.pagesize)?;
        // SAFETY: a fresh page is writable for its whole size
        unsafe { page.fill(0) };
        Ok(page.addr())
    }

    fn free_node(&self, pc: &mut dyn PageCache, node: *mut u8, level: u32, err: &mut Option<Error>) {
        if level > 0 {
            let nrptr = 1usize << self.log2_ptr_per_block;
            for i in 0..nrptr {
                // SAFETY: node is a pointer block with nrptr slots
                let child = unsafe { *(node as *mut *mut u8).add(i) };
                if !child.is_null() {
                    self.free_node(pc, child, level - 1, err);
                }
            }
        }
        let mut page = MemBlock::new(node, self.pagesize.bytes());
        keep_first(err, pc.release_page(&mut page));
    }
}

/// Types whose all-zero bit pattern is a valid value.
///
/// # Safety
///
/// Implementors must be valid when every byte is zero and must not need
/// dropping.
pub unsafe trait Zeroable: Copy {}

macro_rules! impl_zeroable {
    ($($ty:ty),*) => {
        $(unsafe impl Zeroable for $ty {})*
    };
}

impl_zeroable!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

unsafe impl<T: Zeroable, const N: usize> Zeroable for [T; N] {}

/// A [`BlockArray`] of `T`.
///
/// Elements never assigned read as zero.
#[derive(Debug)]
pub struct TypedBlockArray<T: Zeroable> {
    array: BlockArray,
    _marker: PhantomData<T>,
}

impl<T: Zeroable> TypedBlockArray<T> {
    /// Create an array of `T` stored in pages of `pagesize`.
    pub fn new(pc: &mut dyn PageCache, pagesize: PageSize) -> Result<Self> {
        if mem::align_of::<T>() > pagesize.bytes() {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            array: BlockArray::new(pc, pagesize, mem::size_of::<T>())?,
            _marker: PhantomData,
        })
    }

    /// Release all nodes.
    pub fn free(&mut self, pc: &mut dyn PageCache) -> Result<()> {
        self.array.free(pc)
    }

    /// Element `index` if its data block exists.
    pub fn at(&self, index: usize) -> Option<&T> {
        // SAFETY: pages are aligned to their size and size_of::<T>() is a
        // multiple of align_of::<T>(); data blocks are zero-initialised
        self.array
            .at(index)
            .map(|ptr| unsafe { &*(ptr.as_ptr() as *const T) })
    }

    /// Element `index`, allocating its data block if needed.
    pub fn assign(&mut self, pc: &mut dyn PageCache, index: usize) -> Result<&mut T> {
        let ptr = self.array.assign(pc, index)?;
        // SAFETY: see `at`; the exclusive borrow of self guards the element
        Ok(unsafe { &mut *(ptr.as_ptr() as *mut T) })
    }

    /// The untyped array.
    pub fn as_untyped(&self) -> &BlockArray {
        &self.array
    }
}
