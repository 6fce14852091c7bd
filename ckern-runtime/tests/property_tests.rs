//! Property-based tests for the C-kern runtime.
//!
//! Uses proptest to generate random operation sequences and verify the
//! invariants of the page cache, the block array and the static memory.

use std::collections::HashSet;

use ckern_runtime::config::PageCacheConfig;
use ckern_runtime::threadlocalstore::StaticMemory;
use ckern_runtime::{BlockArray, Error, MemBlock, PageCache, PageCacheImpl, PageSize};
use proptest::prelude::*;

/// Page cache with small blocks so that sequences span several blocks.
fn small_cache() -> PageCacheImpl {
    PageCacheImpl::new(&PageCacheConfig {
        subblocks_per_block: 4,
    })
}

/// Strategy for generating page size classes up to 64 KiB.
fn page_size() -> impl Strategy<Value = PageSize> {
    (0u8..=8).prop_map(|ordinal| PageSize::try_from(ordinal).unwrap())
}

#[derive(Debug, Clone)]
enum CacheOp {
    Alloc(PageSize),
    Release(usize),
    Empty,
}

/// Strategy for generating page cache operations.
fn cache_op() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        4 => page_size().prop_map(CacheOp::Alloc),
        3 => any::<usize>().prop_map(CacheOp::Release),
        1 => Just(CacheOp::Empty),
    ]
}

fn overlaps(a: &MemBlock, b: &MemBlock) -> bool {
    a.addr_usize() < b.end() && b.addr_usize() < a.end()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// size_allocated is the sum of the sizes of the live pages
    #[test]
    fn pagecache_size_allocated_matches_live_pages(ops in prop::collection::vec(cache_op(), 1..200)) {
        let mut pc = small_cache();
        let mut live: Vec<MemBlock> = Vec::new();
        for op in ops {
            match op {
                CacheOp::Alloc(class) => live.push(pc.alloc_page(class).unwrap()),
                CacheOp::Release(i) if !live.is_empty() => {
                    let mut page = live.swap_remove(i % live.len());
                    pc.release_page(&mut page).unwrap();
                    prop_assert!(page.is_free());
                }
                CacheOp::Release(_) => {}
                CacheOp::Empty => pc.empty_cache().unwrap(),
            }
            let sum: usize = live.iter().map(MemBlock::size).sum();
            prop_assert_eq!(pc.size_allocated(), sum);
        }
        for page in &mut live {
            pc.release_page(page).unwrap();
        }
        pc.empty_cache().unwrap();
        prop_assert_eq!(pc.block_count(), 0);
        pc.free().unwrap();
    }

    /// Live pages never overlap and are aligned to their size
    #[test]
    fn pagecache_pages_distinct_and_aligned(classes in prop::collection::vec(page_size(), 1..100)) {
        let mut pc = small_cache();
        let mut live: Vec<MemBlock> = Vec::new();
        for class in classes {
            let page = pc.alloc_page(class).unwrap();
            prop_assert_eq!(page.size(), class.bytes());
            prop_assert_eq!(page.addr_usize() % class.bytes(), 0);
            prop_assert!(live.iter().all(|other| !overlaps(other, &page)));
            live.push(page);
        }
        for page in &mut live {
            pc.release_page(page).unwrap();
        }
        pc.free().unwrap();
    }

    /// Releasing a freshly allocated page restores size_allocated
    #[test]
    fn pagecache_alloc_release_roundtrip(
        prefix in prop::collection::vec(page_size(), 0..20),
        class in page_size(),
    ) {
        let mut pc = small_cache();
        let mut live: Vec<MemBlock> = prefix.into_iter().map(|c| pc.alloc_page(c).unwrap()).collect();
        let before = pc.size_allocated();
        let mut page = pc.alloc_page(class).unwrap();
        pc.release_page(&mut page).unwrap();
        prop_assert_eq!(pc.size_allocated(), before);
        for page in &mut live {
            pc.release_page(page).unwrap();
        }
        pc.free().unwrap();
    }

    /// assign is stable and at agrees with it on existing data blocks
    #[test]
    fn blockarray_assign_stable_and_at_consistent(
        elementsize in 1usize..=64,
        indices in prop::collection::vec(0usize..1_000_000, 1..50),
        probes in prop::collection::vec(0usize..1_000_000, 1..50),
    ) {
        let mut pc = small_cache();
        let mut ba = BlockArray::new(&mut pc, PageSize::Size256, elementsize).unwrap();
        let per_block = ba.elements_per_block();
        let mut leaves: HashSet<usize> = HashSet::new();
        leaves.insert(0);

        for &index in &indices {
            let first = ba.assign(&mut pc, index).unwrap();
            let second = ba.assign(&mut pc, index).unwrap();
            prop_assert_eq!(first, second);
            prop_assert_eq!(ba.at(index), Some(first));
            leaves.insert(index / per_block);
        }
        for &probe in &probes {
            match ba.at(probe) {
                Some(element) => {
                    prop_assert!(leaves.contains(&(probe / per_block)));
                    prop_assert_eq!(ba.assign(&mut pc, probe).unwrap(), element);
                }
                None => prop_assert!(!leaves.contains(&(probe / per_block))),
            }
        }

        ba.free(&mut pc).unwrap();
        pc.free().unwrap();
    }

    /// Freeing a block array gives back every page it took
    #[test]
    fn blockarray_free_restores_cache(
        class in page_size(),
        indices in prop::collection::vec(any::<u32>(), 0..30),
    ) {
        let mut pc = small_cache();
        let mut other = pc.alloc_page(PageSize::Size512).unwrap();
        let before = pc.size_allocated();

        let mut ba = BlockArray::new(&mut pc, class, 8).unwrap();
        for index in indices {
            ba.assign(&mut pc, index as usize).unwrap();
        }
        prop_assert!(pc.size_allocated() > before);
        ba.free(&mut pc).unwrap();
        prop_assert_eq!(pc.size_allocated(), before);

        pc.release_page(&mut other).unwrap();
        pc.free().unwrap();
    }

    /// memfree accepts only the most recent allocation
    #[test]
    fn static_memory_is_lifo(
        sizes in prop::collection::vec(1usize..512, 2..20),
        victim in any::<usize>(),
    ) {
        let mut buf = vec![0u8; 16 * 1024];
        let mut statmem = StaticMemory::new(MemBlock::new(buf.as_mut_ptr(), buf.len()));
        let mut blocks: Vec<MemBlock> = sizes.iter().map(|&size| statmem.memalloc(size).unwrap()).collect();
        let used = statmem.size_static();

        let victim = victim % (blocks.len() - 1);
        prop_assert_eq!(statmem.memfree(&mut blocks[victim]), Err(Error::InvalidArgument));
        prop_assert_eq!(statmem.size_static(), used);
        prop_assert!(!blocks[victim].is_free());

        let last = blocks[blocks.len() - 1];
        let prev = blocks[blocks.len() - 2];
        let mut combined = MemBlock::new(prev.addr(), prev.size() + last.size());
        prop_assert_eq!(statmem.memfree(&mut combined), Err(Error::InvalidArgument));
        if last.size() > 16 {
            let mut tail = MemBlock::new(last.addr().wrapping_add(16), last.size() - 16);
            prop_assert_eq!(statmem.memfree(&mut tail), Err(Error::InvalidArgument));
        }
        prop_assert_eq!(statmem.size_static(), used);

        while let Some(mut block) = blocks.pop() {
            statmem.memfree(&mut block).unwrap();
        }
        prop_assert_eq!(statmem.size_static(), 0);
    }
}
