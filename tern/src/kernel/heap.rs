//! The kernel heap.
//!
//! A single free-list allocator over a fixed arena serves both kernel
//! metadata (TCBs, stacks, timers, queue buffers) and user allocations.
//! Every chunk carries a one-word header holding its payload size and a
//! used bit; free chunks keep a singly-linked free list, in address order
//! so that neighbours found by header walks can be merged without
//! searching. Allocation walks the free list and takes the first chunk
//! large enough, splitting off the remainder when it is worth a header.
//!
//! The whole alloc/free path runs under the kernel critical section, so
//! it is callable from thread and interrupt context alike. Exhaustion is
//! reported to the caller; the kernel never panics for lack of memory.

use crate::cell::RacyCell;
use crate::error::Error;
use crate::kernel::HEAP_SIZE;
use crate::sync::interrupt_lock::InterruptLock;
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use static_cell::ConstStaticCell;
use tern_khal::{Aligned, A8};

/// Alignment of every payload the heap hands out: the maximum scalar
/// alignment of a Cortex-M4 with FPU.
pub const HEAP_ALIGN: usize = 8;

const USED_BIT: usize = 1;

/// Smallest payload worth splitting off as a separate free chunk.
const MIN_SPLIT: usize = 16;

#[repr(C, align(8))]
struct Header {
    word: usize,
}

const HEADER_SIZE: usize = core::mem::size_of::<Header>();

impl Header {
    fn size(&self) -> usize {
        self.word & !USED_BIT
    }

    fn is_used(&self) -> bool {
        self.word & USED_BIT != 0
    }

    fn set(&mut self, size: usize, used: bool) {
        debug_assert_eq!(size % HEAP_ALIGN, 0);
        self.word = size | if used { USED_BIT } else { 0 };
    }
}

fn payload(chunk: NonNull<Header>) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(chunk.as_ptr().add(1) as *mut u8) }
}

fn header_of(payload: NonNull<u8>) -> NonNull<Header> {
    unsafe { NonNull::new_unchecked((payload.as_ptr() as *mut Header).sub(1)) }
}

// The free-list link lives in the free chunk's payload, so used chunks
// pay only for the header.
unsafe fn free_link(chunk: NonNull<Header>) -> *mut Option<NonNull<Header>> {
    payload(chunk).as_ptr() as *mut Option<NonNull<Header>>
}

pub struct Heap {
    base: *mut u8,
    size: usize,
    free_head: Option<NonNull<Header>>,
    used_bytes: usize,
}

unsafe impl Send for Heap {}

impl Heap {
    pub const fn empty() -> Heap {
        Heap {
            base: core::ptr::null_mut(),
            size: 0,
            free_head: None,
            used_bytes: 0,
        }
    }

    /// Take ownership of `[base, base + size)` as the heap region.
    ///
    /// # Safety
    ///
    /// The region must be writable, 8-byte aligned, unused by anything
    /// else, and live for as long as the heap.
    pub unsafe fn init(&mut self, base: *mut u8, size: usize) {
        debug_assert_eq!(base as usize % HEAP_ALIGN, 0);
        let size = size & !(HEAP_ALIGN - 1);
        assert!(size > HEADER_SIZE + MIN_SPLIT);

        self.base = base;
        self.size = size;
        self.used_bytes = 0;

        let first = unsafe { NonNull::new_unchecked(base as *mut Header) };
        unsafe {
            (*first.as_ptr()).set(size - HEADER_SIZE, false);
            *free_link(first) = None;
        }
        self.free_head = Some(first);
    }

    fn end(&self) -> *mut u8 {
        unsafe { self.base.add(self.size) }
    }

    /// The chunk immediately after `chunk` in memory, if any.
    fn neighbor(&self, chunk: NonNull<Header>) -> Option<NonNull<Header>> {
        let next = unsafe { payload(chunk).as_ptr().add((*chunk.as_ptr()).size()) };
        if next < self.end() {
            Some(unsafe { NonNull::new_unchecked(next as *mut Header) })
        } else {
            None
        }
    }

    fn owns(&self, p: NonNull<u8>) -> bool {
        let addr = p.as_ptr() as usize;
        let lo = self.base as usize + HEADER_SIZE;
        let hi = self.end() as usize;
        addr >= lo && addr < hi && addr % HEAP_ALIGN == 0
    }

    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let size = round_up(size.max(1));

        let mut prev: Option<NonNull<Header>> = None;
        let mut at = self.free_head;
        while let Some(chunk) = at {
            let chunk_size = unsafe { (*chunk.as_ptr()).size() };
            if chunk_size >= size {
                let next_free = unsafe { *free_link(chunk) };

                // Unlink from the free list.
                match prev {
                    Some(prev) => unsafe { *free_link(prev) = next_free },
                    None => self.free_head = next_free,
                }

                if chunk_size - size >= HEADER_SIZE + MIN_SPLIT {
                    // Split: the remainder becomes a free chunk right
                    // after the allocation, which keeps the free list in
                    // address order when relinked in the same position.
                    let rest = unsafe {
                        NonNull::new_unchecked(
                            payload(chunk).as_ptr().add(size) as *mut Header
                        )
                    };
                    unsafe {
                        (*rest.as_ptr()).set(chunk_size - size - HEADER_SIZE, false);
                        *free_link(rest) = next_free;
                        match prev {
                            Some(prev) => *free_link(prev) = Some(rest),
                            None => self.free_head = Some(rest),
                        }
                        (*chunk.as_ptr()).set(size, true);
                    }
                } else {
                    unsafe { (*chunk.as_ptr()).set(chunk_size, true) };
                }

                self.used_bytes += unsafe { (*chunk.as_ptr()).size() };
                return Some(payload(chunk));
            }
            prev = at;
            at = unsafe { *free_link(chunk) };
        }
        None
    }

    /// Return `p` to the heap, merging with free neighbours.
    ///
    /// # Safety
    ///
    /// `p` must have come from `alloc` on this heap and must not be used
    /// afterwards.
    pub unsafe fn free(&mut self, p: NonNull<u8>) -> Result<(), Error> {
        if !self.owns(p) {
            return Err(Error::InvalidState);
        }
        let chunk = header_of(p);
        if !unsafe { (*chunk.as_ptr()).is_used() } {
            return Err(Error::InvalidState);
        }

        let size = unsafe { (*chunk.as_ptr()).size() };
        self.used_bytes -= size;
        unsafe { (*chunk.as_ptr()).set(size, false) };

        // Find the free-list position: prev is the last free chunk below
        // this one in memory.
        let mut prev: Option<NonNull<Header>> = None;
        let mut at = self.free_head;
        while let Some(f) = at {
            if f > chunk {
                break;
            }
            prev = at;
            at = unsafe { *free_link(f) };
        }

        unsafe {
            *free_link(chunk) = at;
            match prev {
                Some(prev) => *free_link(prev) = Some(chunk),
                None => self.free_head = Some(chunk),
            }
        }

        // Merge the forward neighbour if it is free.
        if let Some(next) = self.neighbor(chunk) {
            if Some(next) == at && !unsafe { (*next.as_ptr()).is_used() } {
                unsafe {
                    let merged = (*chunk.as_ptr()).size()
                        + HEADER_SIZE
                        + (*next.as_ptr()).size();
                    *free_link(chunk) = *free_link(next);
                    (*chunk.as_ptr()).set(merged, false);
                }
            }
        }

        // Merge into the backward neighbour if it is free and adjacent.
        if let Some(prev) = prev {
            if self.neighbor(prev) == Some(chunk) {
                unsafe {
                    let merged = (*prev.as_ptr()).size()
                        + HEADER_SIZE
                        + (*chunk.as_ptr()).size();
                    *free_link(prev) = *free_link(chunk);
                    (*prev.as_ptr()).set(merged, false);
                }
            }
        }

        Ok(())
    }

    pub fn total_size(&self) -> usize {
        self.size
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut at = self.free_head;
        while let Some(f) = at {
            total += unsafe { (*f.as_ptr()).size() };
            at = unsafe { *free_link(f) };
        }
        total
    }

    pub fn largest_free(&self) -> usize {
        let mut largest = 0;
        let mut at = self.free_head;
        while let Some(f) = at {
            largest = largest.max(unsafe { (*f.as_ptr()).size() });
            at = unsafe { *free_link(f) };
        }
        largest
    }

    /// Walk every chunk and check the accounting identities: headers plus
    /// payloads tile the region exactly, and no two free chunks are
    /// adjacent.
    #[cfg(test)]
    fn check_consistency(&self) {
        let mut covered = 0;
        let mut prev_free = false;
        let mut at = NonNull::new(self.base as *mut Header);
        while let Some(chunk) = at {
            let size = unsafe { (*chunk.as_ptr()).size() };
            let used = unsafe { (*chunk.as_ptr()).is_used() };
            assert!(!(prev_free && !used), "adjacent free chunks not merged");
            prev_free = !used;
            covered += HEADER_SIZE + size;
            at = self.neighbor(chunk);
        }
        assert_eq!(covered, self.size);
        assert_eq!(self.free_bytes() + self.used_bytes, self.payload_capacity());
    }

    #[cfg(test)]
    fn payload_capacity(&self) -> usize {
        let mut capacity = 0;
        let mut at = NonNull::new(self.base as *mut Header);
        while let Some(chunk) = at {
            capacity += unsafe { (*chunk.as_ptr()).size() };
            at = self.neighbor(chunk);
        }
        capacity
    }
}

fn round_up(size: usize) -> usize {
    (size + HEAP_ALIGN - 1) & !(HEAP_ALIGN - 1)
}

static ARENA: ConstStaticCell<Aligned<A8, [MaybeUninit<u8>; HEAP_SIZE]>> =
    ConstStaticCell::new(Aligned([MaybeUninit::uninit(); HEAP_SIZE]));

static KERNEL_HEAP: RacyCell<Heap> = RacyCell::new(Heap::empty());

static INIT_DONE: AtomicBool = AtomicBool::new(false);

/// Hand the arena to the kernel heap. Idempotent.
pub(crate) fn init() {
    if INIT_DONE.swap(true, Ordering::Relaxed) {
        return;
    }
    let arena = ARENA.take();
    InterruptLock::with(|_key| unsafe {
        KERNEL_HEAP
            .get_mut()
            .init(arena.as_mut_ptr() as *mut u8, HEAP_SIZE);
    });
}

/// Allocate `size` bytes from the kernel heap, 8-byte aligned. Returns
/// `None` on exhaustion.
pub fn alloc(size: usize) -> Option<NonNull<u8>> {
    InterruptLock::with(|_key| unsafe { KERNEL_HEAP.get_mut() }.alloc(size))
}

/// Return an allocation to the kernel heap.
///
/// # Safety
///
/// `p` must have come from [`alloc`] and must not be used afterwards.
pub unsafe fn free(p: NonNull<u8>) -> Result<(), Error> {
    InterruptLock::with(|_key| unsafe { KERNEL_HEAP.get_mut().free(p) })
}

#[derive(Copy, Clone, Debug)]
pub struct HeapStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
    pub largest_free: usize,
}

pub fn stats() -> HeapStats {
    InterruptLock::with(|_key| {
        let heap = unsafe { KERNEL_HEAP.get_mut() };
        HeapStats {
            total: heap.total_size(),
            used: heap.used_bytes(),
            free: heap.free_bytes(),
            largest_free: heap.largest_free(),
        }
    })
}

/// `GlobalAlloc` front end so user code can run `alloc::boxed::Box` and
/// friends over the kernel heap. Alignments above 8 are not supported and
/// report exhaustion.
pub struct KernelAllocator;

unsafe impl core::alloc::GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        if layout.align() > HEAP_ALIGN {
            return core::ptr::null_mut();
        }
        match alloc(layout.size()) {
            Some(p) => p.as_ptr(),
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        if let Some(p) = NonNull::new(ptr) {
            let _ = unsafe { free(p) };
        }
    }
}

#[cfg(feature = "khal-cortex-m")]
#[global_allocator]
static KERNEL_ALLOCATOR: KernelAllocator = KernelAllocator;

#[cfg(test)]
mod tests {
    use super::{Heap, HEADER_SIZE, HEAP_ALIGN};
    use core::ptr::NonNull;

    const TEST_HEAP: usize = 64 * 1024;

    struct TestHeap {
        heap: Heap,
        _arena: std::boxed::Box<[u64]>,
    }

    fn test_heap() -> TestHeap {
        let mut arena = std::vec![0u64; TEST_HEAP / 8].into_boxed_slice();
        let mut heap = Heap::empty();
        unsafe { heap.init(arena.as_mut_ptr() as *mut u8, TEST_HEAP) };
        TestHeap {
            heap,
            _arena: arena,
        }
    }

    #[test]
    fn alloc_is_aligned() {
        let mut t = test_heap();
        for size in [1, 7, 8, 9, 100, 511] {
            let p = t.heap.alloc(size).unwrap();
            assert_eq!(p.as_ptr() as usize % HEAP_ALIGN, 0);
        }
        t.heap.check_consistency();
    }

    #[test]
    fn alloc_free_restores_free_bytes() {
        let mut t = test_heap();
        let before = t.heap.free_bytes();
        let p = t.heap.alloc(100).unwrap();
        assert!(t.heap.free_bytes() < before);
        unsafe { t.heap.free(p).unwrap() };
        assert_eq!(t.heap.free_bytes(), before);
        t.heap.check_consistency();
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut t = test_heap();
        assert!(t.heap.alloc(TEST_HEAP).is_none());

        let mut live = std::vec::Vec::new();
        loop {
            match t.heap.alloc(4096) {
                Some(p) => live.push(p),
                None => break,
            }
        }
        assert!(!live.is_empty());
        t.heap.check_consistency();
        for p in live {
            unsafe { t.heap.free(p).unwrap() };
        }
        assert_eq!(t.heap.used_bytes(), 0);
        t.heap.check_consistency();
    }

    #[test]
    fn coalesce_both_directions() {
        let mut t = test_heap();
        let a = t.heap.alloc(64).unwrap();
        let b = t.heap.alloc(64).unwrap();
        let c = t.heap.alloc(64).unwrap();
        let _hold = t.heap.alloc(64).unwrap();

        // Free in an order that exercises forward then backward merges.
        unsafe {
            t.heap.free(a).unwrap();
            t.heap.free(c).unwrap();
            t.heap.free(b).unwrap();
        }
        t.heap.check_consistency();

        // The three chunks plus their inner headers are one block again.
        assert!(t.heap.largest_free() >= 3 * 64 + 2 * HEADER_SIZE);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut t = test_heap();
        let p = t.heap.alloc(32).unwrap();
        unsafe {
            t.heap.free(p).unwrap();
            assert!(t.heap.free(p).is_err());
        }
    }

    #[test]
    fn foreign_pointer_is_rejected() {
        let mut t = test_heap();
        let mut outside = 0u64;
        let p = NonNull::new(&mut outside as *mut u64 as *mut u8).unwrap();
        assert!(unsafe { t.heap.free(p) }.is_err());
    }

    #[test]
    fn churn_keeps_accounting_exact() {
        let mut t = test_heap();
        let mut live: std::vec::Vec<(NonNull<u8>, usize)> = std::vec::Vec::new();
        let mut seed = 0x2545_f491_4f6c_dd1du64;
        let mut rng = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for _ in 0..10_000 {
            let action = rng() % 3;
            if action < 2 || live.is_empty() {
                let size = 8 + (rng() as usize % 505);
                if let Some(p) = t.heap.alloc(size) {
                    // Scribble over the payload; accounting must survive.
                    unsafe { core::ptr::write_bytes(p.as_ptr(), 0xa5, size) };
                    live.push((p, size));
                }
            } else {
                let idx = rng() as usize % live.len();
                let (p, _) = live.swap_remove(idx);
                unsafe { t.heap.free(p).unwrap() };
            }
            assert_eq!(
                t.heap.free_bytes() + t.heap.used_bytes(),
                t.heap.payload_capacity()
            );
        }
        for (p, _) in live {
            unsafe { t.heap.free(p).unwrap() };
        }
        t.heap.check_consistency();
        assert_eq!(t.heap.used_bytes(), 0);
    }
}
