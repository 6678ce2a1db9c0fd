//! Memory backing thread stacks.
//!
//! Every stack a thread holds carries an ownership tag: memory carved out of
//! the kernel's [`MemoryProvider`] goes back to it when the thread is
//! reclaimed, while caller-supplied memory is only ever borrowed. The bundled
//! [`StaticPool`] is a statically provisioned first-fit heap, so the manager
//! works without a global allocator.

use core::ptr::NonNull;
use core::slice;

pub const STACK_ALIGN: usize = 8;
pub const MIN_STACK_SIZE: usize = 128;
pub const MAX_STACK_SIZE: usize = 0x7fff_ffff;

/// Byte pattern written over a fresh stack so untouched headroom can be measured.
pub const STACK_FILL_PATTERN: u8 = 0xCC;
/// Word kept at the lowest stack address; a damaged value means the stack overflowed.
pub const STACK_MAGIC_WORD: u32 = 0xE25A_2EA5;
const MAGIC_LEN: usize = core::mem::size_of::<u32>();

/// A block handed out by a [`MemoryProvider`], addressed by offset so it
/// stays valid however the provider itself is moved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    offset: usize,
    size: usize,
}

impl Allocation {
    pub const fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }

    pub const fn size(&self) -> usize {
        self.size
    }
}

/// Source of kernel-managed stacks.
pub trait MemoryProvider {
    fn allocate(&mut self, size: usize, align: usize) -> Option<Allocation>;
    /// Returns `false` when `allocation` was not handed out by this provider.
    fn release(&mut self, allocation: Allocation) -> bool;
    fn bytes(&self, allocation: Allocation) -> &[u8];
    fn bytes_mut(&mut self, allocation: Allocation) -> &mut [u8];
}

/// Caller-owned memory lent to the kernel for the lifetime of one thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallerRegion {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: a region is handed to the kernel exclusively; it is only touched
// through the manager, which is itself serialized by the kernel lock.
unsafe impl Send for CallerRegion {}

impl CallerRegion {
    pub fn from_static(memory: &'static mut [u8]) -> Self {
        let len = memory.len();
        Self {
            base: NonNull::from(memory).cast::<u8>(),
            len,
        }
    }

    /// Lend raw memory, e.g. a statically placed stack that is reused
    /// after the previous owner was reclaimed.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes and must not be
    /// accessed by anything else until the thread using it is reclaimed.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(ptr).map(|base| Self { base, len })
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_aligned(&self, align: usize) -> bool {
        (self.base.as_ptr() as usize) % align == 0
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: guaranteed by the constructors' exclusivity contract.
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: guaranteed by the constructors' exclusivity contract.
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
    }
}

/// Ownership tag attached to each stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    Kernel(Allocation),
    Caller(CallerRegion),
}

impl Region {
    pub const fn len(&self) -> usize {
        match self {
            Region::Kernel(allocation) => allocation.size(),
            Region::Caller(region) => region.len(),
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn is_kernel_owned(&self) -> bool {
        matches!(self, Region::Kernel(_))
    }

    pub fn bytes<'a, M: MemoryProvider>(&'a self, memory: &'a M) -> &'a [u8] {
        match self {
            Region::Kernel(allocation) => memory.bytes(*allocation),
            Region::Caller(region) => region.bytes(),
        }
    }

    pub fn bytes_mut<'a, M: MemoryProvider>(&'a mut self, memory: &'a mut M) -> &'a mut [u8] {
        match self {
            Region::Kernel(allocation) => memory.bytes_mut(*allocation),
            Region::Caller(region) => region.bytes_mut(),
        }
    }

    /// Hands kernel-owned memory back to `memory`; borrowed memory is left alone.
    pub fn release<M: MemoryProvider>(self, memory: &mut M) {
        if let Region::Kernel(allocation) = self {
            if !memory.release(allocation) {
                log::error!(
                    "memory provider rejected release of {} bytes at offset {}",
                    allocation.size(),
                    allocation.offset()
                );
            }
        }
    }
}

/// Writes the overflow magic word at the low end of `stack` and, when
/// `watermark` is set, paints the remainder with [`STACK_FILL_PATTERN`].
pub fn prepare_stack(stack: &mut [u8], watermark: bool) {
    if stack.len() < MAGIC_LEN {
        return;
    }
    let (magic, body) = stack.split_at_mut(MAGIC_LEN);
    magic.copy_from_slice(&STACK_MAGIC_WORD.to_le_bytes());
    if watermark {
        body.fill(STACK_FILL_PATTERN);
    }
}

pub fn stack_magic_intact(stack: &[u8]) -> bool {
    stack.len() >= MAGIC_LEN && stack[..MAGIC_LEN] == STACK_MAGIC_WORD.to_le_bytes()
}

/// Bytes above the magic word that still hold the fill pattern. Stacks grow
/// downwards, so the untouched area is contiguous from the low end.
pub fn stack_headroom(stack: &[u8]) -> usize {
    if !stack_magic_intact(stack) {
        return 0;
    }
    stack[MAGIC_LEN..]
        .iter()
        .take_while(|byte| **byte == STACK_FILL_PATTERN)
        .count()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FreeRegion {
    offset: usize,
    size: usize,
}

impl FreeRegion {
    const fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    fn end(&self) -> usize {
        self.offset + self.size
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct AllocationStats {
    pub allocated_bytes: usize,
    pub peak_allocated_bytes: usize,
    pub live_allocations: usize,
}

#[repr(C, align(16))]
struct Heap<const N: usize>([u8; N]);

/// First-fit heap over an inline byte array, with a bump pointer for fresh
/// space and a coalescing free list for returned blocks.
pub struct StaticPool<const HEAP_SIZE: usize, const MAX_AREAS: usize> {
    heap: Heap<HEAP_SIZE>,
    bump_offset: usize,
    allocations: [Option<Allocation>; MAX_AREAS],
    free_regions: [Option<FreeRegion>; MAX_AREAS],
    allocated_bytes: usize,
    peak_bytes: usize,
}

impl<const HEAP_SIZE: usize, const MAX_AREAS: usize> StaticPool<HEAP_SIZE, MAX_AREAS> {
    pub const fn new() -> Self {
        Self {
            heap: Heap([0; HEAP_SIZE]),
            bump_offset: 0,
            allocations: [None; MAX_AREAS],
            free_regions: [None; MAX_AREAS],
            allocated_bytes: 0,
            peak_bytes: 0,
        }
    }

    pub fn statistics(&self) -> AllocationStats {
        AllocationStats {
            allocated_bytes: self.allocated_bytes,
            peak_allocated_bytes: self.peak_bytes,
            live_allocations: self.allocations.iter().flatten().count(),
        }
    }

    fn reserve(&mut self, size: usize, align: usize) -> Option<usize> {
        if let Some(offset) = self.reserve_from_free_list(size, align) {
            return Some(offset);
        }

        let aligned_offset = align_up(self.bump_offset, align)?;
        let end = aligned_offset.checked_add(size)?;
        if end > HEAP_SIZE {
            return None;
        }
        self.bump_offset = end;
        Some(aligned_offset)
    }

    fn reserve_from_free_list(&mut self, size: usize, align: usize) -> Option<usize> {
        let mut idx = 0;
        while idx < MAX_AREAS {
            if let Some(region) = self.free_regions[idx] {
                let aligned_start = align_up(region.offset, align)?;
                let end = aligned_start.checked_add(size)?;
                if end <= region.end() {
                    self.free_regions[idx] = None;
                    if aligned_start > region.offset {
                        self.insert_free_region(FreeRegion::new(
                            region.offset,
                            aligned_start - region.offset,
                        ));
                    }
                    if end < region.end() {
                        self.insert_free_region(FreeRegion::new(end, region.end() - end));
                    }
                    return Some(aligned_start);
                }
            }
            idx += 1;
        }
        None
    }

    fn record_allocation(&mut self, allocation: Allocation) -> bool {
        match self.allocations.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(allocation);
                true
            }
            None => false,
        }
    }

    fn insert_free_region(&mut self, region: FreeRegion) {
        if region.size == 0 {
            return;
        }

        let mut merged = region;
        let mut idx = 0;
        while idx < MAX_AREAS {
            if let Some(existing) = self.free_regions[idx] {
                if existing.end() == merged.offset {
                    merged = FreeRegion::new(existing.offset, existing.size + merged.size);
                    self.free_regions[idx] = None;
                } else if merged.end() == existing.offset {
                    merged = FreeRegion::new(merged.offset, merged.size + existing.size);
                    self.free_regions[idx] = None;
                }
            }
            idx += 1;
        }

        // Give the space back to the bump pointer when it is the top block.
        if merged.end() == self.bump_offset {
            self.bump_offset = merged.offset;
            return;
        }

        if let Some(slot) = self.free_regions.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(merged);
        } else {
            log::warn!("free list full, leaking {} bytes", merged.size);
        }
    }
}

impl<const HEAP_SIZE: usize, const MAX_AREAS: usize> Default for StaticPool<HEAP_SIZE, MAX_AREAS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const HEAP_SIZE: usize, const MAX_AREAS: usize> MemoryProvider
    for StaticPool<HEAP_SIZE, MAX_AREAS>
{
    fn allocate(&mut self, size: usize, align: usize) -> Option<Allocation> {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }
        let size = align_up(size, align)?;
        if !self.allocations.iter().any(Option::is_none) {
            return None;
        }
        let offset = self.reserve(size, align)?;
        let allocation = Allocation::new(offset, size);
        // A free record was confirmed above.
        self.record_allocation(allocation);
        self.allocated_bytes = self.allocated_bytes.saturating_add(size);
        self.peak_bytes = self.peak_bytes.max(self.allocated_bytes);
        Some(allocation)
    }

    fn release(&mut self, allocation: Allocation) -> bool {
        let Some(slot) = self
            .allocations
            .iter_mut()
            .find(|slot| **slot == Some(allocation))
        else {
            return false;
        };
        *slot = None;
        self.insert_free_region(FreeRegion::new(allocation.offset, allocation.size));
        self.allocated_bytes = self.allocated_bytes.saturating_sub(allocation.size);
        true
    }

    fn bytes(&self, allocation: Allocation) -> &[u8] {
        &self.heap.0[allocation.offset..allocation.offset + allocation.size]
    }

    fn bytes_mut(&mut self, allocation: Allocation) -> &mut [u8] {
        &mut self.heap.0[allocation.offset..allocation.offset + allocation.size]
    }
}

fn align_up(value: usize, align: usize) -> Option<usize> {
    if align <= 1 {
        return Some(value);
    }
    Some(value.checked_add(align - 1)? & !(align - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(8))]
    struct AlignedBytes([u8; 256]);

    fn leaked_region() -> CallerRegion {
        let bytes = Box::leak(Box::new(AlignedBytes([0; 256])));
        CallerRegion::from_static(&mut bytes.0)
    }

    #[test]
    fn allocate_and_release_cycle() {
        let mut pool: StaticPool<4096, 16> = StaticPool::new();
        let block = pool.allocate(100, 8).expect("allocation succeeds");
        assert_eq!(block.size(), 104);
        assert_eq!(block.offset() % 8, 0);
        assert!(pool.release(block));
        assert_eq!(pool.statistics().allocated_bytes, 0);
        assert_eq!(pool.statistics().peak_allocated_bytes, 104);
    }

    #[test]
    fn released_space_is_reused() {
        let mut pool: StaticPool<1024, 8> = StaticPool::new();
        let a = pool.allocate(256, 8).unwrap();
        let b = pool.allocate(256, 8).unwrap();
        let _c = pool.allocate(256, 8).unwrap();
        assert!(pool.release(a));
        assert!(pool.release(b));
        let merged = pool.allocate(512, 8).expect("coalesced block fits");
        assert_eq!(merged.offset(), 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pool: StaticPool<512, 8> = StaticPool::new();
        assert!(pool.allocate(384, 8).is_some());
        assert!(pool.allocate(256, 8).is_none());
        assert!(pool.allocate(0, 8).is_none());
    }

    #[test]
    fn releasing_foreign_allocation_fails() {
        let mut pool: StaticPool<512, 8> = StaticPool::new();
        assert!(!pool.release(Allocation::new(64, 32)));
    }

    #[test]
    fn prepared_stack_reports_full_headroom() {
        let mut stack = [0u8; 128];
        prepare_stack(&mut stack, true);
        assert!(stack_magic_intact(&stack));
        assert_eq!(stack_headroom(&stack), 124);

        // Simulate 40 bytes of use from the top.
        stack[88..].fill(0);
        assert_eq!(stack_headroom(&stack), 84);
    }

    #[test]
    fn damaged_magic_reports_no_headroom() {
        let mut stack = [0u8; 64];
        prepare_stack(&mut stack, true);
        stack[0] = 0;
        assert!(!stack_magic_intact(&stack));
        assert_eq!(stack_headroom(&stack), 0);
    }

    #[test]
    fn caller_region_is_never_released_to_pool() {
        let mut pool: StaticPool<512, 8> = StaticPool::new();
        let region = Region::Caller(leaked_region());
        assert!(!region.is_kernel_owned());
        assert_eq!(region.len(), 256);
        region.release(&mut pool);
        assert_eq!(pool.statistics().live_allocations, 0);
    }

    #[test]
    fn region_bytes_cover_both_owners() {
        let mut pool: StaticPool<512, 8> = StaticPool::new();
        let mut kernel = Region::Kernel(pool.allocate(64, 8).unwrap());
        kernel.bytes_mut(&mut pool)[0] = 0xAB;
        assert_eq!(kernel.bytes(&pool)[0], 0xAB);

        let mut caller = Region::Caller(leaked_region());
        caller.bytes_mut(&mut pool)[255] = 0x5A;
        assert_eq!(caller.bytes(&pool)[255], 0x5A);
        assert!(leaked_region().is_aligned(STACK_ALIGN));
    }
}
