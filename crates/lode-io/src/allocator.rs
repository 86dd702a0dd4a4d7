//! Buffer providers for reads that size their output from the file.

use crate::buffer::ReadBuffer;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Result of [`RequestMemoryAllocator::allocate`].
///
/// A `size` of zero means the allocation failed.
#[derive(Debug, Default)]
pub struct RequestMemoryAllocation {
    pub buffer: ReadBuffer,
    pub size: u64,
}

impl RequestMemoryAllocation {
    /// Allocation that produced no memory.
    pub fn failed() -> Self {
        Self::default()
    }

    /// Whether the allocation produced memory.
    pub fn is_valid(&self) -> bool {
        self.size > 0
    }
}

/// Provides output memory for read requests.
///
/// Implementations are called from the scheduling thread while the owning
/// thread may also hold the allocator, so they must be internally
/// thread-safe.
pub trait RequestMemoryAllocator: Send + Sync {
    /// Called once when a request using this allocator is queued.
    fn lock_allocator(&self);

    /// Called once when that request has been finalized.
    fn unlock_allocator(&self);

    /// Allocate at least `min_size` bytes, preferably `recommended_size`,
    /// starting on an `alignment` boundary.
    fn allocate(
        &self,
        min_size: u64,
        recommended_size: u64,
        alignment: usize,
    ) -> RequestMemoryAllocation;

    /// Return a buffer that will not be handed to the caller.
    fn release(&self, buffer: ReadBuffer);
}

/// Heap-backed allocator that tracks outstanding locks and allocations.
#[derive(Debug, Default)]
pub struct DefaultRequestAllocator {
    locks: AtomicUsize,
    allocations: AtomicUsize,
    allocated_bytes: AtomicU64,
}

impl DefaultRequestAllocator {
    /// Allocator with no outstanding locks or allocations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests currently holding the allocator.
    pub fn lock_count(&self) -> usize {
        self.locks.load(Ordering::Acquire)
    }

    /// Allocations handed out and not released.
    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::Acquire)
    }

    /// Total bytes handed out over the allocator's lifetime.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Relaxed)
    }
}

impl RequestMemoryAllocator for DefaultRequestAllocator {
    fn lock_allocator(&self) {
        self.locks.fetch_add(1, Ordering::AcqRel);
    }

    fn unlock_allocator(&self) {
        let previous = self.locks.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "allocator unlocked more often than locked");
    }

    fn allocate(
        &self,
        min_size: u64,
        recommended_size: u64,
        alignment: usize,
    ) -> RequestMemoryAllocation {
        let size = recommended_size.max(min_size);
        let Ok(len) = usize::try_from(size) else {
            return RequestMemoryAllocation::failed();
        };
        match ReadBuffer::aligned(len, alignment.max(1)) {
            Ok(buffer) => {
                self.allocations.fetch_add(1, Ordering::AcqRel);
                self.allocated_bytes.fetch_add(size, Ordering::Relaxed);
                RequestMemoryAllocation { buffer, size }
            }
            Err(e) => {
                tracing::warn!("Request allocation of {} bytes failed: {}", size, e);
                RequestMemoryAllocation::failed()
            }
        }
    }

    fn release(&self, buffer: ReadBuffer) {
        drop(buffer);
        self.allocations.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_prefers_recommended_size() {
        let allocator = DefaultRequestAllocator::new();
        let allocation = allocator.allocate(10, 64, 16);
        assert!(allocation.is_valid());
        assert_eq!(allocation.size, 64);
        assert_eq!(allocation.buffer.len(), 64);
        assert_eq!(allocation.buffer.address() % 16, 0);
        assert_eq!(allocator.allocation_count(), 1);

        allocator.release(allocation.buffer);
        assert_eq!(allocator.allocation_count(), 0);
    }

    #[test]
    fn test_lock_counting() {
        let allocator = DefaultRequestAllocator::new();
        allocator.lock_allocator();
        allocator.lock_allocator();
        assert_eq!(allocator.lock_count(), 2);
        allocator.unlock_allocator();
        assert_eq!(allocator.lock_count(), 1);
    }

    #[test]
    fn test_bad_alignment_fails_allocation() {
        let allocator = DefaultRequestAllocator::new();
        let allocation = allocator.allocate(8, 8, 3);
        assert!(!allocation.is_valid());
        assert_eq!(allocator.allocation_count(), 0);
    }
}
