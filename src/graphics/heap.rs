use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use tracing::warn;

use super::{ReleaseError, ResourceKind};

/// Accounting for memory held by native graphics objects.
///
/// Native allocations are invisible to Rust's ownership tracking once they
/// cross into the raster backend, so every handle carries an [`Allocation`]
/// that must be released explicitly. Handles dropped without a release are
/// counted as leaks and their bytes stay accounted.
#[derive(Debug, Default)]
pub struct NativeHeap {
    live_bytes: AtomicU64,
    live_handles: AtomicUsize,
    total_allocations: AtomicU64,
    total_releases: AtomicU64,
    leaked_handles: AtomicU64,
}

/// Point-in-time view of a [`NativeHeap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub live_bytes: u64,
    pub live_handles: usize,
    pub total_allocations: u64,
    pub total_releases: u64,
    pub leaked_handles: u64,
}

impl NativeHeap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn allocate(self: &Arc<Self>, kind: ResourceKind, bytes: u64) -> Allocation {
        self.live_bytes.fetch_add(bytes, Ordering::AcqRel);
        self.live_handles.fetch_add(1, Ordering::AcqRel);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        Allocation {
            heap: Arc::clone(self),
            kind,
            bytes,
            released: AtomicBool::new(false),
        }
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live_bytes: self.live_bytes.load(Ordering::Acquire),
            live_handles: self.live_handles.load(Ordering::Acquire),
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            total_releases: self.total_releases.load(Ordering::Relaxed),
            leaked_handles: self.leaked_handles.load(Ordering::Relaxed),
        }
    }
}

/// Ownership token for one native allocation.
#[derive(Debug)]
pub(crate) struct Allocation {
    heap: Arc<NativeHeap>,
    kind: ResourceKind,
    bytes: u64,
    released: AtomicBool,
}

impl Allocation {
    pub(crate) fn release(&self) -> Result<(), ReleaseError> {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ReleaseError::AlreadyReleased(self.kind));
        }

        self.heap.live_bytes.fetch_sub(self.bytes, Ordering::AcqRel);
        self.heap.live_handles.fetch_sub(1, Ordering::AcqRel);
        self.heap.total_releases.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if !self.is_released() {
            self.heap.leaked_handles.fetch_add(1, Ordering::Relaxed);
            warn!(
                target = "graphics::heap",
                kind = %self.kind,
                bytes = self.bytes,
                result = "leaked",
                "Native handle dropped without release"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_returns_bytes_once() {
        let heap = NativeHeap::new();
        let allocation = heap.allocate(ResourceKind::Surface, 400);
        assert_eq!(heap.stats().live_bytes, 400);

        allocation.release().expect("first release");
        assert!(matches!(
            allocation.release(),
            Err(ReleaseError::AlreadyReleased(ResourceKind::Surface))
        ));

        let stats = heap.stats();
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(stats.live_handles, 0);
        assert_eq!(stats.total_releases, 1);
    }

    #[test]
    fn dropping_unreleased_allocation_counts_a_leak() {
        let heap = NativeHeap::new();
        drop(heap.allocate(ResourceKind::Font, 64));

        let stats = heap.stats();
        assert_eq!(stats.leaked_handles, 1);
        assert_eq!(stats.live_bytes, 64);
    }
}
