// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Physically contiguous, device-addressable memory.
//!
//! On the target the VPU driver hands out contiguous memory through its own allocator. The
//! [`SystemDmaAllocator`] provided here maps page-aligned anonymous memory instead and uses the
//! virtual address as device address, which is enough for software engines and tests. Consumers
//! that own contiguous memory themselves can wrap it with [`DmaBuffer::from_external`].

use std::ffi::c_void;
use std::fmt;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::mman::mmap_anonymous;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use thiserror::Error;

use crate::utils::align_up;

const PAGE_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum DmaError {
    #[error("cannot allocate an empty buffer")]
    ZeroSize,
    #[error("allocation of {requested} bytes exceeds the remaining {available} bytes")]
    OutOfMemory { requested: usize, available: usize },
    #[error("failed to map {0} bytes: {1}")]
    Map(usize, Errno),
}

enum Backing {
    Mapped { len: NonZeroUsize },
    External(Box<[u8]>),
}

/// A device-addressable memory region with a CPU mapping.
///
/// The region is released when the buffer is dropped.
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    size: usize,
    phys_addr: u64,
    backing: Backing,
    accounting: Option<Arc<AtomicUsize>>,
}

// The mapping is exclusively owned by this object, which only hands out borrows tied to its own
// lifetime.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Wraps memory owned by a downstream consumer. `phys_addr` is the device address the engine
    /// will be given for the first byte of `memory`.
    pub fn from_external(phys_addr: u64, mut memory: Box<[u8]>) -> Self {
        let size = memory.len();
        let ptr = NonNull::new(memory.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            size,
            phys_addr,
            backing: Backing::External(memory),
            accounting: None,
        }
    }

    pub fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the buffer was provided by a consumer rather than allocated by us.
    pub fn is_external(&self) -> bool {
        matches!(self.backing, Backing::External(_))
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` points to `size` bytes owned by `self` for its whole lifetime.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `ptr` points to `size` bytes owned by `self`, and `&mut self` guarantees no other
        // borrow exists.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("phys_addr", &format_args!("{:#x}", self.phys_addr))
            .field("size", &self.size)
            .field("external", &self.is_external())
            .finish()
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if let Backing::Mapped { len } = self.backing {
            // SAFETY: the region was mapped by `SystemDmaAllocator::allocate` with this length and
            // is not referenced anymore.
            if let Err(e) = unsafe { munmap(self.ptr.cast::<c_void>(), len.get()) } {
                log::error!("failed to unmap DMA buffer at {:#x}: {}", self.phys_addr, e);
            }
        }
        if let Some(accounting) = &self.accounting {
            accounting.fetch_sub(self.size, Ordering::SeqCst);
        }
    }
}

/// Source of device-addressable memory.
pub trait DmaAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> Result<DmaBuffer, DmaError>;
}

/// Allocator backed by anonymous page-aligned mappings, with an optional memory budget emulating
/// the limited contiguous memory region of the target.
#[derive(Debug, Default)]
pub struct SystemDmaAllocator {
    budget: Option<usize>,
    used: Arc<AtomicUsize>,
}

impl SystemDmaAllocator {
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates an allocator that refuses to hand out more than `budget` bytes at a time.
    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget: Some(budget),
            used: Default::default(),
        }
    }

    /// Number of bytes currently allocated through this allocator.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }
}

impl DmaAllocator for SystemDmaAllocator {
    fn allocate(&self, size: usize) -> Result<DmaBuffer, DmaError> {
        let len = NonZeroUsize::new(align_up(size, PAGE_SIZE)).ok_or(DmaError::ZeroSize)?;

        if let Some(budget) = self.budget {
            let used = self.used.fetch_add(size, Ordering::SeqCst);
            if used + size > budget {
                self.used.fetch_sub(size, Ordering::SeqCst);
                return Err(DmaError::OutOfMemory {
                    requested: size,
                    available: budget.saturating_sub(used),
                });
            }
        } else {
            self.used.fetch_add(size, Ordering::SeqCst);
        }

        // SAFETY: we request a fresh private anonymous mapping, which does not alias any existing
        // memory.
        let mapping = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        };
        let ptr = match mapping {
            Ok(ptr) => ptr.cast::<u8>(),
            Err(e) => {
                self.used.fetch_sub(size, Ordering::SeqCst);
                return Err(DmaError::Map(len.get(), e));
            }
        };

        Ok(DmaBuffer {
            ptr,
            size,
            phys_addr: ptr.as_ptr() as u64,
            backing: Backing::Mapped { len },
            accounting: Some(Arc::clone(&self.used)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_write() {
        let allocator = SystemDmaAllocator::new();
        let mut buffer = allocator.allocate(10_000).unwrap();
        assert_eq!(buffer.size(), 10_000);
        assert_eq!(buffer.phys_addr() % PAGE_SIZE as u64, 0);

        buffer.as_mut_slice()[9_999] = 0xa5;
        assert_eq!(buffer.as_slice()[9_999], 0xa5);
        assert_eq!(allocator.used(), 10_000);

        drop(buffer);
        assert_eq!(allocator.used(), 0);
    }

    #[test]
    fn budget_is_enforced() {
        let allocator = SystemDmaAllocator::with_budget(8192);
        let first = allocator.allocate(6000).unwrap();
        assert!(matches!(
            allocator.allocate(6000),
            Err(DmaError::OutOfMemory {
                requested: 6000,
                available: 2192
            })
        ));
        drop(first);
        assert!(allocator.allocate(6000).is_ok());
    }

    #[test]
    fn external_memory() {
        let buffer = DmaBuffer::from_external(0x1000_0000, vec![7u8; 64].into_boxed_slice());
        assert!(buffer.is_external());
        assert_eq!(buffer.phys_addr(), 0x1000_0000);
        assert_eq!(buffer.as_slice(), &[7u8; 64][..]);
        assert!(matches!(
            SystemDmaAllocator::new().allocate(0),
            Err(DmaError::ZeroSize)
        ));
    }
}
