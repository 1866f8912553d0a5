// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed pool of hardware frame buffers.
//!
//! Every buffer of the pool is in exactly one [`FrameBufferState`] at any time. Buffers handed to
//! the consumer are wrapped in a [`DisplayBuffer`] lease that moves the slot to
//! [`FrameBufferState::Pending`] when dropped. Pending slots only become usable by the engine again
//! after an explicit [`FramePool::release_pending`], which tells the engine the slot may be
//! overwritten.
//!
//! When post-processing is active the pool is split in two: decode slots, registered with the
//! engine, and rotator slots that receive the post-processed picture and are the ones handed to
//! the consumer.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use log::debug;
use log::trace;
use thiserror::Error;

use crate::backend::EngineError;
use crate::backend::FrameBufferDesc;
use crate::backend::VpuEngine;
use crate::utils::lock;
use crate::video_frame::dma::DmaAllocator;
use crate::video_frame::dma::DmaBuffer;
use crate::video_frame::dma::DmaError;
use crate::video_frame::FrameLayout;
use crate::video_frame::U_PLANE;
use crate::video_frame::V_PLANE;
use crate::video_frame::Y_PLANE;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FrameBufferState {
    /// Owned by the pool, usable as a decode target.
    Allocated,
    /// Holds a complete picture that has not been selected for display yet.
    Decoded,
    /// Referenced by the consumer.
    Display,
    /// Released by the consumer, waiting to be given back to the engine.
    Pending,
    /// Detached from a retired pool, waiting to be reclaimed.
    Free,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotRole {
    /// Registered with the engine as a decode target.
    Decode,
    /// Post-processing output, cycled by the decoder.
    Rotator,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to allocate frame buffer {index}: {source}")]
    Allocation {
        index: usize,
        #[source]
        source: DmaError,
    },
    #[error("frame buffers are already registered with the engine")]
    AlreadyRegistered,
    #[error("no frame buffer with index {0}")]
    InvalidIndex(usize),
    #[error("frame buffer {index} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        index: usize,
        from: FrameBufferState,
        to: FrameBufferState,
    },
    #[error("failed to hand frame buffers to the engine: {0}")]
    Engine(#[from] EngineError),
}

/// Number of buffers in each state.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub allocated: usize,
    pub decoded: usize,
    pub display: usize,
    pub pending: usize,
    pub free: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.allocated + self.decoded + self.display + self.pending + self.free
    }
}

/// Shape of a pool to allocate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PoolRequest {
    pub decode_layout: FrameLayout,
    pub num_decode: usize,
    /// Layout and number of the post-processing slots, if any.
    pub rotator: Option<(FrameLayout, usize)>,
}

impl PoolRequest {
    pub fn total(&self) -> usize {
        self.num_decode + self.rotator.map_or(0, |(_, n)| n)
    }
}

/// One hardware-addressable picture slot.
pub struct FrameBuffer {
    index: usize,
    role: SlotRole,
    layout: FrameLayout,
    memory: Arc<DmaBuffer>,
}

impl FrameBuffer {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn role(&self) -> SlotRole {
        self.role
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn phys_addr(&self) -> u64 {
        self.memory.phys_addr()
    }

    /// Device addresses of the planes of this buffer.
    pub fn desc(&self) -> FrameBufferDesc {
        let base = self.memory.phys_addr();
        let offsets = self.layout.plane_offsets;
        FrameBufferDesc {
            index: self.index,
            y_addr: base + offsets[Y_PLANE] as u64,
            cb_addr: base + offsets[U_PLANE] as u64,
            cr_addr: base + offsets[V_PLANE] as u64,
            mv_addr: base + self.layout.mv_offset as u64,
        }
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("index", &self.index)
            .field("role", &self.role)
            .field("phys_addr", &format_args!("{:#x}", self.phys_addr()))
            .finish()
    }
}

struct Slot {
    buffer: FrameBuffer,
    state: FrameBufferState,
    /// A `DisplayBuffer` for this slot is alive.
    leased: bool,
}

struct PoolInner {
    slots: Vec<Slot>,
    registered: bool,
    retired: bool,
}

impl PoolInner {
    fn slot_mut(&mut self, index: usize) -> Result<&mut Slot, PoolError> {
        self.slots
            .get_mut(index)
            .ok_or(PoolError::InvalidIndex(index))
    }

    /// Returns `index` to the engine and to the `Allocated` state.
    fn give_back<E: VpuEngine + ?Sized>(
        &mut self,
        index: usize,
        engine: &mut E,
    ) -> Result<(), PoolError> {
        let registered = self.registered;
        let slot = self.slot_mut(index)?;
        if slot.buffer.role == SlotRole::Decode && registered {
            engine.clear_display_flag(index)?;
        }
        slot.state = FrameBufferState::Allocated;
        Ok(())
    }
}

/// The fixed set of output buffers of a decode session.
///
/// Clones are handles to the same pool.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<Mutex<PoolInner>>,
    request: PoolRequest,
}

impl FramePool {
    /// Allocates the buffers described by `request`.
    ///
    /// For every slot, `provider` is first asked for a consumer-owned buffer of the required size;
    /// if it has none, the memory comes from `allocator`. If any slot cannot be allocated, the
    /// buffers of the previous slots are released and the error is returned.
    pub fn allocate(
        request: PoolRequest,
        allocator: &dyn DmaAllocator,
        mut provider: impl FnMut(usize) -> Option<DmaBuffer>,
    ) -> Result<Self, PoolError> {
        let mut slots = Vec::with_capacity(request.total());

        let decode_slots = std::iter::repeat((SlotRole::Decode, request.decode_layout))
            .take(request.num_decode);
        let rotator_slots = request
            .rotator
            .into_iter()
            .flat_map(|(layout, n)| std::iter::repeat((SlotRole::Rotator, layout)).take(n));

        for (index, (role, layout)) in decode_slots.chain(rotator_slots).enumerate() {
            let size = layout.frame_size;
            let memory = match provider(size) {
                Some(buffer) if buffer.size() >= size => buffer,
                Some(buffer) => {
                    debug!(
                        "consumer buffer of {} bytes too small for slot {} ({} bytes)",
                        buffer.size(),
                        index,
                        size
                    );
                    allocator
                        .allocate(size)
                        .map_err(|source| PoolError::Allocation { index, source })?
                }
                // Slots allocated so far are released when `slots` is dropped.
                None => allocator
                    .allocate(size)
                    .map_err(|source| PoolError::Allocation { index, source })?,
            };

            slots.push(Slot {
                buffer: FrameBuffer {
                    index,
                    role,
                    layout,
                    memory: Arc::new(memory),
                },
                state: FrameBufferState::Allocated,
                leased: false,
            });
        }

        debug!(
            "allocated frame pool: {} decode slots of {} bytes, {} rotator slots",
            request.num_decode,
            request.decode_layout.frame_size,
            request.rotator.map_or(0, |(_, n)| n)
        );

        Ok(Self {
            inner: Arc::new(Mutex::new(PoolInner {
                slots,
                registered: false,
                retired: false,
            })),
            request,
        })
    }

    pub fn request(&self) -> &PoolRequest {
        &self.request
    }

    pub fn len(&self) -> usize {
        self.request.total()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_decode_slots(&self) -> usize {
        self.request.num_decode
    }

    pub fn has_rotator_slots(&self) -> bool {
        self.request.rotator.is_some_and(|(_, n)| n > 0)
    }

    pub fn is_registered(&self) -> bool {
        lock(&self.inner).registered
    }

    /// Device addresses of every slot, in index order.
    pub fn descs(&self) -> Vec<FrameBufferDesc> {
        lock(&self.inner)
            .slots
            .iter()
            .map(|s| s.buffer.desc())
            .collect()
    }

    pub fn role(&self, index: usize) -> Option<SlotRole> {
        lock(&self.inner).slots.get(index).map(|s| s.buffer.role)
    }

    pub fn state(&self, index: usize) -> Option<FrameBufferState> {
        lock(&self.inner).slots.get(index).map(|s| s.state)
    }

    pub fn is_leased(&self, index: usize) -> bool {
        lock(&self.inner).slots.get(index).is_some_and(|s| s.leased)
    }

    pub fn counts(&self) -> StateCounts {
        let inner = lock(&self.inner);
        let mut counts = StateCounts::default();
        for slot in &inner.slots {
            match slot.state {
                FrameBufferState::Allocated => counts.allocated += 1,
                FrameBufferState::Decoded => counts.decoded += 1,
                FrameBufferState::Display => counts.display += 1,
                FrameBufferState::Pending => counts.pending += 1,
                FrameBufferState::Free => counts.free += 1,
            }
        }
        debug_assert_eq!(counts.total(), inner.slots.len());
        counts
    }

    /// Hands the decode slots to the engine. Must happen exactly once per engine instance.
    pub fn register_with_hardware<E: VpuEngine + ?Sized>(
        &self,
        engine: &mut E,
    ) -> Result<(), PoolError> {
        let mut inner = lock(&self.inner);
        if inner.registered {
            return Err(PoolError::AlreadyRegistered);
        }

        let descs = inner
            .slots
            .iter()
            .filter(|s| s.buffer.role == SlotRole::Decode)
            .map(|s| s.buffer.desc())
            .collect::<Vec<_>>();
        engine.register_frame_buffers(&descs, self.request.decode_layout.size.width as usize)?;
        inner.registered = true;
        // Registration gives every decode slot to the engine, which releases the pending ones.
        for slot in inner.slots.iter_mut() {
            if slot.buffer.role == SlotRole::Decode
                && slot.state == FrameBufferState::Pending
                && !slot.leased
            {
                slot.state = FrameBufferState::Allocated;
            }
        }

        debug!("registered {} frame buffers with the engine", descs.len());
        Ok(())
    }

    /// Marks the registration as lost, e.g. because the engine instance was closed. Pictures that
    /// were decoded but not displayed are discarded and displayed ones will wait for their release
    /// as pending. No engine call is made as the instance they were registered with is gone.
    pub fn unregister(&self) {
        let mut inner = lock(&self.inner);
        inner.registered = false;
        for slot in inner.slots.iter_mut() {
            slot.state = match slot.state {
                FrameBufferState::Display | FrameBufferState::Pending => FrameBufferState::Pending,
                FrameBufferState::Free => FrameBufferState::Free,
                _ if slot.leased => FrameBufferState::Pending,
                _ => FrameBufferState::Allocated,
            };
        }
    }

    /// The engine has written a complete picture into `index`.
    pub fn mark_decoded(&self, index: usize) -> Result<(), PoolError> {
        let mut inner = lock(&self.inner);
        let slot = inner.slot_mut(index)?;
        match slot.state {
            FrameBufferState::Allocated => {
                slot.state = FrameBufferState::Decoded;
                trace!("frame buffer {index}: Allocated -> Decoded");
                Ok(())
            }
            // The engine reports the same index again for the second field of a picture.
            FrameBufferState::Decoded => Ok(()),
            from => Err(PoolError::InvalidTransition {
                index,
                from,
                to: FrameBufferState::Decoded,
            }),
        }
    }

    /// Selects `index` for display and leases it to the consumer.
    pub fn mark_displayed(&self, index: usize) -> Result<DisplayBuffer, PoolError> {
        let mut inner = lock(&self.inner);
        let slot = inner.slot_mut(index)?;
        if slot.state != FrameBufferState::Decoded || slot.leased {
            return Err(PoolError::InvalidTransition {
                index,
                from: slot.state,
                to: FrameBufferState::Display,
            });
        }
        slot.state = FrameBufferState::Display;
        slot.leased = true;
        trace!("frame buffer {index}: Decoded -> Display");

        Ok(DisplayBuffer {
            pool: Arc::clone(&self.inner),
            index,
            layout: slot.buffer.layout,
            memory: Arc::clone(&slot.buffer.memory),
        })
    }

    /// The consumer is done with `index`. This is what dropping a [`DisplayBuffer`] does.
    pub fn mark_pending(&self, index: usize) -> Result<(), PoolError> {
        let mut inner = lock(&self.inner);
        let slot = inner.slot_mut(index)?;
        match slot.state {
            FrameBufferState::Display | FrameBufferState::Pending => {
                slot.state = FrameBufferState::Pending;
                Ok(())
            }
            from => Err(PoolError::InvalidTransition {
                index,
                from,
                to: FrameBufferState::Pending,
            }),
        }
    }

    /// Returns `index` to the engine. Fails if the consumer still holds it.
    pub fn release<E: VpuEngine + ?Sized>(
        &self,
        index: usize,
        engine: &mut E,
    ) -> Result<(), PoolError> {
        let mut inner = lock(&self.inner);
        let slot = inner.slot_mut(index)?;
        if slot.leased || slot.state == FrameBufferState::Display {
            return Err(PoolError::InvalidTransition {
                index,
                from: slot.state,
                to: FrameBufferState::Allocated,
            });
        }
        let from = slot.state;
        inner.give_back(index, engine)?;
        trace!("frame buffer {index}: {from:?} -> Allocated");
        Ok(())
    }

    /// Gives every pending slot no longer held by the consumer back to the engine. Returns the
    /// number of released slots.
    pub fn release_pending<E: VpuEngine + ?Sized>(&self, engine: &mut E) -> Result<usize, PoolError> {
        let mut inner = lock(&self.inner);
        let releasable = inner
            .slots
            .iter()
            .filter(|s| {
                !s.leased
                    && matches!(
                        s.state,
                        FrameBufferState::Pending | FrameBufferState::Free
                    )
            })
            .map(|s| s.buffer.index)
            .collect::<Vec<_>>();

        for &index in &releasable {
            inner.give_back(index, engine)?;
        }
        if !releasable.is_empty() {
            trace!("released pending frame buffers {releasable:?}");
        }
        Ok(releasable.len())
    }

    /// Settles the pool after a flush: undisplayed pictures are given back to the engine and
    /// displayed ones become pending.
    pub fn flush_states<E: VpuEngine + ?Sized>(&self, engine: &mut E) -> Result<(), PoolError> {
        let mut inner = lock(&self.inner);
        for index in 0..inner.slots.len() {
            match inner.slots[index].state {
                FrameBufferState::Decoded => inner.give_back(index, engine)?,
                FrameBufferState::Display => inner.slots[index].state = FrameBufferState::Pending,
                _ => (),
            }
        }
        Ok(())
    }

    /// Returns a post-processing slot that can receive the next picture.
    pub fn free_rotator_slot(&self) -> Option<FrameBufferDesc> {
        lock(&self.inner)
            .slots
            .iter()
            .find(|s| {
                s.buffer.role == SlotRole::Rotator
                    && s.state == FrameBufferState::Allocated
                    && !s.leased
            })
            .map(|s| s.buffer.desc())
    }

    /// Detaches the pool from the decoder. Slots still held by the consumer stay alive until
    /// their lease is dropped.
    pub fn retire(&self) {
        let mut inner = lock(&self.inner);
        inner.retired = true;
        inner.registered = false;
        for slot in inner.slots.iter_mut() {
            slot.state = FrameBufferState::Free;
        }
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("len", &self.len())
            .field("counts", &self.counts())
            .finish()
    }
}

/// A frame buffer leased to the consumer.
///
/// The picture stays valid and untouched by the engine until this object is dropped, at which
/// point the slot becomes pending and will be handed back to the engine before its next decode.
pub struct DisplayBuffer {
    pool: Arc<Mutex<PoolInner>>,
    index: usize,
    layout: FrameLayout,
    memory: Arc<DmaBuffer>,
}

impl DisplayBuffer {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn phys_addr(&self) -> u64 {
        self.memory.phys_addr()
    }

    /// Picture bytes, without the motion vector area.
    pub fn as_bytes(&self) -> &[u8] {
        &self.memory.as_slice()[..self.layout.picture_size()]
    }
}

impl fmt::Debug for DisplayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayBuffer")
            .field("index", &self.index)
            .field("phys_addr", &format_args!("{:#x}", self.phys_addr()))
            .finish()
    }
}

impl Drop for DisplayBuffer {
    fn drop(&mut self) {
        let mut inner = lock(&self.pool);
        let retired = inner.retired;
        if let Some(slot) = inner.slots.get_mut(self.index) {
            slot.leased = false;
            if !retired && slot.state == FrameBufferState::Display {
                slot.state = FrameBufferState::Pending;
            }
            trace!("frame buffer {}: released by consumer", self.index);
        }
    }
}
