//! Fixed-capacity single-producer/single-consumer ring of byte slots.
//!
//! The ring is split over two regions so the cursors can be provisioned
//! independently of the slots:
//!
//! ```text
//! control (8 bytes)             data (capacity * slot_size bytes)
//! ┌────────────┬─────────────┐  ┌────────┬────────┬─────┬────────┐
//! │ read (u32) │ write (u32) │  │ slot 0 │ slot 1 │ ... │ slot N │
//! └────────────┴─────────────┘  └────────┴────────┴─────┴────────┘
//! ```
//!
//! Cursors only ever grow (wrapping at `u32::MAX`) and select their slot with
//! `cursor & (capacity - 1)`. `write - read` is the number of filled slots.
//! Each side owns one cursor: it loads its own with `Relaxed`, the peer's with
//! `Acquire`, and publishes with a `Release` store after touching the slot.

use std::mem;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{info, trace, warn};

use crate::core::{
    control_context, data_context, HeapRegion, Region, ShmemConfig, ShmemRegion, CONTROL_SIZE,
    MAX_CAPACITY, MIN_SLOT_SIZE,
};
use crate::errors::QueueError;

#[repr(C)]
struct ControlBlock {
    read: AtomicU32,
    write: AtomicU32,
}

const _: () = assert!(mem::size_of::<ControlBlock>() == CONTROL_SIZE);

/// Snapshots taken before declaring a control region corrupt. A live peer can
/// move its cursor between our two loads.
const CONTROL_CHECKS: usize = 3;

/// Ordering for a side loading the cursor it owns.
const OWN_CURSOR: Ordering = Ordering::Relaxed;
/// Ordering for loading the peer's cursor, pairing with [`PUBLISH`].
const PEER_CURSOR: Ordering = Ordering::Acquire;
/// Ordering for storing an advanced cursor after touching the slot.
const PUBLISH: Ordering = Ordering::Release;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingStatus {
    pub read_cursor: u32,
    pub write_cursor: u32,
    pub capacity: u32,
}

impl RingStatus {
    /// Number of filled slots.
    pub fn len(&self) -> u32 {
        self.write_cursor.wrapping_sub(self.read_cursor)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    fn is_consistent(&self) -> bool {
        self.len() <= self.capacity
    }
}

pub struct SlotRing<R: Region = ShmemRegion> {
    control: R,
    data: R,
    capacity: u32,
    mask: u32,
    slot_size: usize,
}

impl SlotRing<ShmemRegion> {
    /// Maps the regions named by `cfg`, creating them if this is the first
    /// process to get there.
    pub fn open(cfg: &ShmemConfig) -> Result<SlotRing<ShmemRegion>, QueueError> {
        let data = data_context(cfg)?;
        let control = control_context(cfg)?;
        let fresh = control.created();
        SlotRing::from_regions(control, data, cfg.capacity, cfg.slot_size, fresh)
    }

    /// Unlinks both regions once this handle drops.
    pub fn unlink_on_drop(&mut self) {
        self.control.unlink_on_drop();
        self.data.unlink_on_drop();
    }
}

impl SlotRing<HeapRegion> {
    /// A process-private ring.
    pub fn in_memory(capacity: u32, slot_size: usize) -> Result<SlotRing<HeapRegion>, QueueError> {
        let data_len = (capacity as usize)
            .checked_mul(slot_size)
            .ok_or_else(|| QueueError::Config(format!("{} x {} bytes overflows", capacity, slot_size)))?;
        let control = HeapRegion::zeroed(CONTROL_SIZE)?;
        let data = HeapRegion::zeroed(data_len)?;
        SlotRing::from_regions(control, data, capacity, slot_size, true)
    }
}

impl<R: Region> SlotRing<R> {
    /// Lays a ring over existing regions.
    ///
    /// The cursors are never written here. A freshly created region is
    /// zero-filled by the OS, and a peer may already have mapped it and moved
    /// its cursor by the time its creator gets here. `fresh` only changes
    /// what is logged; the cursors found are always checked against
    /// `capacity`.
    pub fn from_regions(
        control: R,
        data: R,
        capacity: u32,
        slot_size: usize,
        fresh: bool,
    ) -> Result<SlotRing<R>, QueueError> {
        if capacity == 0 || !capacity.is_power_of_two() || capacity > MAX_CAPACITY {
            return Err(QueueError::Config(format!("capacity {} is not a power of two", capacity)));
        }
        if slot_size < MIN_SLOT_SIZE {
            return Err(QueueError::Config(format!("slot_size {} is too small", slot_size)));
        }
        if control.len() < CONTROL_SIZE || control.as_ptr() as usize % mem::align_of::<ControlBlock>() != 0 {
            return Err(QueueError::Config(format!(
                "control region of {} bytes cannot hold the cursors",
                control.len()
            )));
        }
        let data_len = (capacity as usize).checked_mul(slot_size).unwrap_or(usize::MAX);
        if data.len() < data_len {
            return Err(QueueError::Config(format!(
                "data region of {} bytes cannot hold {} slots of {} bytes",
                data.len(),
                capacity,
                slot_size
            )));
        }

        let ring = SlotRing {
            control,
            data,
            capacity,
            mask: capacity - 1,
            slot_size,
        };

        ring.check_control()?;
        if fresh {
            info!(capacity, slot_size, status = ?ring.status(), "created ring");
        }
        Ok(ring)
    }

    fn check_control(&self) -> Result<(), QueueError> {
        let mut status = self.status();
        for _ in 1..CONTROL_CHECKS {
            if status.is_consistent() {
                break;
            }
            status = self.status();
        }
        if !status.is_consistent() {
            warn!(?status, "control region violates the occupancy invariant");
            return Err(QueueError::CorruptControl {
                read: status.read_cursor,
                write: status.write_cursor,
                capacity: self.capacity,
            });
        }
        trace!(?status, "attached to existing ring");
        Ok(())
    }

    #[inline]
    fn control(&self) -> &ControlBlock {
        // SAFETY: from_regions checked size and alignment; the region outlives
        // the borrow and the block is only mutated through atomics.
        unsafe { &*(self.control.as_ptr() as *const ControlBlock) }
    }

    #[inline]
    fn slot_ptr(&self, cursor: u32) -> *mut u8 {
        let offset = (cursor & self.mask) as usize * self.slot_size;
        // SAFETY: offset + slot_size <= capacity * slot_size <= data.len()
        unsafe { self.data.as_ptr().add(offset) }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn status(&self) -> RingStatus {
        let ctl = self.control();
        RingStatus {
            read_cursor: ctl.read.load(Ordering::Acquire),
            write_cursor: ctl.write.load(Ordering::Acquire),
            capacity: self.capacity,
        }
    }

    /// Copies `bytes` into the next free slot. Producer side only.
    ///
    /// The slot is zero-filled first so nothing of its previous content
    /// survives past `bytes.len()`. Rejects without touching the ring when the
    /// payload is larger than a slot or every slot is taken.
    pub fn enqueue(&mut self, bytes: &[u8]) -> Result<(), QueueError> {
        if bytes.len() > self.slot_size {
            return Err(QueueError::TooLarge {
                len: bytes.len(),
                slot_size: self.slot_size,
            });
        }
        let ctl = self.control();
        let write = ctl.write.load(OWN_CURSOR);
        let read = ctl.read.load(PEER_CURSOR);
        if write.wrapping_sub(read) >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }

        let slot = self.slot_ptr(write);
        // SAFETY: the consumer does not read this slot until the store below
        // publishes it, and bytes.len() <= slot_size.
        unsafe {
            ptr::write_bytes(slot, 0, self.slot_size);
            ptr::copy_nonoverlapping(bytes.as_ptr(), slot, bytes.len());
        }
        ctl.write.store(write.wrapping_add(1), PUBLISH);
        trace!(read, write = write.wrapping_add(1), len = bytes.len(), "enqueued");
        Ok(())
    }

    /// Hands the oldest filled slot to `f`, then frees it. Consumer side only.
    ///
    /// `f` always sees the full slot; the read cursor advances whatever `f`
    /// concludes about the bytes.
    pub fn dequeue_with<T, F>(&mut self, f: F) -> Option<T>
    where
        F: FnOnce(&[u8]) -> T,
    {
        let ctl = self.control();
        let read = ctl.read.load(OWN_CURSOR);
        let write = ctl.write.load(PEER_CURSOR);
        if read == write {
            return None;
        }

        // SAFETY: the producer does not reuse this slot until the store below
        // releases it.
        let slot = unsafe { slice::from_raw_parts(self.slot_ptr(read), self.slot_size) };
        let out = f(slot);
        ctl.read.store(read.wrapping_add(1), PUBLISH);
        trace!(read = read.wrapping_add(1), write, "dequeued");
        Some(out)
    }

    /// Copying variant of [`SlotRing::dequeue_with`].
    pub fn dequeue(&mut self) -> Option<Vec<u8>> {
        self.dequeue_with(<[u8]>::to_vec)
    }
}
