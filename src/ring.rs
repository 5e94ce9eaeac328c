//! Circular descriptor ring shared by the receive and transmit queues.
//!
//! A ring is a contiguous array of hardware descriptors in DMA memory plus
//! the packet buffers currently parked in its slots. Slots in `[head, tail)`
//! (modulo the ring length) are posted to the hardware. `head` only moves
//! after the hardware signalled completion of the slot, `tail` only after a
//! buffer was posted, and at most `len - 1` slots are ever in flight so that
//! `head == tail` unambiguously means "empty".
//!
//! The per-direction behaviour is the [`HwDescriptor`] implementation of the
//! descriptor type; the ring is monomorphized over it.

use core::ptr;

use crate::events::EventSink;
use crate::hal::IxyHal;
use crate::memory::{Dma, PacketBuffer, PhysAddr};
use crate::{IxyError, IxyResult};

/// Number of descriptors per ring unless configured otherwise.
pub const DEFAULT_RING_ENTRIES: usize = 512;

/// Per-direction behaviour of a hardware descriptor.
pub trait HwDescriptor {
    /// Returns true once the hardware is done with the descriptor.
    fn completed(&self) -> bool;

    /// Hands a buffer at `phys` holding `len` bytes to the hardware.
    ///
    /// Must leave the descriptor reading as not completed.
    fn post(&mut self, phys: PhysAddr, len: usize);
}

/// Returns the ring index following `i` in a ring of `len` entries.
#[inline(always)]
pub(crate) fn wrap_next(i: usize, len: usize) -> usize {
    // len is a power of two
    (i + 1) & (len - 1)
}

/// Returns the number of slots in `[head, tail)` of a ring of `len` entries.
#[inline(always)]
pub(crate) fn distance(head: usize, tail: usize, len: usize) -> usize {
    tail.wrapping_sub(head) & (len - 1)
}

pub(crate) struct DescriptorRing<D> {
    dma: Dma<D>,
    phys: PhysAddr,
    len: usize,
    head: usize,
    tail: usize,
    buffers: Vec<Option<PacketBuffer>>,
}

impl<D: HwDescriptor> DescriptorRing<D> {
    /// Allocates a zeroed ring of `len` descriptors in contiguous DMA memory.
    pub(crate) fn allocate<H: IxyHal>(len: usize, events: &dyn EventSink) -> IxyResult<Self> {
        if len < 2 || !len.is_power_of_two() {
            return Err(IxyError::QueueNotAligned(len));
        }

        let bytes = len * core::mem::size_of::<D>();
        let dma = Dma::<D>::allocate::<H>(bytes, true, events)?;
        let phys = dma.phys_addr().ok_or(IxyError::NotContiguous(bytes))?;
        unsafe { ptr::write_bytes(dma.virt_addr() as *mut u8, 0, bytes) };

        Ok(DescriptorRing {
            dma,
            phys,
            len,
            head: 0,
            tail: 0,
            buffers: (0..len).map(|_| None).collect(),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn phys_addr(&self) -> PhysAddr {
        self.phys
    }

    /// Size of the descriptor array in bytes, as programmed into the NIC.
    pub(crate) fn byte_len(&self) -> usize {
        self.len * core::mem::size_of::<D>()
    }

    pub(crate) fn head(&self) -> usize {
        self.head
    }

    pub(crate) fn tail(&self) -> usize {
        self.tail
    }

    pub(crate) fn set_tail(&mut self, tail: usize) {
        debug_assert!(tail < self.len);
        self.tail = tail;
    }

    pub(crate) fn advance_head(&mut self) {
        self.head = wrap_next(self.head, self.len);
    }

    pub(crate) fn advance_tail(&mut self) {
        self.tail = wrap_next(self.tail, self.len);
    }

    /// Number of slots currently posted to the hardware.
    pub(crate) fn in_flight(&self) -> usize {
        distance(self.head, self.tail, self.len)
    }

    /// Number of slots that can still be posted.
    pub(crate) fn free_slots(&self) -> usize {
        self.len - 1 - self.in_flight()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub(crate) fn is_full(&self) -> bool {
        wrap_next(self.tail, self.len) == self.head
    }

    /// Number of buffers parked in slots, posted or not.
    pub(crate) fn buffers_held(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_some()).count()
    }

    fn descriptor(&self, i: usize) -> &D {
        debug_assert!(i < self.len);
        unsafe { &*self.dma.virt_addr().add(i) }
    }

    fn descriptor_mut(&mut self, i: usize) -> &mut D {
        debug_assert!(i < self.len);
        unsafe { &mut *self.dma.virt_addr().add(i) }
    }

    /// Returns true if the hardware completed the slot at `head`.
    pub(crate) fn head_completed(&self) -> bool {
        self.descriptor(self.head).completed()
    }

    /// Gives `buf` to the hardware in slot `i`, replacing whatever the slot held.
    ///
    /// Returns the buffer previously parked in the slot.
    pub(crate) fn post(&mut self, i: usize, buf: PacketBuffer) -> Option<PacketBuffer> {
        self.descriptor_mut(i).post(buf.get_phys_addr(), buf.len());
        self.buffers[i].replace(buf)
    }

    /// Takes the buffer out of slot `i`.
    pub(crate) fn take(&mut self, i: usize) -> Option<PacketBuffer> {
        self.buffers[i].take()
    }

    /// Raw access to a descriptor for direction specific fields.
    pub(crate) fn with_descriptor<R>(&self, i: usize, f: impl FnOnce(&D) -> R) -> R {
        f(self.descriptor(i))
    }
}
