//! Split virtqueues of the legacy VirtIO PCI transport.
//!
//! One virtqueue is a single physically contiguous block:
//!
//! ```text
//! +-------------------+ 0
//! | descriptor table  |   16 * N bytes
//! +-------------------+
//! | available ring    |   flags, idx, ring[N], used_event
//! +-------------------+
//! | padding           |
//! +-------------------+ align_up(.., 4096)
//! | used ring         |   flags, idx, ring[N] of (id, len), avail_event
//! +-------------------+
//! ```
//!
//! VirtIO 1.0 specification, section 2.4.2 (legacy interfaces).

use core::ptr;
use core::sync::atomic::{fence, Ordering};

use volatile::Volatile;

use crate::events::EventSink;
use crate::hal::IxyHal;
use crate::memory::{Dma, PacketBuffer, PhysAddr};
use crate::{IxyError, IxyResult};

/// The descriptor continues via the `next` field.
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
/// The device writes into the buffer (otherwise it only reads).
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
/// Ask the device not to interrupt when it consumes a buffer.
pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;
/// Alignment of the used ring required by the legacy transport.
pub const QUEUE_ALIGNMENT: usize = 4096;

/// One entry of the descriptor table.
#[repr(C)]
pub struct VirtqDesc {
    /// Guest-physical buffer address.
    pub addr: Volatile<u64>,
    /// Buffer length in bytes.
    pub len: Volatile<u32>,
    /// `VIRTQ_DESC_F_*` flags.
    pub flags: Volatile<u16>,
    /// Next descriptor of a chain if `VIRTQ_DESC_F_NEXT` is set.
    pub next: Volatile<u16>,
}

/// One entry of the used ring.
#[repr(C)]
pub struct VirtqUsedElem {
    /// Head descriptor of the consumed chain.
    pub id: Volatile<u32>,
    /// Number of bytes the device wrote into the chain.
    pub len: Volatile<u32>,
}

/// Byte offsets of the three parts of a virtqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtqLayout {
    /// Number of descriptors.
    pub queue_size: usize,
    /// Offset of the available ring.
    pub avail_offset: usize,
    /// Offset of the used ring, aligned to [`QUEUE_ALIGNMENT`].
    pub used_offset: usize,
    /// Total size of the block.
    pub size: usize,
}

impl VirtqLayout {
    /// Computes the layout for a queue of `queue_size` descriptors.
    pub const fn new(queue_size: usize) -> Self {
        let avail_offset = queue_size * core::mem::size_of::<VirtqDesc>();
        // flags, idx, ring, used_event
        let avail_size = 2 + 2 + 2 * queue_size + 2;
        let used_offset = align_up(avail_offset + avail_size, QUEUE_ALIGNMENT);
        // flags, idx, ring, avail_event
        let used_size = 2 + 2 + core::mem::size_of::<VirtqUsedElem>() * queue_size + 2;
        VirtqLayout {
            queue_size,
            avail_offset,
            used_offset,
            size: used_offset + used_size,
        }
    }

    /// Offset of the `idx` field of the available ring.
    pub const fn avail_idx_offset(&self) -> usize {
        self.avail_offset + 2
    }

    /// Offset of available ring slot `i`.
    pub const fn avail_ring_offset(&self, i: usize) -> usize {
        self.avail_offset + 4 + 2 * i
    }

    /// Offset of the `idx` field of the used ring.
    pub const fn used_idx_offset(&self) -> usize {
        self.used_offset + 2
    }

    /// Offset of used ring slot `i`.
    pub const fn used_ring_offset(&self, i: usize) -> usize {
        self.used_offset + 4 + core::mem::size_of::<VirtqUsedElem>() * i
    }
}

/// Number of bytes of DMA memory a queue of `queue_size` descriptors needs.
pub const fn memory_size(queue_size: usize) -> usize {
    VirtqLayout::new(queue_size).size
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Driver side state of one virtqueue.
pub(crate) struct VirtQueue {
    index: u16,
    size: u16,
    layout: VirtqLayout,
    dma: Dma<u8>,
    phys: PhysAddr,
    free: Vec<u16>,
    buffers: Vec<Option<PacketBuffer>>,
    avail_idx: u16,
    last_used: u16,
}

impl VirtQueue {
    /// Allocates and zeroes the memory of queue `index` with `size` descriptors.
    pub(crate) fn allocate<H: IxyHal>(
        index: u16,
        size: u16,
        events: &dyn EventSink,
    ) -> IxyResult<Self> {
        if !size.is_power_of_two() {
            return Err(IxyError::QueueNotAligned(size as usize));
        }
        let layout = VirtqLayout::new(size as usize);
        let dma = Dma::<u8>::allocate::<H>(layout.size, true, events)?;
        let phys = dma.phys_addr().ok_or(IxyError::NotContiguous(layout.size))?;
        unsafe { ptr::write_bytes(dma.virt_addr(), 0, layout.size) };

        let queue = VirtQueue {
            index,
            size,
            layout,
            dma,
            phys,
            // popped from the back, hand out descriptor 0 first
            free: (0..size).rev().collect(),
            buffers: (0..size).map(|_| None).collect(),
            avail_idx: 0,
            last_used: 0,
        };
        // we poll, the device must not bother with interrupts
        unsafe { queue.write_u16(queue.layout.avail_offset, VRING_AVAIL_F_NO_INTERRUPT) };
        Ok(queue)
    }

    pub(crate) fn index(&self) -> u16 {
        self.index
    }

    pub(crate) fn size(&self) -> u16 {
        self.size
    }

    pub(crate) fn phys_addr(&self) -> PhysAddr {
        self.phys
    }

    pub(crate) fn free_descriptors(&self) -> usize {
        self.free.len()
    }

    /// Number of chains handed to the device and not yet reclaimed.
    pub(crate) fn buffers_held(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_some()).count()
    }

    unsafe fn read_u16(&self, offset: usize) -> u16 {
        ptr::read_volatile(self.dma.virt_addr().add(offset) as *const u16)
    }

    unsafe fn write_u16(&self, offset: usize, value: u16) {
        ptr::write_volatile(self.dma.virt_addr().add(offset) as *mut u16, value)
    }

    fn desc_mut(&mut self, i: u16) -> &mut VirtqDesc {
        debug_assert!(i < self.size);
        unsafe { &mut *(self.dma.virt_addr() as *mut VirtqDesc).add(i as usize) }
    }

    fn desc(&self, i: u16) -> &VirtqDesc {
        debug_assert!(i < self.size);
        unsafe { &*(self.dma.virt_addr() as *const VirtqDesc).add(i as usize) }
    }

    /// Writes `buf` into a descriptor chain with one descriptor per segment.
    ///
    /// Segments are `(physical address, length, flags)`; `VIRTQ_DESC_F_NEXT`
    /// is added where needed. The buffer is parked at the head descriptor.
    /// Gives the buffer back if not enough descriptors are free.
    pub(crate) fn post(
        &mut self,
        buf: PacketBuffer,
        segments: &[(PhysAddr, u32, u16)],
    ) -> Result<u16, PacketBuffer> {
        if segments.is_empty() || segments.len() > self.free.len() {
            return Err(buf);
        }

        let ids: Vec<u16> = (0..segments.len()).filter_map(|_| self.free.pop()).collect();
        for (n, &(addr, len, flags)) in segments.iter().enumerate() {
            let next = ids.get(n + 1).copied();
            let desc = self.desc_mut(ids[n]);
            desc.addr.write(addr as u64);
            desc.len.write(len);
            match next {
                Some(next) => {
                    desc.flags.write(flags | VIRTQ_DESC_F_NEXT);
                    desc.next.write(next);
                }
                None => {
                    desc.flags.write(flags & !VIRTQ_DESC_F_NEXT);
                    desc.next.write(0);
                }
            }
        }

        let head = ids[0];
        self.buffers[head as usize] = Some(buf);
        Ok(head)
    }

    /// Makes the chain starting at `head` visible to the device.
    pub(crate) fn push_avail(&mut self, head: u16) {
        let slot = (self.avail_idx % self.size) as usize;
        unsafe { self.write_u16(self.layout.avail_ring_offset(slot), head) };
        self.avail_idx = self.avail_idx.wrapping_add(1);
        // the ring entry must be visible before the index
        fence(Ordering::SeqCst);
        unsafe { self.write_u16(self.layout.avail_idx_offset(), self.avail_idx) };
    }

    /// Index the device will write its next used element to.
    pub(crate) fn used_idx(&self) -> u16 {
        unsafe { self.read_u16(self.layout.used_idx_offset()) }
    }

    /// Returns true if the device consumed a chain we have not seen yet.
    pub(crate) fn has_used(&self) -> bool {
        self.used_idx() != self.last_used
    }

    /// Returns the next consumed chain as `(head, bytes written)`.
    pub(crate) fn pop_used(&mut self) -> Option<(u16, u32)> {
        if !self.has_used() {
            return None;
        }
        fence(Ordering::SeqCst);
        let slot = (self.last_used % self.size) as usize;
        let elem = unsafe {
            &*(self.dma.virt_addr().add(self.layout.used_ring_offset(slot)) as *const VirtqUsedElem)
        };
        let (id, len) = (elem.id.read(), elem.len.read());
        self.last_used = self.last_used.wrapping_add(1);
        Some((id as u16, len))
    }

    /// Frees the chain starting at `head` and returns the buffer parked there.
    pub(crate) fn reclaim(&mut self, head: u16) -> Option<PacketBuffer> {
        if head >= self.size {
            return None;
        }
        let buf = self.buffers[head as usize].take()?;
        let mut id = head;
        loop {
            self.free.push(id);
            let desc = self.desc(id);
            if desc.flags.read() & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            id = desc.next.read();
        }
        Some(buf)
    }
}
