//! DMA memory management.
//!
//! This module provides hugepage allocation and packet buffer pools:
//!
//! - [`Dma`]: a hugepage-backed region with its physical address
//! - [`virt_to_phys`]: page-table based virtual to physical translation
//! - [`MemPool`]: a fixed-size pool of equally sized packet buffers
//! - [`PacketBuffer`]: one buffer out of a pool, owned by whoever holds it
//! - [`alloc_pkt`]: convenience function for allocating packets from a pool
//!
//! # Buffer ownership
//!
//! A buffer is always in exactly one place: on the pool's free stack, in a
//! descriptor ring slot, or in the caller's hands as a [`PacketBuffer`].
//! Handing a `PacketBuffer` to a queue moves it into the ring; receiving
//! moves it out again; dropping (or [`PacketBuffer::release`]) returns it to
//! the free stack. A handle given to the hardware can therefore not be used
//! by the caller at the same time.
//!
//! # Example
//!
//! ```rust,ignore
//! use ixy_driver::memory::{alloc_pkt, MemPool};
//!
//! // Create a pool with 4096 entries, each 2048 bytes
//! let pool = MemPool::allocate::<MyHal>(4096, 2048, &LogSink)?;
//!
//! // Allocate a packet from the pool
//! let packet = alloc_pkt(&pool, 1500).ok_or(IxyError::NoMemory)?;
//! ```

use core::cell::RefCell;
use core::fmt::{self, Debug};
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::slice;
use std::rc::Rc;

use bit_field::BitField;

use crate::events::{Event, EventSink};
use crate::hal::IxyHal;
use crate::{IxyError, IxyResult};

/// Physical address in system memory.
///
/// This type represents a physical memory address that can be accessed by hardware devices
/// via DMA.
pub type PhysAddr = usize;
/// Virtual address in system memory.
///
/// This type represents a virtual memory address that is used by the CPU/Driver to access memory.
pub type VirtAddr = usize;

/// log2 of [`HUGE_PAGE_SIZE`].
pub const HUGE_PAGE_BITS: u32 = 21;
/// Size of one hugepage (2 MiB).
pub const HUGE_PAGE_SIZE: usize = 1 << HUGE_PAGE_BITS;

/// Granularity of the process page table.
pub const PAGE_SIZE: usize = 4096;

// packet metadata lives outside of the buffer, so the headroom only has to
// fit headers prepended by the driver (e.g. the virtio net header)
/// Headroom reserved at the start of each packet buffer.
///
/// This space can be used to prepend headers (e.g., VLAN, Ethernet, IP) without
/// needing to reallocate or copy the packet data.
pub const PACKET_HEADROOM: usize = 32;

const PAGEMAP_PRESENT_BIT: usize = 63;
const PAGEMAP_PFN_BITS: core::ops::Range<usize> = 0..55;

/// Extracts the physical address of `virt` from its raw pagemap entry.
///
/// Returns `None` if the page is not present or the frame number is hidden
/// (the kernel reports 0 to processes without `CAP_SYS_ADMIN`).
pub fn decode_pagemap_entry(entry: u64, virt: VirtAddr) -> Option<PhysAddr> {
    if !entry.get_bit(PAGEMAP_PRESENT_BIT) {
        return None;
    }
    let pfn = entry.get_bits(PAGEMAP_PFN_BITS) as usize;
    if pfn == 0 {
        return None;
    }
    Some(pfn * PAGE_SIZE + virt % PAGE_SIZE)
}

/// Translates a virtual address of this process to a physical address.
///
/// # Errors
///
/// Returns [`IxyError::AddressTranslation`] if the page is not mapped to a
/// physical frame.
pub fn virt_to_phys<H: IxyHal>(virt: VirtAddr) -> IxyResult<PhysAddr> {
    let entry = H::pagemap_entry(virt / PAGE_SIZE)?;
    decode_pagemap_entry(entry, virt).ok_or(IxyError::AddressTranslation(virt))
}

/// DMA-allocated memory block.
///
/// Represents a block of hugepage memory mapped for DMA operations. The
/// mapping is released when the block is dropped.
pub struct Dma<T> {
    virt: NonNull<T>,
    phys: Option<PhysAddr>,
    size: usize,
    release: unsafe fn(NonNull<u8>, usize),
    _marker: PhantomData<T>,
}

impl<T> Dma<T> {
    /// Allocates a new DMA memory block of at least `size` bytes.
    ///
    /// The size is rounded up to whole hugepages.
    ///
    /// With `require_contiguous` the region has to be one physically
    /// contiguous block, which is what descriptor rings need: the allocation
    /// fails if it would exceed one hugepage or if the backing frames are not
    /// physically adjacent. Without it the region may span several
    /// independently placed hugepages and [`Dma::phys_addr`] is `None`;
    /// callers resolve addresses inside the region with [`virt_to_phys`].
    ///
    /// # Errors
    ///
    /// - [`IxyError::NotContiguous`] - contiguous memory of this size is unavailable
    /// - [`IxyError::AddressTranslation`] - the physical address cannot be resolved
    /// - any error of [`IxyHal::map_hugepages`]
    pub fn allocate<H: IxyHal>(
        size: usize,
        require_contiguous: bool,
        events: &dyn EventSink,
    ) -> IxyResult<Dma<T>> {
        if require_contiguous && size > HUGE_PAGE_SIZE {
            return Err(IxyError::NotContiguous(size));
        }

        let mapped = match size % HUGE_PAGE_SIZE {
            0 if size > 0 => size,
            _ => ((size >> HUGE_PAGE_BITS) + 1) << HUGE_PAGE_BITS,
        };
        let virt = H::map_hugepages(mapped)?;

        let mut dma = Dma::<T> {
            virt: virt.cast(),
            phys: None,
            size: mapped,
            release: H::unmap_hugepages,
            _marker: PhantomData,
        };

        if require_contiguous {
            let base = virt.as_ptr() as VirtAddr;
            let phys = virt_to_phys::<H>(base)?;
            // every page backing the requested range has to sit at the same
            // offset from the base frame
            for offset in (PAGE_SIZE..size.max(1)).step_by(PAGE_SIZE) {
                if virt_to_phys::<H>(base + offset)? != phys + offset {
                    return Err(IxyError::NotContiguous(size));
                }
            }
            dma.phys = Some(phys);
        }

        events.record(&Event::DmaAllocated {
            virt: virt.as_ptr() as usize,
            phys: dma.phys,
            size: mapped,
        });

        Ok(dma)
    }

    /// Returns the virtual base address.
    pub fn virt_addr(&self) -> *mut T {
        self.virt.as_ptr()
    }

    /// Returns the physical base address of a contiguous block.
    pub fn phys_addr(&self) -> Option<PhysAddr> {
        self.phys
    }

    /// Returns the mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the number of hugepages backing this block.
    pub fn pages(&self) -> usize {
        self.size >> HUGE_PAGE_BITS
    }
}

impl<T> Drop for Dma<T> {
    fn drop(&mut self) {
        unsafe { (self.release)(self.virt.cast(), self.size) }
    }
}

/// A memory pool for DMA-capable packet buffers.
///
/// The memory pool pre-allocates a fixed number of equally-sized buffers from
/// hugepage memory. This design ensures that:
///
/// - All buffers are accessible by the NIC and never straddle a hugepage
/// - Allocation is fast (O(1) simple stack pop)
/// - Memory fragmentation is avoided
///
/// # Thread Safety
///
/// The free stack is a plain `RefCell` and pools are handed out as `Rc`, so a
/// pool and all of its buffers stay on the thread that created them.
///
/// # Example
///
/// ```rust,ignore
/// use ixy_driver::memory::MemPool;
///
/// // Create a pool with 4096 entries of 2048 bytes each
/// let pool = MemPool::allocate::<MyHal>(4096, 2048, &NullSink)?;
///
/// // Get the entry size
/// assert_eq!(pool.entry_size(), 2048);
/// ```
pub struct MemPool {
    base_addr: NonNull<u8>,
    num_entries: usize,
    entry_size: usize,
    phys_addr: Vec<PhysAddr>,
    pub(crate) free_stack: RefCell<Vec<usize>>,
    _dma: Dma<u8>,
}

impl MemPool {
    /// Allocates a new memory pool.
    ///
    /// Creates a memory pool with the specified number of entries, each of the
    /// given size. The entry size must divide the huge page size (2MB) evenly.
    ///
    /// # Arguments
    ///
    /// * `entries` - Number of buffer entries in the pool
    /// * `size` - Size of each entry in bytes (0 defaults to 2048)
    /// * `events` - Receiver of the allocation events
    ///
    /// # Errors
    ///
    /// - [`IxyError::PageNotAligned`] - If `size` is not a divisor of the page size
    ///   or leaves no room after the headroom
    /// - [`IxyError::NoMemory`] - If `entries` is zero
    /// - any error of [`Dma::allocate`] or [`virt_to_phys`]
    pub fn allocate<H: IxyHal>(
        entries: usize,
        size: usize,
        events: &dyn EventSink,
    ) -> IxyResult<Rc<MemPool>> {
        let entry_size = match size {
            0 => 2048,
            x => x,
        };

        if HUGE_PAGE_SIZE % entry_size != 0 || entry_size <= PACKET_HEADROOM {
            return Err(IxyError::PageNotAligned(entry_size));
        }
        if entries == 0 {
            return Err(IxyError::NoMemory);
        }

        let dma = Dma::<u8>::allocate::<H>(entries * entry_size, false, events)?;
        let base = dma.virt_addr() as VirtAddr;

        // hugepages are not necessarily adjacent, resolve every entry
        let phys_addr = (0..entries)
            .map(|i| virt_to_phys::<H>(base + i * entry_size))
            .collect::<IxyResult<Vec<_>>>()?;

        let pool = MemPool {
            base_addr: dma.virt,
            num_entries: entries,
            entry_size,
            phys_addr,
            free_stack: RefCell::new((0..entries).collect()),
            _dma: dma,
        };

        events.record(&Event::MemPoolCreated {
            entries,
            entry_size,
        });

        Ok(Rc::new(pool))
    }

    /// Returns the position of a free buffer in the memory pool, or [`None`] if the pool is empty.
    pub(crate) fn alloc_buf(&self) -> Option<usize> {
        self.free_stack.borrow_mut().pop()
    }

    /// Marks a buffer in the memory pool as free.
    pub(crate) fn free_buf(&self, id: usize) {
        assert!(
            id < self.num_entries,
            "buffer outside of memory pool, id: {id}"
        );

        let mut free_stack = self.free_stack.borrow_mut();
        debug_assert!(!free_stack.contains(&id), "free buf: buffer already free");

        free_stack.push(id);
    }

    /// Takes a free buffer out of the pool, sized to its full capacity.
    ///
    /// Returns [`None`] when the pool is exhausted.
    pub fn alloc(self: &Rc<Self>) -> Option<PacketBuffer> {
        alloc_pkt(self, self.buffer_capacity())
    }

    /// Returns the size (in bytes) of each entry in the pool.
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Returns the number of packet bytes a buffer can hold after the headroom.
    pub fn buffer_capacity(&self) -> usize {
        self.entry_size - PACKET_HEADROOM
    }

    /// Returns the total number of buffers in the pool.
    pub fn capacity(&self) -> usize {
        self.num_entries
    }

    /// Returns the number of buffers currently on the free stack.
    pub fn free_count(&self) -> usize {
        self.free_stack.borrow().len()
    }

    /// Returns the virtual address of a buffer from the memory pool.
    pub(crate) fn get_virt_addr(&self, id: usize) -> *mut u8 {
        assert!(
            id < self.num_entries,
            "buffer outside of memory pool, id: {id}"
        );

        unsafe { self.base_addr.as_ptr().add(id * self.entry_size) }
    }

    /// Returns the physical address of a buffer from the memory pool.
    ///
    /// This address can be passed to the NIC hardware for DMA operations.
    pub fn get_phys_addr(&self, id: usize) -> PhysAddr {
        self.phys_addr[id]
    }
}

impl Debug for MemPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemPool")
            .field("base_addr", &self.base_addr)
            .field("num_entries", &self.num_entries)
            .field("entry_size", &self.entry_size)
            .field("free", &self.free_count())
            .finish()
    }
}

/// A packet buffer owned by the caller.
///
/// `PacketBuffer` represents a buffer that was allocated from a [`MemPool`].
/// When the buffer is dropped, it is returned to the pool for reuse.
///
/// # Data Access
///
/// The buffer implements `Deref` and `DerefMut` to `[u8]`, covering the
/// current packet length.
///
/// # Example
///
/// ```rust,ignore
/// use ixy_driver::memory::alloc_pkt;
///
/// let mut packet = alloc_pkt(&pool, 60).ok_or(IxyError::NoMemory)?;
///
/// // Modify data
/// packet[..6].copy_from_slice(&[0xff; 6]);
///
/// // Get addresses for DMA
/// let phys_addr = packet.get_phys_addr();
/// let virt_addr = packet.get_virt_addr();
/// ```
pub struct PacketBuffer {
    pub(crate) addr_virt: NonNull<u8>,
    pub(crate) addr_phys: PhysAddr,
    pub(crate) len: usize,
    pub(crate) pool: Rc<MemPool>,
    pub(crate) pool_entry: usize,
}

impl Deref for PacketBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.addr_virt.as_ptr(), self.len) }
    }
}

impl DerefMut for PacketBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.addr_virt.as_ptr(), self.len) }
    }
}

impl Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("id", &self.pool_entry)
            .field("phys", &format_args!("{:#x}", self.addr_phys))
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        self.pool.free_buf(self.pool_entry);
    }
}

impl PacketBuffer {
    /// Creates a new packet buffer from raw components.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - `addr_virt` points to valid memory
    /// - `addr_phys` is the correct physical address for `addr_virt`
    /// - The memory was allocated from `pool` at entry `pool_entry`
    /// - `len` does not exceed the allocated buffer size
    pub(crate) unsafe fn new(
        addr_virt: *mut u8,
        addr_phys: PhysAddr,
        len: usize,
        pool: Rc<MemPool>,
        pool_entry: usize,
    ) -> PacketBuffer {
        PacketBuffer {
            addr_virt: NonNull::new_unchecked(addr_virt),
            addr_phys,
            len,
            pool,
            pool_entry,
        }
    }

    /// Returns the index of this buffer inside its pool.
    pub fn id(&self) -> usize {
        self.pool_entry
    }

    /// Returns the pool this buffer belongs to.
    pub fn pool(&self) -> &Rc<MemPool> {
        &self.pool
    }

    /// Returns the virtual address of the packet data.
    pub fn get_virt_addr(&self) -> *mut u8 {
        self.addr_virt.as_ptr()
    }

    /// Returns the physical address of the packet data.
    ///
    /// This address is used by the NIC hardware for DMA operations.
    pub fn get_phys_addr(&self) -> PhysAddr {
        self.addr_phys
    }

    /// Returns the number of bytes the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.pool.buffer_capacity()
    }

    /// Sets the packet length.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`PacketBuffer::capacity`].
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity(), "packet length {len} exceeds buffer");
        self.len = len;
    }

    /// Returns the packet data as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        self
    }

    /// Returns the packet data as a mutable byte slice.
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        self
    }

    /// Returns a mutable slice to the headroom of the packet.
    ///
    /// The `len` parameter controls how much of the headroom is returned.
    ///
    /// # Panics
    ///
    /// Panics if `len` is greater than [`PACKET_HEADROOM`]
    pub fn headroom_mut(&mut self, len: usize) -> &mut [u8] {
        assert!(len <= PACKET_HEADROOM);
        unsafe { slice::from_raw_parts_mut(self.addr_virt.as_ptr().sub(len), len) }
    }

    /// Copies this packet into a fresh buffer from the same pool.
    ///
    /// Returns [`None`] if the pool is exhausted.
    pub fn try_clone(&self) -> Option<PacketBuffer> {
        let mut p = alloc_pkt(&self.pool, self.len)?;
        p.copy_from_slice(self);
        Some(p)
    }

    /// Returns the buffer to its pool.
    ///
    /// Equivalent to dropping it, spelled out for call sites where the
    /// ownership transfer should be visible.
    pub fn release(self) {
        drop(self)
    }

    #[cfg(target_arch = "x86_64")]
    #[inline(always)]
    pub(crate) fn prefetch(&self, hint: Prefetch) {
        if std::is_x86_feature_detected!("sse") {
            let addr = self.get_virt_addr() as *const i8;
            unsafe {
                use core::arch::x86_64;
                match hint {
                    Prefetch::Time0 => x86_64::_mm_prefetch(addr, x86_64::_MM_HINT_T0),
                    Prefetch::Time1 => x86_64::_mm_prefetch(addr, x86_64::_MM_HINT_T1),
                    Prefetch::Time2 => x86_64::_mm_prefetch(addr, x86_64::_MM_HINT_T2),
                    Prefetch::NonTemporal => x86_64::_mm_prefetch(addr, x86_64::_MM_HINT_NTA),
                }
            }
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    #[inline(always)]
    pub(crate) fn prefetch(&self, _hint: Prefetch) {}
}

/// Allocates a packet from the memory pool.
///
/// Attempts to allocate a packet buffer of the specified size from the pool.
/// The allocation will fail if:
///
/// - The pool is exhausted (no free buffers)
/// - The requested size exceeds the available space after reserving headroom
///
/// # Arguments
///
/// * `pool` - The memory pool to allocate from
/// * `size` - Desired packet data size in bytes
///
/// # Returns
///
/// `Some(PacketBuffer)` if allocation succeeded, `None` otherwise.
pub fn alloc_pkt(pool: &Rc<MemPool>, size: usize) -> Option<PacketBuffer> {
    if size > pool.buffer_capacity() {
        return None;
    }

    pool.alloc_buf().map(|id| unsafe {
        PacketBuffer::new(
            pool.get_virt_addr(id).add(PACKET_HEADROOM),
            pool.get_phys_addr(id) + PACKET_HEADROOM,
            size,
            Rc::clone(pool),
            id,
        )
    })
}

/// CPU cache prefetch hints for x86_64 SSE instructions.
///
/// These hints control how data is prefetched into the CPU cache hierarchy.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Prefetch {
    /// Corresponds to _MM_HINT_T0 on x86 sse.
    ///
    /// Fetch data into all cache levels.
    Time0,

    /// Corresponds to _MM_HINT_T1 on x86 sse.
    Time1,

    /// Corresponds to _MM_HINT_T2 on x86 sse.
    Time2,

    /// Corresponds to _MM_HINT_NTA on x86 sse.
    ///
    /// Non-temporal fetch - data is not expected to be reused.
    NonTemporal,
}
