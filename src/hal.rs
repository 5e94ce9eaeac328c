//! Hardware abstraction layer.
//!
//! The driver core never opens files, walks sysfs or calls `mmap` itself.
//! Everything platform specific goes through two seams:
//!
//! - [`IxyHal`]: hugepage mapping, page-table lookups and sleeping. Like the
//!   rest of the driver it is used through static functions, so a HAL is a
//!   zero-sized type selected at compile time.
//! - [`ResourceIo`]: fixed-width reads and writes at byte offsets of an open
//!   PCI resource (configuration space or BAR0).
//!
//! [`crate::linux`] provides implementations of both for Linux.

use core::ptr::NonNull;
use core::time::Duration;
use std::rc::Rc;

use crate::{IxyError, IxyResult};

/// Offset of the vendor id in PCI configuration space.
pub const PCI_VENDOR_ID: u32 = 0x00;
/// Offset of the command register in PCI configuration space.
pub const PCI_COMMAND: u32 = 0x04;
/// Bus master enable bit of the command register.
pub const PCI_COMMAND_MASTER: u16 = 1 << 2;

/// Platform services needed to allocate and resolve DMA memory.
///
/// # Safety
///
/// Implementations must hand out memory that stays pinned at the physical
/// frames reported by [`IxyHal::pagemap_entry`] for as long as it is mapped.
/// The NIC writes into that memory behind the CPU's back.
pub unsafe trait IxyHal {
    /// Maps `size` bytes of hugepage-backed memory and returns its virtual base.
    ///
    /// `size` is always a multiple of [`crate::memory::HUGE_PAGE_SIZE`] and the
    /// returned address must be aligned to it.
    fn map_hugepages(size: usize) -> IxyResult<NonNull<u8>>;

    /// Releases a mapping previously returned by [`IxyHal::map_hugepages`].
    ///
    /// # Safety
    ///
    /// `vaddr` and `size` must describe exactly one earlier mapping and no
    /// device may still be using it.
    unsafe fn unmap_hugepages(vaddr: NonNull<u8>, size: usize);

    /// Returns the raw 64-bit page-table entry for the virtual page
    /// `page_index` (virtual address divided by [`crate::memory::PAGE_SIZE`]),
    /// in the format of `/proc/self/pagemap`.
    fn pagemap_entry(page_index: usize) -> IxyResult<u64>;

    /// Blocks the calling thread for `duration`.
    fn wait(duration: Duration);
}

/// Access width of a register or config space read/write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// 8-bit access.
    U8,
    /// 16-bit access.
    U16,
    /// 32-bit access.
    U32,
}

impl Width {
    /// Number of bytes covered by an access of this width.
    pub const fn bytes(self) -> usize {
        match self {
            Width::U8 => 1,
            Width::U16 => 2,
            Width::U32 => 4,
        }
    }
}

/// Byte-addressable access to an open PCI resource.
///
/// Values narrower than 32 bits are carried in the low bits of the `u32`.
pub trait ResourceIo {
    /// Reads `width` bytes at `offset`.
    fn read_at(&self, offset: u32, width: Width) -> IxyResult<u32>;

    /// Writes the low `width` bytes of `value` at `offset`.
    fn write_at(&self, offset: u32, value: u32, width: Width) -> IxyResult;
}

impl<R: ResourceIo + ?Sized> ResourceIo for &R {
    fn read_at(&self, offset: u32, width: Width) -> IxyResult<u32> {
        (**self).read_at(offset, width)
    }

    fn write_at(&self, offset: u32, value: u32, width: Width) -> IxyResult {
        (**self).write_at(offset, value, width)
    }
}

impl<R: ResourceIo + ?Sized> ResourceIo for Rc<R> {
    fn read_at(&self, offset: u32, width: Width) -> IxyResult<u32> {
        (**self).read_at(offset, width)
    }

    fn write_at(&self, offset: u32, value: u32, width: Width) -> IxyResult {
        (**self).write_at(offset, value, width)
    }
}

/// Typed register helpers on top of [`ResourceIo`].
pub trait Registers: ResourceIo {
    /// Reads an 8-bit register.
    fn read_u8(&self, offset: u32) -> IxyResult<u8> {
        Ok(self.read_at(offset, Width::U8)? as u8)
    }

    /// Reads a 16-bit register.
    fn read_u16(&self, offset: u32) -> IxyResult<u16> {
        Ok(self.read_at(offset, Width::U16)? as u16)
    }

    /// Reads a 32-bit register.
    fn read_u32(&self, offset: u32) -> IxyResult<u32> {
        self.read_at(offset, Width::U32)
    }

    /// Writes an 8-bit register.
    fn write_u8(&self, offset: u32, value: u8) -> IxyResult {
        self.write_at(offset, value as u32, Width::U8)
    }

    /// Writes a 16-bit register.
    fn write_u16(&self, offset: u32, value: u16) -> IxyResult {
        self.write_at(offset, value as u32, Width::U16)
    }

    /// Writes a 32-bit register.
    fn write_u32(&self, offset: u32, value: u32) -> IxyResult {
        self.write_at(offset, value, Width::U32)
    }

    /// Sets `flags` in a 32-bit register (read-modify-write).
    fn set_flags32(&self, offset: u32, flags: u32) -> IxyResult {
        let value = self.read_u32(offset)?;
        self.write_u32(offset, value | flags)
    }

    /// Clears `flags` in a 32-bit register (read-modify-write).
    fn clear_flags32(&self, offset: u32, flags: u32) -> IxyResult {
        let value = self.read_u32(offset)?;
        self.write_u32(offset, value & !flags)
    }

    /// Polls until all `flags` read as set, sleeping `interval` between reads.
    ///
    /// Gives up with [`IxyError::Timeout`] after `retries` unsuccessful reads.
    fn wait_set_flags32<H: IxyHal>(
        &self,
        offset: u32,
        flags: u32,
        retries: u32,
        interval: Duration,
        what: &'static str,
    ) -> IxyResult {
        poll::<H, _>(retries, interval, what, || {
            Ok(self.read_u32(offset)? & flags == flags)
        })
    }

    /// Polls until all `flags` read as cleared, sleeping `interval` between reads.
    fn wait_clear_flags32<H: IxyHal>(
        &self,
        offset: u32,
        flags: u32,
        retries: u32,
        interval: Duration,
        what: &'static str,
    ) -> IxyResult {
        poll::<H, _>(retries, interval, what, || {
            Ok(self.read_u32(offset)? & flags == 0)
        })
    }
}

impl<R: ResourceIo + ?Sized> Registers for R {}

/// Sleep-then-recheck loop with a hard retry limit.
pub(crate) fn poll<H, F>(
    retries: u32,
    interval: Duration,
    what: &'static str,
    mut done: F,
) -> IxyResult
where
    H: IxyHal,
    F: FnMut() -> IxyResult<bool>,
{
    for _ in 0..=retries {
        if done()? {
            return Ok(());
        }
        H::wait(interval);
    }
    Err(IxyError::Timeout(what))
}

/// Sets the bus master bit so the device may DMA into host memory.
pub(crate) fn enable_bus_master<C: ResourceIo + ?Sized>(config_space: &C) -> IxyResult {
    let command = config_space.read_u16(PCI_COMMAND)?;
    config_space.write_u16(PCI_COMMAND, command | PCI_COMMAND_MASTER)
}
