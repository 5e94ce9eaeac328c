//! # ixy-driver
//!
//! A userspace driver for Intel 82599 (ixgbe) and VirtIO-net network cards.
//!
//! The driver bypasses the kernel network stack entirely: it programs the NIC
//! through its PCI resources, places descriptor rings and packet buffers in
//! hugepage memory the NIC can DMA into, and moves raw Ethernet frames through
//! those rings from a caller-driven poll loop.
//!
//! ## Features
//!
//! - Hugepage-backed DMA regions with physical address resolution through the
//!   process page table
//! - Fixed-capacity packet buffer pools ([`MemPool`]) with explicit ownership
//!   transfer between the caller, the pool and the hardware rings
//! - Multi-queue RX and TX for the 82599 ([`IxgbeDevice`])
//! - Legacy VirtIO-net with receive, transmit and control virtqueues
//!   ([`VirtioDevice`])
//! - Polling only: no interrupts, no threads, bounded work per call
//!
//! ## Basic Usage
//!
//! ```rust,ignore
//! use ixy_driver::linux::{LinuxHal, PciAddress};
//! use ixy_driver::{IxgbeConfig, IxgbeDevice, LogSink};
//! use std::rc::Rc;
//!
//! let addr: PciAddress = "0000:03:00.0".parse()?;
//! addr.unbind_driver()?;
//! let config = addr.open_resource("config")?;
//! let bar0 = addr.map_resource("resource0")?;
//!
//! let mut dev = IxgbeDevice::<LinuxHal, _>::init(
//!     &config,
//!     bar0,
//!     IxgbeConfig::default(),
//!     Rc::new(LogSink),
//! )?;
//!
//! loop {
//!     let packets = dev.rx_queue_mut(0)?.process_batch();
//!     let tx = dev.tx_queue_mut(0)?;
//!     tx.add_packets(packets);
//!     tx.process_batch();
//! }
//! ```
//!
//! ## Hardware Abstraction Layer (HAL)
//!
//! The driver needs two collaborators from the platform, see [`hal`]:
//! - an [`IxyHal`] for hugepage mapping, page-table lookups and sleeping
//! - a [`ResourceIo`] per PCI resource for fixed-width register access
//!
//! [`linux`] implements both on top of sysfs, hugetlbfs and `/proc/self/pagemap`.
//!
//! ## Concurrency
//!
//! Nothing in this crate is internally synchronized. A packet pool and every
//! buffer drawn from it are tied to one thread (`Rc`), so a device and its
//! queues are driven from the thread that created them.

#![deny(missing_docs)]

pub mod constants;
pub mod descriptor;
mod events;
pub mod hal;
mod ixgbe;
pub mod linux;
pub mod memory;
mod queue;
mod ring;
mod virtio;
pub mod virtqueue;

#[macro_use]
extern crate log;

pub use events::{Event, EventSink, LogSink, NullSink, QueueKind};
pub use hal::{IxyHal, Registers, ResourceIo, Width};
pub use ixgbe::{IxgbeConfig, IxgbeDevice, IxgbeState};
pub use memory::{alloc_pkt, Dma, MemPool, PacketBuffer, PhysAddr, VirtAddr};
pub use queue::{RxQueue, TxBatch, TxQueue};
pub use ring::DEFAULT_RING_ENTRIES;
pub use virtio::{VirtioConfig, VirtioDevice, VirtioState};

/// Vendor ID for Intel.
pub const INTEL_VEND: u16 = 0x8086;

/// Device ID for the 82599ES, used to identify the device from the PCI space.
pub const INTEL_82599: u16 = 0x10FB;

/// Vendor ID for Red Hat / Qumranet, used by all VirtIO devices.
pub const VIRTIO_VEND: u16 = 0x1AF4;

/// Device ID of a transitional (legacy-capable) VirtIO network device.
pub const VIRTIO_NET_LEGACY: u16 = 0x1000;

/// Coarse classification of [`IxyError`], one class per failure domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The device or the requested configuration does not match the driver.
    Configuration,
    /// Device bring-up could not be completed.
    Initialization,
    /// Hugepage or packet pool allocation failed.
    Memory,
    /// A register or resource access failed.
    Io,
}

/// Error type for driver operations.
///
/// Errors are only produced while constructing and bringing up a device.
/// Steady-state queue operations report exhaustion through their return
/// values instead.
#[derive(Debug, thiserror::Error)]
pub enum IxyError {
    /// The PCI vendor of the device does not belong to this driver.
    #[error("wrong device type: expected vendor {expected:#06x}, found {found:#06x}")]
    WrongDeviceType {
        /// Vendor the driver supports.
        expected: u16,
        /// Vendor reported by the configuration space.
        found: u16,
    },
    /// The queue size is not a power of 2.
    ///
    /// Hardware descriptor rings require sizes that are powers of 2.
    #[error("queue size {0} is not a power of two")]
    QueueNotAligned(usize),
    /// Invalid queue ID.
    ///
    /// The specified `queue_id` does not exist on this device.
    #[error("queue {0} does not exist")]
    InvalidQueue(u16),
    /// The device does not offer every feature the driver requires.
    #[error("unsupported features: required {required:#x}, offered {offered:#x}")]
    UnsupportedFeatures {
        /// Feature bitmap the driver requires.
        required: u32,
        /// Feature bitmap the device offered.
        offered: u32,
    },
    /// A queue the driver needs reports a maximum size of zero.
    #[error("queue {0} is not available on the device")]
    QueueUnavailable(u16),
    /// A bounded bring-up poll ran out of retries.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// The device reported an unrecoverable configuration error.
    #[error("device signalled an unrecoverable error (status {0:#04x})")]
    DeviceFailed(u8),
    /// A control command was rejected by the device.
    #[error("control command {class}/{command} failed")]
    CommandFailed {
        /// Command class.
        class: u8,
        /// Command within the class.
        command: u8,
    },
    /// No memory available.
    ///
    /// The hugepage allocation failed or a pool was exhausted during bring-up.
    #[error("no memory available")]
    NoMemory,
    /// The pool entry size is not a divisor of the huge page size.
    #[error("entry size {0} does not divide the huge page size")]
    PageNotAligned(usize),
    /// A physically contiguous region was requested but cannot be provided.
    #[error("cannot provide {0} bytes of physically contiguous memory")]
    NotContiguous(usize),
    /// The page table has no usable frame for a virtual address.
    #[error("cannot translate virtual address {0:#x}")]
    AddressTranslation(usize),
    /// Register or resource access failed.
    #[error("resource I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// A PCI address could not be parsed.
    #[error("invalid PCI address: {0}")]
    Parse(String),
}

impl IxyError {
    /// Returns the failure domain of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            IxyError::WrongDeviceType { .. }
            | IxyError::QueueNotAligned(_)
            | IxyError::InvalidQueue(_)
            | IxyError::Parse(_) => ErrorKind::Configuration,
            IxyError::UnsupportedFeatures { .. }
            | IxyError::QueueUnavailable(_)
            | IxyError::Timeout(_)
            | IxyError::DeviceFailed(_)
            | IxyError::CommandFailed { .. } => ErrorKind::Initialization,
            IxyError::NoMemory
            | IxyError::PageNotAligned(_)
            | IxyError::NotContiguous(_)
            | IxyError::AddressTranslation(_) => ErrorKind::Memory,
            IxyError::Io(_) => ErrorKind::Io,
        }
    }
}

/// Result type for driver functions.
///
/// A type alias for `Result` with [`IxyError`] as the error type.
pub type IxyResult<T = ()> = Result<T, IxyError>;

/// Driver-independent interface of a polled NIC.
///
/// Lets a forwarding loop be written once for both NIC families.
///
/// # Example
///
/// ```rust,ignore
/// use ixy_driver::NicDevice;
///
/// fn forward(rx: &mut impl NicDevice, tx: &mut impl NicDevice) -> IxyResult {
///     let packets = rx.rx_batch(0, 32)?;
///     let batch = tx.tx_batch(0, packets)?;
///     if batch.dropped > 0 {
///         println!("{} dropped {} packets", tx.get_driver_name(), batch.dropped);
///     }
///     Ok(())
/// }
/// ```
pub trait NicDevice {
    /// Returns the driver's name.
    fn get_driver_name(&self) -> &str;

    /// Returns the MAC (Ethernet) address of this device.
    fn get_mac_addr(&self) -> [u8; 6];

    /// Returns the link speed in Mbit/s observed during bring-up.
    fn get_link_speed(&self) -> u16;

    /// Receives up to `max` packets from queue `queue_id`.
    ///
    /// The caller owns the returned buffers; dropping them hands them back
    /// to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`IxyError::InvalidQueue`] if `queue_id` is out of range.
    fn rx_batch(&mut self, queue_id: u16, max: usize) -> IxyResult<Vec<PacketBuffer>>;

    /// Queues `packets` on queue `queue_id` and runs one transmit batch.
    ///
    /// # Errors
    ///
    /// Returns [`IxyError::InvalidQueue`] if `queue_id` is out of range.
    fn tx_batch(&mut self, queue_id: u16, packets: Vec<PacketBuffer>) -> IxyResult<TxBatch>;

    /// Returns the running packet and byte totals.
    fn fetch_stats(&mut self) -> IxyResult<DeviceStats>;
}

/// Network device statistics.
///
/// Holds counters for sent and received packets and bytes.
/// These values can be read from the hardware's statistic registers.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct DeviceStats {
    /// Number of received packets.
    pub rx_pkts: u64,
    /// Number of transmitted packets.
    pub tx_pkts: u64,
    /// Number of received bytes.
    pub rx_bytes: u64,
    /// Number of transmitted bytes.
    pub tx_bytes: u64,
}

impl core::ops::AddAssign for DeviceStats {
    fn add_assign(&mut self, rhs: Self) {
        self.rx_pkts += rhs.rx_pkts;
        self.tx_pkts += rhs.tx_pkts;
        self.rx_bytes += rhs.rx_bytes;
        self.tx_bytes += rhs.tx_bytes;
    }
}

impl core::fmt::Display for DeviceStats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "rx_pkts: {}, tx_pkts: {}, rx_bytes: {}, tx_bytes: {}",
            self.rx_pkts, self.tx_pkts, self.rx_bytes, self.tx_bytes
        )
    }
}
