//! Structured driver events.
//!
//! Bring-up and the queues report what they do through an [`EventSink`]
//! handed to them at construction time. [`LogSink`] forwards to the `log`
//! facade; [`NullSink`] discards everything.

use core::fmt;

use crate::ixgbe::IxgbeState;
use crate::memory::PhysAddr;
use crate::virtio::VirtioState;

/// Direction or role of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Receive queue.
    Rx,
    /// Transmit queue.
    Tx,
    /// VirtIO control queue.
    Control,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueueKind::Rx => "rx",
            QueueKind::Tx => "tx",
            QueueKind::Control => "ctrl",
        })
    }
}

/// Something noteworthy happened inside the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The ixgbe bring-up entered a new state.
    Ixgbe(IxgbeState),
    /// The VirtIO bring-up entered a new state.
    Virtio(VirtioState),
    /// A hugepage region was mapped.
    DmaAllocated {
        /// Virtual base address.
        virt: usize,
        /// Physical base address, if the region is contiguous.
        phys: Option<PhysAddr>,
        /// Mapped size in bytes.
        size: usize,
    },
    /// A packet pool was created.
    MemPoolCreated {
        /// Number of buffers.
        entries: usize,
        /// Size of each buffer in bytes.
        entry_size: usize,
    },
    /// A queue was registered with the device.
    QueueConfigured {
        /// Role of the queue.
        kind: QueueKind,
        /// Queue index.
        index: u16,
        /// Number of descriptors.
        entries: usize,
        /// Physical address of the descriptor memory.
        phys: PhysAddr,
    },
    /// Feature negotiation finished.
    FeaturesNegotiated {
        /// Features offered by the device.
        offered: u32,
        /// Features written back by the driver.
        accepted: u32,
    },
    /// The link came up.
    LinkUp {
        /// Link speed in Mbit/s.
        speed: u16,
    },
    /// The MAC address was read from the device.
    MacAddress([u8; 6]),
    /// A receive batch stopped early because the pool had no buffer to refill
    /// the ring with.
    RxRefillFailed {
        /// Queue index.
        queue: u16,
    },
    /// Pending transmit packets were discarded because the ring was full.
    TxDropped {
        /// Queue index.
        queue: u16,
        /// Number of packets discarded.
        count: usize,
    },
    /// Writing a queue's tail register failed; the hardware did not see the
    /// newest descriptors.
    DoorbellFailed {
        /// Role of the queue.
        kind: QueueKind,
        /// Queue index.
        queue: u16,
    },
    /// The device was reset on teardown.
    Shutdown,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Ixgbe(state) => write!(f, "ixgbe: {state}"),
            Event::Virtio(state) => write!(f, "virtio: {state}"),
            Event::DmaAllocated { virt, phys, size } => match phys {
                Some(pa) => write!(
                    f,
                    "allocated DMA memory @pa: {pa:#x}, va: {virt:#x}, size: {size:#x}"
                ),
                None => write!(
                    f,
                    "allocated DMA memory (non-contiguous) va: {virt:#x}, size: {size:#x}"
                ),
            },
            Event::MemPoolCreated {
                entries,
                entry_size,
            } => write!(f, "mempool with {entries} entries of {entry_size} bytes"),
            Event::QueueConfigured {
                kind,
                index,
                entries,
                phys,
            } => write!(
                f,
                "{kind} queue {index}: {entries} descriptors @pa: {phys:#x}"
            ),
            Event::FeaturesNegotiated { offered, accepted } => write!(
                f,
                "features offered: {offered:#034b}, accepted: {accepted:#034b}"
            ),
            Event::LinkUp { speed } => write!(f, "link up at {speed} Mbit/s"),
            Event::MacAddress(mac) => write!(
                f,
                "mac address {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
            ),
            Event::RxRefillFailed { queue } => write!(
                f,
                "rx queue {queue}: mempool empty, cannot refill ring; \
                 you are either leaking buffers or the pool is too small"
            ),
            Event::TxDropped { queue, count } => {
                write!(f, "tx queue {queue} full, discarding {count} packets")
            }
            Event::DoorbellFailed { kind, queue } => {
                write!(f, "{kind} queue {queue}: tail register write failed")
            }
            Event::Shutdown => f.write_str("device reset on shutdown"),
        }
    }
}

/// Receiver of driver events.
pub trait EventSink {
    /// Records one event. Must not block.
    fn record(&self, event: &Event);
}

/// Forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn record(&self, event: &Event) {
        match event {
            Event::RxRefillFailed { .. } | Event::DoorbellFailed { .. } => error!("{event}"),
            Event::TxDropped { .. } => warn!("{event}"),
            Event::Ixgbe(_) | Event::Virtio(_) | Event::LinkUp { .. } | Event::Shutdown => {
                info!("{event}")
            }
            _ => debug!("{event}"),
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _event: &Event) {}
}
