//! Receive and transmit queues of the 82599.
//!
//! Both queues are thin policies on top of [`DescriptorRing`]: the receive
//! queue keeps every slot stocked with a buffer and swaps in a fresh one for
//! each packet it hands out, the transmit queue parks caller buffers in the
//! ring until the NIC reports them sent.

use core::sync::atomic::{fence, Ordering};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::constants::{ixgbe_rdt, ixgbe_tdt};
use crate::descriptor::{AdvancedRxDescriptor, AdvancedTxDescriptor};
use crate::events::{Event, EventSink, QueueKind};
use crate::hal::{IxyHal, Registers, ResourceIo};
use crate::memory::{MemPool, PacketBuffer, PhysAddr, Prefetch};
use crate::ring::DescriptorRing;
use crate::{IxyError, IxyResult};

/// One receive queue.
pub struct RxQueue<B: ResourceIo> {
    index: u16,
    ring: DescriptorRing<AdvancedRxDescriptor>,
    pool: Rc<MemPool>,
    bar: Rc<B>,
    events: Rc<dyn EventSink>,
}

impl<B: ResourceIo> RxQueue<B> {
    pub(crate) fn new<H: IxyHal>(
        index: u16,
        entries: usize,
        pool: Rc<MemPool>,
        bar: Rc<B>,
        events: Rc<dyn EventSink>,
    ) -> IxyResult<Self> {
        let ring = DescriptorRing::allocate::<H>(entries, &*events)?;
        Ok(RxQueue {
            index,
            ring,
            pool,
            bar,
            events,
        })
    }

    /// Parks a buffer in every slot and hands all but one to the NIC.
    ///
    /// Returns the tail index to program into RDT.
    pub(crate) fn fill(&mut self) -> IxyResult<usize> {
        for i in 0..self.ring.len() {
            let buf = self.pool.alloc().ok_or(IxyError::NoMemory)?;
            if let Some(old) = self.ring.post(i, buf) {
                old.release();
            }
        }
        let tail = self.ring.len() - 1;
        self.ring.set_tail(tail);
        Ok(tail)
    }

    /// Queue index on the device.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Number of descriptors in the ring.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns true if the NIC has no slot to write into.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Next slot the NIC will complete.
    pub fn head(&self) -> usize {
        self.ring.head()
    }

    /// Last slot handed back to the NIC.
    pub fn tail(&self) -> usize {
        self.ring.tail()
    }

    /// Number of slots the NIC may currently write into.
    pub fn in_flight(&self) -> usize {
        self.ring.in_flight()
    }

    /// Number of pool buffers parked in the ring.
    pub fn buffers_held(&self) -> usize {
        self.ring.buffers_held()
    }

    /// Physical address of the descriptor memory.
    pub fn descriptor_addr(&self) -> PhysAddr {
        self.ring.phys_addr()
    }

    pub(crate) fn descriptor_bytes(&self) -> usize {
        self.ring.byte_len()
    }

    /// Pool the ring is refilled from.
    pub fn pool(&self) -> &Rc<MemPool> {
        &self.pool
    }

    /// Harvests up to `max` received packets, oldest first.
    ///
    /// Stops at the first slot the NIC has not completed. Every harvested
    /// slot is refilled with a fresh buffer before its packet is handed out;
    /// if the pool runs dry the batch ends early and an
    /// [`Event::RxRefillFailed`] is recorded, leaving the slot with its old
    /// buffer for a later call.
    pub fn receive(&mut self, max: usize) -> Vec<PacketBuffer> {
        let budget = max.min(self.ring.in_flight());
        let mut packets = Vec::with_capacity(budget);
        let mut last = None;

        while packets.len() < budget && self.ring.head_completed() {
            let head = self.ring.head();
            // buffers hold a full frame, a packet never spans descriptors
            let len = self.ring.with_descriptor(head, |d| d.length() as usize);

            let fresh = match self.pool.alloc() {
                Some(buf) => buf,
                None => {
                    self.events
                        .record(&Event::RxRefillFailed { queue: self.index });
                    break;
                }
            };

            if let Some(mut packet) = self.ring.post(head, fresh) {
                packet.len = len.min(packet.capacity());
                packet.prefetch(Prefetch::Time0);
                packets.push(packet);
            }

            last = Some(head);
            self.ring.set_tail(head);
            self.ring.advance_head();
        }

        if let Some(tail) = last {
            fence(Ordering::SeqCst);
            if self
                .bar
                .write_u32(ixgbe_rdt(self.index as u32), tail as u32)
                .is_err()
            {
                self.events.record(&Event::DoorbellFailed {
                    kind: QueueKind::Rx,
                    queue: self.index,
                });
            }
        }

        packets
    }

    /// Harvests everything the NIC has completed, at most one ring's worth.
    pub fn process_batch(&mut self) -> Vec<PacketBuffer> {
        self.receive(self.ring.len())
    }
}

/// Outcome of one [`TxQueue::process_batch`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TxBatch {
    /// Sent buffers returned to their pool.
    pub reclaimed: usize,
    /// Pending buffers posted to the NIC.
    pub sent: usize,
    /// Pending buffers discarded because the ring was full.
    pub dropped: usize,
}

/// One transmit queue.
pub struct TxQueue<B: ResourceIo> {
    index: u16,
    ring: DescriptorRing<AdvancedTxDescriptor>,
    pending: VecDeque<PacketBuffer>,
    bar: Rc<B>,
    events: Rc<dyn EventSink>,
}

impl<B: ResourceIo> TxQueue<B> {
    pub(crate) fn new<H: IxyHal>(
        index: u16,
        entries: usize,
        bar: Rc<B>,
        events: Rc<dyn EventSink>,
    ) -> IxyResult<Self> {
        let ring = DescriptorRing::allocate::<H>(entries, &*events)?;
        Ok(TxQueue {
            index,
            ring,
            pending: VecDeque::new(),
            bar,
            events,
        })
    }

    /// Queue index on the device.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Number of descriptors in the ring.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns true if no descriptor is waiting for the NIC.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Oldest slot not yet reclaimed.
    pub fn head(&self) -> usize {
        self.ring.head()
    }

    /// Next slot to post into.
    pub fn tail(&self) -> usize {
        self.ring.tail()
    }

    /// Number of slots waiting for the NIC.
    pub fn in_flight(&self) -> usize {
        self.ring.in_flight()
    }

    /// Number of slots that can be posted right now.
    pub fn free_slots(&self) -> usize {
        self.ring.free_slots()
    }

    /// Number of caller buffers parked in the ring.
    pub fn buffers_held(&self) -> usize {
        self.ring.buffers_held()
    }

    /// Number of buffers waiting for the next [`TxQueue::process_batch`].
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Physical address of the descriptor memory.
    pub fn descriptor_addr(&self) -> PhysAddr {
        self.ring.phys_addr()
    }

    pub(crate) fn descriptor_bytes(&self) -> usize {
        self.ring.byte_len()
    }

    /// Queues packets for the next [`TxQueue::process_batch`].
    ///
    /// The pending list is unbounded; whatever does not fit into the ring on
    /// the next batch is discarded.
    pub fn add_packets<I>(&mut self, packets: I)
    where
        I: IntoIterator<Item = PacketBuffer>,
    {
        self.pending.extend(packets);
    }

    /// Returns sent buffers to their pool.
    ///
    /// Walks forward from `head` and stops at the first descriptor the NIC
    /// has not finished. Returns the number of reclaimed buffers.
    pub fn clean_up_old(&mut self) -> usize {
        let mut reclaimed = 0;
        while !self.ring.is_empty() && self.ring.head_completed() {
            let head = self.ring.head();
            if let Some(buf) = self.ring.take(head) {
                buf.release();
            }
            self.ring.advance_head();
            reclaimed += 1;
        }
        reclaimed
    }

    /// Reclaims sent buffers, then posts as many pending packets as fit.
    ///
    /// Packets that do not fit are dropped, not retried: callers have to
    /// rate-limit what they submit.
    pub fn process_batch(&mut self) -> TxBatch {
        let mut batch = TxBatch {
            reclaimed: self.clean_up_old(),
            ..TxBatch::default()
        };

        while !self.ring.is_full() {
            let Some(packet) = self.pending.pop_front() else {
                break;
            };
            let tail = self.ring.tail();
            if let Some(stale) = self.ring.post(tail, packet) {
                stale.release();
            }
            self.ring.advance_tail();
            batch.sent += 1;
        }

        if !self.pending.is_empty() {
            batch.dropped = self.pending.len();
            self.pending.clear();
            self.events.record(&Event::TxDropped {
                queue: self.index,
                count: batch.dropped,
            });
        }

        if batch.sent > 0 {
            fence(Ordering::SeqCst);
            if self
                .bar
                .write_u32(ixgbe_tdt(self.index as u32), self.ring.tail() as u32)
                .is_err()
            {
                self.events.record(&Event::DoorbellFailed {
                    kind: QueueKind::Tx,
                    queue: self.index,
                });
            }
        }

        batch
    }
}
