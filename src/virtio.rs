//! VirtIO-net device on the legacy PCI transport.
//!
//! Bring-up follows section 3.1.1 of the VirtIO 1.0 specification as it
//! applies to legacy devices: reset, acknowledge, driver, feature
//! negotiation, virtqueue setup, driver ok. The device gets one receive, one
//! transmit and one control queue; the control queue is used to switch on
//! promiscuous mode.

use core::fmt;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{fence, Ordering};
use core::time::Duration;
use std::rc::Rc;

use crate::constants::*;
use crate::events::{Event, EventSink, QueueKind};
use crate::hal::{enable_bus_master, poll, IxyHal, Registers, ResourceIo, PCI_VENDOR_ID};
use crate::memory::{MemPool, PacketBuffer, PACKET_HEADROOM};
use crate::queue::TxBatch;
use crate::virtqueue::{VirtQueue, VIRTQ_DESC_F_WRITE};
use crate::{DeviceStats, IxyError, IxyResult, NicDevice, VIRTIO_VEND};

const DRIVER_NAME: &str = "ixy-virtio";

/// Bring-up states of a [`VirtioDevice`], in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VirtioState {
    /// Verifying the PCI vendor id.
    CheckVendor,
    /// Resetting the device.
    Reset,
    /// The driver noticed the device.
    Acknowledge,
    /// The driver knows how to drive the device.
    DriverPresent,
    /// Agreeing on the feature set.
    NegotiateFeatures,
    /// Allocating and registering the virtqueues.
    SetupQueues,
    /// Allocating the receive and control buffer pools.
    AllocatePacketPools,
    /// Telling the device the driver is ready.
    SignalDriverOk,
    /// Switching on promiscuous mode through the control queue.
    SetPromiscuous,
    /// Bring-up complete.
    Ready,
}

impl fmt::Display for VirtioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VirtioState::CheckVendor => "checking vendor",
            VirtioState::Reset => "resetting device",
            VirtioState::Acknowledge => "acknowledging device",
            VirtioState::DriverPresent => "driver present",
            VirtioState::NegotiateFeatures => "negotiating features",
            VirtioState::SetupQueues => "setting up virtqueues",
            VirtioState::AllocatePacketPools => "allocating packet pools",
            VirtioState::SignalDriverOk => "signalling driver ok",
            VirtioState::SetPromiscuous => "enabling promiscuous mode",
            VirtioState::Ready => "ready",
        })
    }
}

/// Bring-up parameters of a [`VirtioDevice`].
#[derive(Debug, Clone)]
pub struct VirtioConfig {
    /// Size of one packet pool entry in bytes.
    pub buffer_size: usize,
    /// Receive pool buffers per receive queue descriptor.
    pub rx_pool_factor: usize,
    /// Polls of the status register after reset before giving up.
    pub reset_retries: u32,
    /// Sleep between two reset polls.
    pub reset_poll_interval: Duration,
    /// Polls of the control queue before a command counts as lost.
    pub command_retries: u32,
    /// Sleep between two control queue polls.
    pub command_poll_interval: Duration,
}

impl Default for VirtioConfig {
    fn default() -> Self {
        VirtioConfig {
            buffer_size: 2048,
            rx_pool_factor: 4,
            reset_retries: 100,
            reset_poll_interval: Duration::from_millis(10),
            command_retries: 1000,
            command_poll_interval: Duration::from_micros(100),
        }
    }
}

/// Resets the device if bring-up fails before the device struct exists.
///
/// Declared after the queue memory so it runs first on unwinding.
struct ResetOnDrop<'a, B: ResourceIo> {
    bar: &'a B,
    armed: bool,
}

impl<B: ResourceIo> ResetOnDrop<'_, B> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<B: ResourceIo> Drop for ResetOnDrop<'_, B> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self
                .bar
                .write_u8(VIRTIO_PCI_STATUS, VIRTIO_CONFIG_STATUS_RESET);
        }
    }
}

/// A legacy VirtIO-net device brought up for polling.
pub struct VirtioDevice<H: IxyHal, B: ResourceIo> {
    bar: B,
    config: VirtioConfig,
    rx: VirtQueue,
    tx: VirtQueue,
    ctrl: VirtQueue,
    rx_pool: Rc<MemPool>,
    ctrl_pool: Rc<MemPool>,
    events: Rc<dyn EventSink>,
    state: VirtioState,
    features: u32,
    mac: [u8; 6],
    stats: DeviceStats,
    _hal: PhantomData<H>,
}

impl<H: IxyHal, B: ResourceIo> VirtioDevice<H, B> {
    /// Brings up the VirtIO-net device behind `bar`.
    ///
    /// `config_space` is the device's PCI configuration space. The vendor id
    /// is checked before anything is allocated.
    ///
    /// # Errors
    ///
    /// - [`IxyError::WrongDeviceType`] - not a VirtIO device
    /// - [`IxyError::UnsupportedFeatures`] - a required feature is missing
    /// - [`IxyError::QueueUnavailable`] - a queue reports size zero
    /// - [`IxyError::Timeout`] - reset or a control command did not complete
    /// - [`IxyError::DeviceFailed`] - the device set the FAILED status bit
    /// - [`IxyError::CommandFailed`] - the device rejected promiscuous mode
    /// - memory errors of the queue and pool allocations
    pub fn init<C: ResourceIo>(
        config_space: &C,
        bar: B,
        config: VirtioConfig,
        events: Rc<dyn EventSink>,
    ) -> IxyResult<Self> {
        events.record(&Event::Virtio(VirtioState::CheckVendor));
        let vendor = config_space.read_u16(PCI_VENDOR_ID)?;
        if vendor != VIRTIO_VEND {
            return Err(IxyError::WrongDeviceType {
                expected: VIRTIO_VEND,
                found: vendor,
            });
        }
        enable_bus_master(config_space)?;

        let mut queues = Vec::with_capacity(3);
        let guard = ResetOnDrop {
            bar: &bar,
            armed: true,
        };

        // 1) reset the device
        events.record(&Event::Virtio(VirtioState::Reset));
        bar.write_u8(VIRTIO_PCI_STATUS, VIRTIO_CONFIG_STATUS_RESET)?;
        poll::<H, _>(
            config.reset_retries,
            config.reset_poll_interval,
            "virtio reset",
            || Ok(bar.read_u8(VIRTIO_PCI_STATUS)? == VIRTIO_CONFIG_STATUS_RESET),
        )?;

        // 2) the OS noticed the device
        events.record(&Event::Virtio(VirtioState::Acknowledge));
        let mut status = VIRTIO_CONFIG_STATUS_ACK;
        bar.write_u8(VIRTIO_PCI_STATUS, status)?;

        // 3) the OS can drive the device
        events.record(&Event::Virtio(VirtioState::DriverPresent));
        status |= VIRTIO_CONFIG_STATUS_DRIVER;
        bar.write_u8(VIRTIO_PCI_STATUS, status)?;

        // 4) negotiate features
        events.record(&Event::Virtio(VirtioState::NegotiateFeatures));
        let offered = bar.read_u32(VIRTIO_PCI_HOST_FEATURES)?;
        let features = negotiate_features(offered)?;
        bar.write_u32(VIRTIO_PCI_GUEST_FEATURES, features)?;
        events.record(&Event::FeaturesNegotiated {
            offered,
            accepted: features,
        });

        // 5) and 6) do not exist on the legacy interface
        // 7) device specific setup
        events.record(&Event::Virtio(VirtioState::SetupQueues));
        for (index, kind) in [
            (VIRTIO_RX_QUEUE, QueueKind::Rx),
            (VIRTIO_TX_QUEUE, QueueKind::Tx),
            (VIRTIO_CTRL_QUEUE, QueueKind::Control),
        ] {
            queues.push(setup_queue::<H, B>(&bar, index, kind, &*events)?);
        }

        // more receive buffers than descriptors, the caller may hold on to
        // delivered packets for a while
        events.record(&Event::Virtio(VirtioState::AllocatePacketPools));
        let rx_entries = queues[0].size() as usize * config.rx_pool_factor;
        let rx_pool = MemPool::allocate::<H>(rx_entries, config.buffer_size, &*events)?;
        let ctrl_pool =
            MemPool::allocate::<H>(queues[2].size() as usize, config.buffer_size, &*events)?;

        guard.disarm();
        let [rx, tx, ctrl]: [VirtQueue; 3] = queues
            .try_into()
            .map_err(|_| IxyError::QueueUnavailable(VIRTIO_RX_QUEUE))?;

        // from here on dropping the device resets it
        let mut dev = VirtioDevice {
            bar,
            config,
            rx,
            tx,
            ctrl,
            rx_pool,
            ctrl_pool,
            events,
            state: VirtioState::AllocatePacketPools,
            features,
            mac: [0; 6],
            stats: DeviceStats::default(),
            _hal: PhantomData,
        };

        // 8) signal ok
        dev.enter(VirtioState::SignalDriverOk);
        fence(Ordering::SeqCst);
        status |= VIRTIO_CONFIG_STATUS_DRIVER_OK;
        dev.bar.write_u8(VIRTIO_PCI_STATUS, status)?;

        let status = dev.bar.read_u8(VIRTIO_PCI_STATUS)?;
        if status & VIRTIO_CONFIG_STATUS_FAILED != 0 {
            return Err(IxyError::DeviceFailed(status));
        }

        dev.refill_rx();

        dev.mac = dev.read_mac()?;
        dev.events.record(&Event::MacAddress(dev.mac));

        dev.enter(VirtioState::SetPromiscuous);
        dev.set_promisc(true)?;

        dev.enter(VirtioState::Ready);
        Ok(dev)
    }

    fn enter(&mut self, state: VirtioState) {
        self.state = state;
        self.events.record(&Event::Virtio(state));
    }

    fn read_mac(&self) -> IxyResult<[u8; 6]> {
        let mut mac = [0; 6];
        for (i, byte) in mac.iter_mut().enumerate() {
            *byte = self.bar.read_u8(VIRTIO_PCI_CONFIG + i as u32)?;
        }
        Ok(mac)
    }

    fn notify(&self, queue: u16, kind: QueueKind) {
        fence(Ordering::SeqCst);
        if self.bar.write_u16(VIRTIO_PCI_QUEUE_NOTIFY, queue).is_err() {
            self.events.record(&Event::DoorbellFailed { kind, queue });
        }
    }

    /// Enables or disables promiscuous mode through the control queue.
    pub fn set_promisc(&mut self, enabled: bool) -> IxyResult {
        self.send_command(
            VIRTIO_NET_CTRL_RX,
            VIRTIO_NET_CTRL_RX_PROMISC,
            &[enabled as u8],
        )
    }

    /// Sends one command over the control queue and waits for the ack.
    ///
    /// The command is a three descriptor chain inside one buffer: class and
    /// command, the payload, and the ack byte the device writes.
    fn send_command(&mut self, class: u8, command: u8, payload: &[u8]) -> IxyResult {
        let len = 2 + payload.len() + 1;
        let mut buf = match self.ctrl_pool.alloc() {
            Some(buf) if len <= buf.capacity() => buf,
            _ => return Err(IxyError::NoMemory),
        };
        buf.set_len(len);
        buf[0] = class;
        buf[1] = command;
        buf[2..2 + payload.len()].copy_from_slice(payload);
        buf[len - 1] = 0xFF;

        let phys = buf.get_phys_addr();
        let ack_ptr = unsafe { buf.get_virt_addr().add(len - 1) };
        let segments = [
            (phys, 2, 0),
            (phys + 2, payload.len() as u32, 0),
            (phys + len - 1, 1, VIRTQ_DESC_F_WRITE),
        ];
        let head = self
            .ctrl
            .post(buf, &segments)
            .map_err(|_| IxyError::NoMemory)?;
        self.ctrl.push_avail(head);
        self.notify(VIRTIO_CTRL_QUEUE, QueueKind::Control);

        let ctrl = &self.ctrl;
        poll::<H, _>(
            self.config.command_retries,
            self.config.command_poll_interval,
            "control command",
            || Ok(ctrl.has_used()),
        )?;

        let ack = unsafe { ptr::read_volatile(ack_ptr) };
        while let Some((id, _)) = self.ctrl.pop_used() {
            if let Some(buf) = self.ctrl.reclaim(id) {
                buf.release();
            }
        }

        if ack != VIRTIO_NET_OK {
            return Err(IxyError::CommandFailed { class, command });
        }
        Ok(())
    }

    /// Offers free receive buffers to the device until the queue or the
    /// pool runs out.
    fn refill_rx(&mut self) {
        let mut posted = 0;
        while self.rx.free_descriptors() > 0 {
            let Some(buf) = self.rx_pool.alloc() else {
                self.events.record(&Event::RxRefillFailed {
                    queue: VIRTIO_RX_QUEUE,
                });
                break;
            };
            // the device writes the net header into the headroom
            let segment = (
                buf.get_phys_addr() - VIRTIO_NET_HDR_LEN,
                (buf.capacity() + VIRTIO_NET_HDR_LEN) as u32,
                VIRTQ_DESC_F_WRITE,
            );
            match self.rx.post(buf, &[segment]) {
                Ok(head) => {
                    self.rx.push_avail(head);
                    posted += 1;
                }
                Err(buf) => {
                    buf.release();
                    break;
                }
            }
        }
        if posted > 0 {
            self.notify(VIRTIO_RX_QUEUE, QueueKind::Rx);
        }
    }

    /// Harvests up to `max` received packets, oldest first, and hands the
    /// freed descriptors back to the device with fresh buffers.
    pub fn receive(&mut self, max: usize) -> Vec<PacketBuffer> {
        let mut packets = Vec::new();
        while packets.len() < max {
            let Some((head, written)) = self.rx.pop_used() else {
                break;
            };
            let Some(mut packet) = self.rx.reclaim(head) else {
                continue;
            };
            let len = (written as usize).saturating_sub(VIRTIO_NET_HDR_LEN);
            packet.len = len.min(packet.capacity());
            self.stats.rx_pkts += 1;
            self.stats.rx_bytes += packet.len as u64;
            packets.push(packet);
        }
        self.refill_rx();
        packets
    }

    /// Returns transmitted buffers to their pool.
    pub fn clean_up_old(&mut self) -> usize {
        let mut reclaimed = 0;
        while let Some((head, _)) = self.tx.pop_used() {
            if let Some(buf) = self.tx.reclaim(head) {
                buf.release();
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Reclaims sent buffers, then posts as many of `packets` as fit.
    ///
    /// Packets that do not fit are dropped, not retried.
    pub fn transmit<I>(&mut self, packets: I) -> TxBatch
    where
        I: IntoIterator<Item = PacketBuffer>,
    {
        let mut batch = TxBatch {
            reclaimed: self.clean_up_old(),
            ..TxBatch::default()
        };

        let mut pending = packets.into_iter();
        while self.tx.free_descriptors() > 0 {
            let Some(mut packet) = pending.next() else {
                break;
            };
            debug_assert!(VIRTIO_NET_HDR_LEN <= PACKET_HEADROOM);
            // no offloads, an all-zero header
            packet.headroom_mut(VIRTIO_NET_HDR_LEN).fill(0);
            let len = packet.len();
            let segment = (
                packet.get_phys_addr() - VIRTIO_NET_HDR_LEN,
                (len + VIRTIO_NET_HDR_LEN) as u32,
                0,
            );
            match self.tx.post(packet, &[segment]) {
                Ok(head) => {
                    self.tx.push_avail(head);
                    batch.sent += 1;
                    self.stats.tx_pkts += 1;
                    self.stats.tx_bytes += len as u64;
                }
                Err(packet) => {
                    packet.release();
                    batch.dropped += 1;
                    break;
                }
            }
        }

        batch.dropped += pending.count();
        if batch.dropped > 0 {
            self.events.record(&Event::TxDropped {
                queue: VIRTIO_TX_QUEUE,
                count: batch.dropped,
            });
        }
        if batch.sent > 0 {
            self.notify(VIRTIO_TX_QUEUE, QueueKind::Tx);
        }
        batch
    }

    /// Returns the running packet and byte totals.
    pub fn fetch_stats(&self) -> DeviceStats {
        self.stats
    }

    /// Returns the running totals, then starts counting from zero.
    pub fn read_and_reset_stats(&mut self) -> DeviceStats {
        core::mem::take(&mut self.stats)
    }

    /// Current bring-up state.
    pub fn state(&self) -> VirtioState {
        self.state
    }

    /// Feature bits written back to the device.
    pub fn features(&self) -> u32 {
        self.features
    }

    /// MAC address from the device configuration.
    pub fn mac_addr(&self) -> [u8; 6] {
        self.mac
    }

    /// Pool the receive queue is refilled from. Transmit buffers may be
    /// allocated from it as well.
    pub fn pool(&self) -> &Rc<MemPool> {
        &self.rx_pool
    }

    /// Descriptor count of queue `id` (0 rx, 1 tx, 2 control).
    pub fn queue_size(&self, id: u16) -> IxyResult<u16> {
        Ok(self.queue(id)?.size())
    }

    /// Physical address of the memory of queue `id`.
    pub fn queue_addr(&self, id: u16) -> IxyResult<usize> {
        Ok(self.queue(id)?.phys_addr())
    }

    /// Number of buffers parked in queue `id`.
    pub fn buffers_held(&self, id: u16) -> IxyResult<usize> {
        Ok(self.queue(id)?.buffers_held())
    }

    fn queue(&self, id: u16) -> IxyResult<&VirtQueue> {
        [&self.rx, &self.tx, &self.ctrl]
            .into_iter()
            .find(|q| q.index() == id)
            .ok_or(IxyError::InvalidQueue(id))
    }
}

impl<H: IxyHal, B: ResourceIo> NicDevice for VirtioDevice<H, B> {
    fn get_driver_name(&self) -> &str {
        DRIVER_NAME
    }

    fn get_mac_addr(&self) -> [u8; 6] {
        self.mac
    }

    /// Legacy devices do not report a speed.
    fn get_link_speed(&self) -> u16 {
        1000
    }

    fn rx_batch(&mut self, queue_id: u16, max: usize) -> IxyResult<Vec<PacketBuffer>> {
        if queue_id != 0 {
            return Err(IxyError::InvalidQueue(queue_id));
        }
        Ok(self.receive(max))
    }

    fn tx_batch(&mut self, queue_id: u16, packets: Vec<PacketBuffer>) -> IxyResult<TxBatch> {
        if queue_id != 0 {
            return Err(IxyError::InvalidQueue(queue_id));
        }
        Ok(self.transmit(packets))
    }

    fn fetch_stats(&mut self) -> IxyResult<DeviceStats> {
        Ok(self.stats)
    }
}

impl<H: IxyHal, B: ResourceIo> Drop for VirtioDevice<H, B> {
    fn drop(&mut self) {
        // the device must let go of the queues before they are unmapped
        let _ = self
            .bar
            .write_u8(VIRTIO_PCI_STATUS, VIRTIO_CONFIG_STATUS_RESET);
        self.events.record(&Event::Shutdown);
    }
}

/// Checks `offered` against [`REQUIRED_FEATURES`] and returns the feature
/// set to write back.
pub(crate) fn negotiate_features(offered: u32) -> IxyResult<u32> {
    if offered & REQUIRED_FEATURES != REQUIRED_FEATURES {
        return Err(IxyError::UnsupportedFeatures {
            required: REQUIRED_FEATURES,
            offered,
        });
    }
    Ok(REQUIRED_FEATURES)
}

/// Section 4.1.5.1.3: selects queue `index`, allocates its memory and
/// registers it with the device.
fn setup_queue<H: IxyHal, B: ResourceIo>(
    bar: &B,
    index: u16,
    kind: QueueKind,
    events: &dyn EventSink,
) -> IxyResult<VirtQueue> {
    bar.write_u16(VIRTIO_PCI_QUEUE_SEL, index)?;
    let size = bar.read_u16(VIRTIO_PCI_QUEUE_NUM)?;
    if size == 0 {
        return Err(IxyError::QueueUnavailable(index));
    }

    let queue = VirtQueue::allocate::<H>(index, size, events)?;
    bar.write_u32(
        VIRTIO_PCI_QUEUE_PFN,
        (queue.phys_addr() >> VIRTIO_PCI_QUEUE_ADDR_SHIFT) as u32,
    )?;

    events.record(&Event::QueueConfigured {
        kind,
        index,
        entries: size as usize,
        phys: queue.phys_addr(),
    });
    Ok(queue)
}
