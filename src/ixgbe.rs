//! Intel 82599 device.
//!
//! [`IxgbeDevice::init`] walks the bring-up sequence of the datasheet
//! (section 4.6.3) as a linear state machine. Every state is a hard
//! precondition for the next one; any failure aborts the bring-up and drops
//! the partially built device, which resets the NIC again.

use core::fmt;
use core::marker::PhantomData;
use core::time::Duration;
use std::rc::Rc;

use crate::constants::*;
use crate::events::{Event, EventSink, QueueKind};
use crate::hal::{enable_bus_master, IxyHal, Registers, ResourceIo, PCI_VENDOR_ID};
use crate::memory::{MemPool, PacketBuffer};
use crate::queue::{RxQueue, TxBatch, TxQueue};
use crate::ring::DEFAULT_RING_ENTRIES;
use crate::{DeviceStats, IxyError, IxyResult, NicDevice, INTEL_VEND};

const DRIVER_NAME: &str = "ixy-ixgbe";

const MAX_QUEUES: u16 = 64;

/// Bring-up states of an [`IxgbeDevice`], in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IxgbeState {
    /// Verifying the PCI vendor id.
    CheckVendor,
    /// Allocating the shared packet pool.
    AllocatePacketPool,
    /// Global reset and link setup.
    ResetAndInit,
    /// Programming the receive queues.
    InitReceive,
    /// Programming the transmit queues.
    InitTransmit,
    /// Enabling every queue.
    StartQueues,
    /// Accepting all unicast and multicast frames.
    SetPromiscuous,
    /// Polling the link status.
    WaitForLink,
    /// Bring-up complete.
    Ready,
}

impl fmt::Display for IxgbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IxgbeState::CheckVendor => "checking vendor",
            IxgbeState::AllocatePacketPool => "allocating packet pool",
            IxgbeState::ResetAndInit => "resetting device",
            IxgbeState::InitReceive => "initializing rx",
            IxgbeState::InitTransmit => "initializing tx",
            IxgbeState::StartQueues => "starting queues",
            IxgbeState::SetPromiscuous => "enabling promiscuous mode",
            IxgbeState::WaitForLink => "waiting for link",
            IxgbeState::Ready => "ready",
        })
    }
}

/// Bring-up parameters of an [`IxgbeDevice`].
#[derive(Debug, Clone)]
pub struct IxgbeConfig {
    /// Number of receive queues.
    pub rx_queues: u16,
    /// Number of transmit queues.
    pub tx_queues: u16,
    /// Descriptors per ring, a power of two.
    pub ring_entries: usize,
    /// Size of one packet pool entry in bytes.
    pub buffer_size: usize,
    /// Pool buffers per ring slot.
    pub pool_factor: usize,
    /// Polls of the reset-complete bits before giving up.
    pub reset_retries: u32,
    /// Sleep between two reset polls.
    pub reset_poll_interval: Duration,
    /// Polls of the link status before giving up.
    pub link_retries: u32,
    /// Sleep between two link polls.
    pub link_poll_interval: Duration,
}

impl Default for IxgbeConfig {
    fn default() -> Self {
        IxgbeConfig {
            rx_queues: 1,
            tx_queues: 1,
            ring_entries: DEFAULT_RING_ENTRIES,
            buffer_size: 2048,
            pool_factor: 2,
            reset_retries: 1000,
            reset_poll_interval: Duration::from_millis(1),
            // 10 seconds
            link_retries: 1000,
            link_poll_interval: Duration::from_millis(10),
        }
    }
}

impl IxgbeConfig {
    /// Number of buffers in the shared packet pool.
    pub fn pool_entries(&self) -> usize {
        (self.rx_queues as usize + self.tx_queues as usize) * self.pool_factor * self.ring_entries
    }

    fn validate(&self) -> IxyResult {
        if self.ring_entries < 2 || !self.ring_entries.is_power_of_two() {
            return Err(IxyError::QueueNotAligned(self.ring_entries));
        }
        if self.rx_queues > MAX_QUEUES {
            return Err(IxyError::InvalidQueue(self.rx_queues));
        }
        if self.tx_queues > MAX_QUEUES {
            return Err(IxyError::InvalidQueue(self.tx_queues));
        }
        Ok(())
    }
}

/// An Intel 82599 NIC brought up for polling.
///
/// `H` provides DMA memory, `B` is the NIC's BAR0.
pub struct IxgbeDevice<H: IxyHal, B: ResourceIo> {
    bar: Rc<B>,
    config: IxgbeConfig,
    pool: Rc<MemPool>,
    rx_queues: Vec<RxQueue<B>>,
    tx_queues: Vec<TxQueue<B>>,
    events: Rc<dyn EventSink>,
    state: IxgbeState,
    stats: DeviceStats,
    mac: [u8; 6],
    link_speed: u16,
    _hal: PhantomData<H>,
}

impl<H: IxyHal, B: ResourceIo> IxgbeDevice<H, B> {
    /// Brings up the NIC behind `bar`.
    ///
    /// `config_space` is the device's PCI configuration space. The vendor id
    /// is checked before anything is allocated.
    ///
    /// # Errors
    ///
    /// - [`IxyError::WrongDeviceType`] - not an Intel device
    /// - [`IxyError::QueueNotAligned`] / [`IxyError::InvalidQueue`] - bad `config`
    /// - [`IxyError::Timeout`] - reset, queue enable or link did not complete
    /// - memory errors of the pool and ring allocations
    /// - [`IxyError::Io`] - register access failed
    pub fn init<C: ResourceIo>(
        config_space: &C,
        bar: B,
        config: IxgbeConfig,
        events: Rc<dyn EventSink>,
    ) -> IxyResult<Self> {
        events.record(&Event::Ixgbe(IxgbeState::CheckVendor));
        let vendor = config_space.read_u16(PCI_VENDOR_ID)?;
        if vendor != INTEL_VEND {
            return Err(IxyError::WrongDeviceType {
                expected: INTEL_VEND,
                found: vendor,
            });
        }
        config.validate()?;
        enable_bus_master(config_space)?;

        events.record(&Event::Ixgbe(IxgbeState::AllocatePacketPool));
        let pool = MemPool::allocate::<H>(config.pool_entries(), config.buffer_size, &*events)?;

        let mut dev = IxgbeDevice {
            bar: Rc::new(bar),
            config,
            pool,
            rx_queues: Vec::new(),
            tx_queues: Vec::new(),
            events,
            state: IxgbeState::AllocatePacketPool,
            stats: DeviceStats::default(),
            mac: [0; 6],
            link_speed: 0,
            _hal: PhantomData,
        };

        dev.reset_and_init()?;
        dev.init_rx()?;
        dev.init_tx()?;
        dev.start_queues()?;
        dev.set_promisc(true)?;
        dev.wait_for_link()?;
        dev.enter(IxgbeState::Ready);

        Ok(dev)
    }

    fn enter(&mut self, state: IxgbeState) {
        self.state = state;
        self.events.record(&Event::Ixgbe(state));
    }

    /// Resets the NIC and restarts link negotiation (section 4.6.3).
    fn reset_and_init(&mut self) -> IxyResult {
        self.enter(IxgbeState::ResetAndInit);
        let (retries, interval) = (self.config.reset_retries, self.config.reset_poll_interval);

        // section 4.6.3.1 - disable all interrupts
        self.bar.write_u32(IXGBE_EIMC, IXGBE_IRQ_CLEAR_MASK)?;

        // section 4.6.3.2
        self.bar.write_u32(IXGBE_CTRL, IXGBE_CTRL_RST_MASK)?;
        self.bar
            .wait_clear_flags32::<H>(IXGBE_CTRL, IXGBE_CTRL_RST_MASK, retries, interval, "reset")?;
        H::wait(Duration::from_millis(10));

        // section 4.6.3.1 - disable interrupts again after reset
        self.bar.write_u32(IXGBE_EIMC, IXGBE_IRQ_CLEAR_MASK)?;

        // section 4.6.3 - wait for EEPROM auto read completion
        self.bar
            .wait_set_flags32::<H>(IXGBE_EEC, IXGBE_EEC_ARD, retries, interval, "eeprom")?;

        // section 4.6.3 - wait for dma initialization done
        self.bar.wait_set_flags32::<H>(
            IXGBE_RDRXCTL,
            IXGBE_RDRXCTL_DMAIDONE,
            retries,
            interval,
            "dma init",
        )?;

        // section 4.6.4 - initialize link (auto negotiation)
        self.init_link()?;

        // section 4.6.5 - statistical counters, reset by reading them
        self.read_counters()?;

        self.mac = self.read_mac()?;
        self.events.record(&Event::MacAddress(self.mac));
        Ok(())
    }

    /// Section 4.6.4.2: 10G serial with auto negotiation restart.
    fn init_link(&mut self) -> IxyResult {
        let autoc = self.bar.read_u32(IXGBE_AUTOC)?;
        self.bar.write_u32(
            IXGBE_AUTOC,
            (autoc & !IXGBE_AUTOC_LMS_MASK) | IXGBE_AUTOC_LMS_10G_SERIAL,
        )?;
        let autoc = self.bar.read_u32(IXGBE_AUTOC)?;
        self.bar.write_u32(
            IXGBE_AUTOC,
            (autoc & !IXGBE_AUTOC_10G_PMA_PMD_MASK) | IXGBE_AUTOC_10G_XAUI,
        )?;
        // negotiate link
        // link comes up asynchronously, WaitForLink polls for it
        self.bar.set_flags32(IXGBE_AUTOC, IXGBE_AUTOC_AN_RESTART)
    }

    fn read_mac(&self) -> IxyResult<[u8; 6]> {
        let low = self.bar.read_u32(IXGBE_RAL0)?;
        let high = self.bar.read_u32(IXGBE_RAH0)?;
        let l = low.to_le_bytes();
        let h = high.to_le_bytes();
        Ok([l[0], l[1], l[2], l[3], h[0], h[1]])
    }

    /// Section 4.6.7: receive functionality.
    fn init_rx(&mut self) -> IxyResult {
        self.enter(IxgbeState::InitReceive);

        // disable rx while re-configuring it
        self.bar.clear_flags32(IXGBE_RXCTRL, IXGBE_RXCTRL_RXEN)?;

        // section 4.6.11.3.4 - no fancy dcb or vt, just a single 128kb packet buffer
        self.bar.write_u32(ixgbe_rxpbsize(0), IXGBE_RXPBSIZE_128KB)?;
        for i in 1..IXGBE_PACKET_BUFFERS {
            self.bar.write_u32(ixgbe_rxpbsize(i), 0)?;
        }

        // always enable CRC offloading
        self.bar.set_flags32(IXGBE_HLREG0, IXGBE_HLREG0_RXCRCSTRP)?;
        self.bar.set_flags32(IXGBE_RDRXCTL, IXGBE_RDRXCTL_CRCSTRIP)?;

        // accept broadcast packets
        self.bar.set_flags32(IXGBE_FCTRL, IXGBE_FCTRL_BAM)?;

        for i in 0..self.config.rx_queues {
            let queue = RxQueue::new::<H>(
                i,
                self.config.ring_entries,
                Rc::clone(&self.pool),
                Rc::clone(&self.bar),
                Rc::clone(&self.events),
            )?;
            let idx = i as u32;

            // enable advanced rx descriptors, drop packets if no rx descriptors are available
            let srrctl = self.bar.read_u32(ixgbe_srrctl(idx))?;
            self.bar.write_u32(
                ixgbe_srrctl(idx),
                (srrctl & !IXGBE_SRRCTL_DESCTYPE_MASK)
                    | IXGBE_SRRCTL_DESCTYPE_ADV_ONEBUF
                    | IXGBE_SRRCTL_DROP_EN,
            )?;

            let phys = queue.descriptor_addr();
            self.bar
                .write_u32(ixgbe_rdbal(idx), (phys as u64 & 0xFFFF_FFFF) as u32)?;
            self.bar.write_u32(ixgbe_rdbah(idx), (phys as u64 >> 32) as u32)?;
            self.bar
                .write_u32(ixgbe_rdlen(idx), queue.descriptor_bytes() as u32)?;

            // set ring to empty at start
            self.bar.write_u32(ixgbe_rdh(idx), 0)?;
            self.bar.write_u32(ixgbe_rdt(idx), 0)?;

            self.events.record(&Event::QueueConfigured {
                kind: QueueKind::Rx,
                index: i,
                entries: queue.len(),
                phys,
            });
            self.rx_queues.push(queue);
        }

        // last sentence of section 4.6.7 - set some magic bits
        self.bar.set_flags32(IXGBE_CTRL_EXT, IXGBE_CTRL_EXT_NS_DIS)?;

        // DCA_RXCTRL bit 12 resets to 1 but must be 0
        for i in 0..self.config.rx_queues as u32 {
            self.bar.clear_flags32(ixgbe_dca_rxctrl(i), 1 << 12)?;
        }

        // start rx
        self.bar.set_flags32(IXGBE_RXCTRL, IXGBE_RXCTRL_RXEN)
    }

    /// Section 4.6.8: transmit functionality.
    fn init_tx(&mut self) -> IxyResult {
        self.enter(IxgbeState::InitTransmit);

        // crc offload and small packet padding
        self.bar
            .set_flags32(IXGBE_HLREG0, IXGBE_HLREG0_TXCRCEN | IXGBE_HLREG0_TXPADEN)?;

        // section 4.6.11.3.4 - set default buffer size allocations
        self.bar.write_u32(ixgbe_txpbsize(0), IXGBE_TXPBSIZE_40KB)?;
        for i in 1..IXGBE_PACKET_BUFFERS {
            self.bar.write_u32(ixgbe_txpbsize(i), 0)?;
        }

        // required when not using DCB/VTd
        self.bar.write_u32(IXGBE_DTXMXSZRQ, 0xFFFF)?;
        self.bar.clear_flags32(IXGBE_RTTDCS, IXGBE_RTTDCS_ARBDIS)?;

        for i in 0..self.config.tx_queues {
            let queue = TxQueue::new::<H>(
                i,
                self.config.ring_entries,
                Rc::clone(&self.bar),
                Rc::clone(&self.events),
            )?;
            let idx = i as u32;

            let phys = queue.descriptor_addr();
            self.bar
                .write_u32(ixgbe_tdbal(idx), (phys as u64 & 0xFFFF_FFFF) as u32)?;
            self.bar.write_u32(ixgbe_tdbah(idx), (phys as u64 >> 32) as u32)?;
            self.bar
                .write_u32(ixgbe_tdlen(idx), queue.descriptor_bytes() as u32)?;

            // descriptor write-back thresholds, sections 7.2.3.4.1 and 7.2.3.5
            // pthresh: 6:0, hthresh: 14:8, wthresh: 22:16
            let mut txdctl = self.bar.read_u32(ixgbe_txdctl(idx))?;
            txdctl &= !(0x7F | (0x7F << 8) | (0x7F << 16));
            txdctl |= 36 | (8 << 8) | (4 << 16);
            self.bar.write_u32(ixgbe_txdctl(idx), txdctl)?;

            self.events.record(&Event::QueueConfigured {
                kind: QueueKind::Tx,
                index: i,
                entries: queue.len(),
                phys,
            });
            self.tx_queues.push(queue);
        }

        // final step: enable DMA
        self.bar.write_u32(IXGBE_DMATXCTL, IXGBE_DMATXCTL_TE)
    }

    fn start_queues(&mut self) -> IxyResult {
        self.enter(IxgbeState::StartQueues);
        let (retries, interval) = (self.config.reset_retries, self.config.reset_poll_interval);

        for queue in self.rx_queues.iter_mut() {
            let idx = queue.index() as u32;
            let tail = queue.fill()?;

            // enable queue and wait if necessary
            self.bar.set_flags32(ixgbe_rxdctl(idx), IXGBE_RXDCTL_ENABLE)?;
            self.bar.wait_set_flags32::<H>(
                ixgbe_rxdctl(idx),
                IXGBE_RXDCTL_ENABLE,
                retries,
                interval,
                "rx queue enable",
            )?;

            // rx queue starts out full
            self.bar.write_u32(ixgbe_rdh(idx), 0)?;
            // was set to 0 before in the init function
            self.bar.write_u32(ixgbe_rdt(idx), tail as u32)?;
        }

        for queue in self.tx_queues.iter() {
            let idx = queue.index() as u32;

            // tx queue starts out empty
            self.bar.write_u32(ixgbe_tdh(idx), 0)?;
            self.bar.write_u32(ixgbe_tdt(idx), 0)?;

            // enable queue and wait if necessary
            self.bar.set_flags32(ixgbe_txdctl(idx), IXGBE_TXDCTL_ENABLE)?;
            self.bar.wait_set_flags32::<H>(
                ixgbe_txdctl(idx),
                IXGBE_TXDCTL_ENABLE,
                retries,
                interval,
                "tx queue enable",
            )?;
        }
        Ok(())
    }

    /// Enables or disables promiscuous mode.
    pub fn set_promisc(&mut self, enabled: bool) -> IxyResult {
        if self.state < IxgbeState::Ready {
            self.enter(IxgbeState::SetPromiscuous);
        }
        let flags = IXGBE_FCTRL_MPE | IXGBE_FCTRL_UPE;
        if enabled {
            self.bar.set_flags32(IXGBE_FCTRL, flags)
        } else {
            self.bar.clear_flags32(IXGBE_FCTRL, flags)
        }
    }

    fn wait_for_link(&mut self) -> IxyResult {
        self.enter(IxgbeState::WaitForLink);
        let bar = &self.bar;
        let mut speed = 0;
        crate::hal::poll::<H, _>(
            self.config.link_retries,
            self.config.link_poll_interval,
            "link",
            || {
                speed = decode_link_speed(bar.read_u32(IXGBE_LINKS)?);
                Ok(speed != 0)
            },
        )?;
        self.link_speed = speed;
        self.events.record(&Event::LinkUp { speed });
        Ok(())
    }

    /// Reads the link speed register, in Mbit/s; 0 if the link is down.
    pub fn read_link_speed(&self) -> IxyResult<u16> {
        Ok(decode_link_speed(self.bar.read_u32(IXGBE_LINKS)?))
    }

    /// Reads the clear-on-read hardware counters.
    fn read_counters(&self) -> IxyResult<DeviceStats> {
        let rx_pkts = self.bar.read_u32(IXGBE_GPRC)? as u64;
        let tx_pkts = self.bar.read_u32(IXGBE_GPTC)? as u64;
        let rx_bytes = self.bar.read_u32(IXGBE_GORCL)? as u64
            + ((self.bar.read_u32(IXGBE_GORCH)? as u64) << 32);
        let tx_bytes = self.bar.read_u32(IXGBE_GOTCL)? as u64
            + ((self.bar.read_u32(IXGBE_GOTCH)? as u64) << 32);
        Ok(DeviceStats {
            rx_pkts,
            tx_pkts,
            rx_bytes,
            tx_bytes,
        })
    }

    /// Adds the counters accumulated since the last read to the running
    /// totals and returns them.
    pub fn fetch_stats(&mut self) -> IxyResult<DeviceStats> {
        let delta = self.read_counters()?;
        self.stats += delta;
        Ok(self.stats)
    }

    /// Returns the running totals including the latest counters, then
    /// starts counting from zero.
    pub fn read_and_reset_stats(&mut self) -> IxyResult<DeviceStats> {
        let stats = self.fetch_stats()?;
        self.stats = DeviceStats::default();
        Ok(stats)
    }

    /// Current bring-up state.
    pub fn state(&self) -> IxgbeState {
        self.state
    }

    /// Configuration the device was brought up with.
    pub fn config(&self) -> &IxgbeConfig {
        &self.config
    }

    /// The shared packet pool. Transmit buffers are allocated from here.
    pub fn pool(&self) -> &Rc<MemPool> {
        &self.pool
    }

    /// MAC address read during bring-up.
    pub fn mac_addr(&self) -> [u8; 6] {
        self.mac
    }

    /// Link speed in Mbit/s observed when the link came up.
    pub fn link_speed(&self) -> u16 {
        self.link_speed
    }

    /// Number of receive queues.
    pub fn num_rx_queues(&self) -> u16 {
        self.rx_queues.len() as u16
    }

    /// Number of transmit queues.
    pub fn num_tx_queues(&self) -> u16 {
        self.tx_queues.len() as u16
    }

    /// Receive queue `id`.
    pub fn rx_queue(&self, id: u16) -> IxyResult<&RxQueue<B>> {
        self.rx_queues
            .get(id as usize)
            .ok_or(IxyError::InvalidQueue(id))
    }

    /// Receive queue `id`, mutable.
    pub fn rx_queue_mut(&mut self, id: u16) -> IxyResult<&mut RxQueue<B>> {
        self.rx_queues
            .get_mut(id as usize)
            .ok_or(IxyError::InvalidQueue(id))
    }

    /// Transmit queue `id`.
    pub fn tx_queue(&self, id: u16) -> IxyResult<&TxQueue<B>> {
        self.tx_queues
            .get(id as usize)
            .ok_or(IxyError::InvalidQueue(id))
    }

    /// Transmit queue `id`, mutable.
    pub fn tx_queue_mut(&mut self, id: u16) -> IxyResult<&mut TxQueue<B>> {
        self.tx_queues
            .get_mut(id as usize)
            .ok_or(IxyError::InvalidQueue(id))
    }
}

impl<H: IxyHal, B: ResourceIo> NicDevice for IxgbeDevice<H, B> {
    fn get_driver_name(&self) -> &str {
        DRIVER_NAME
    }

    fn get_mac_addr(&self) -> [u8; 6] {
        self.mac
    }

    fn get_link_speed(&self) -> u16 {
        self.link_speed
    }

    fn rx_batch(&mut self, queue_id: u16, max: usize) -> IxyResult<Vec<PacketBuffer>> {
        Ok(self.rx_queue_mut(queue_id)?.receive(max))
    }

    fn tx_batch(&mut self, queue_id: u16, packets: Vec<PacketBuffer>) -> IxyResult<TxBatch> {
        let queue = self.tx_queue_mut(queue_id)?;
        queue.add_packets(packets);
        Ok(queue.process_batch())
    }

    fn fetch_stats(&mut self) -> IxyResult<DeviceStats> {
        IxgbeDevice::fetch_stats(self)
    }
}

impl<H: IxyHal, B: ResourceIo> Drop for IxgbeDevice<H, B> {
    fn drop(&mut self) {
        // stop all DMA before the rings and the pool are unmapped
        let reset = self
            .bar
            .write_u32(IXGBE_EIMC, IXGBE_IRQ_CLEAR_MASK)
            .and_then(|_| self.bar.write_u32(IXGBE_CTRL, IXGBE_CTRL_RST_MASK));
        if reset.is_ok() {
            H::wait(Duration::from_millis(10));
        }
        self.events.record(&Event::Shutdown);
    }
}

/// Decodes the LINKS register into Mbit/s.
pub(crate) fn decode_link_speed(links: u32) -> u16 {
    if links & IXGBE_LINKS_UP == 0 {
        return 0;
    }
    match links & IXGBE_LINKS_SPEED_82599 {
        IXGBE_LINKS_SPEED_100_82599 => 100,
        IXGBE_LINKS_SPEED_1G_82599 => 1000,
        IXGBE_LINKS_SPEED_10G_82599 => 10000,
        _ => 0,
    }
}
