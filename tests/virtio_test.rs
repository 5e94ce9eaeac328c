//! Functional tests - VirtIO-net device
//!
//! These tests drive `VirtioDevice` against a mock legacy device, including:
//! - Status handshake, feature negotiation and virtqueue registration
//! - Promiscuous mode over the control queue
//! - Receive and transmit through the split virtqueues
//! - Failure paths and teardown

mod common;

use std::ptr;
use std::rc::Rc;

use common::{
    live_mappings, total_mappings, MockConfigSpace, MockHal, MockVirtioBar, RecordingSink,
    MOCK_MAC,
};
use ixy_driver::constants::*;
use ixy_driver::virtqueue::{memory_size, VirtqLayout, VRING_AVAIL_F_NO_INTERRUPT};
use ixy_driver::{
    alloc_pkt, ErrorKind, Event, IxyError, NicDevice, QueueKind, VirtioConfig, VirtioDevice,
    VirtioState, INTEL_VEND, VIRTIO_VEND,
};

type Device = VirtioDevice<MockHal, Rc<MockVirtioBar>>;

const QUEUE: u16 = 64;

fn bring_up(bar: MockVirtioBar) -> (Device, Rc<MockVirtioBar>, Rc<RecordingSink>) {
    let config_space = MockConfigSpace::new(VIRTIO_VEND);
    let bar = Rc::new(bar);
    let sink = Rc::new(RecordingSink::default());
    let dev = Device::init(
        &config_space,
        Rc::clone(&bar),
        VirtioConfig::default(),
        sink.clone(),
    )
    .unwrap();
    (dev, bar, sink)
}

fn default_device() -> (Device, Rc<MockVirtioBar>, Rc<RecordingSink>) {
    bring_up(MockVirtioBar::new(QUEUE, QUEUE, 16))
}

fn try_bring_up(bar: &Rc<MockVirtioBar>, sink: &Rc<RecordingSink>) -> Result<Device, IxyError> {
    let config_space = MockConfigSpace::new(VIRTIO_VEND);
    Device::init(
        &config_space,
        Rc::clone(bar),
        VirtioConfig::default(),
        sink.clone(),
    )
}

fn frame(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_mul(31).wrapping_add(i as u8)).collect()
}

#[test]
fn test_wrong_vendor() {
    let total = total_mappings();
    let config_space = MockConfigSpace::new(INTEL_VEND);
    let bar = Rc::new(MockVirtioBar::new(QUEUE, QUEUE, 16));

    let result = Device::init(
        &config_space,
        Rc::clone(&bar),
        VirtioConfig::default(),
        Rc::new(RecordingSink::default()),
    );

    assert!(matches!(
        result,
        Err(IxyError::WrongDeviceType {
            expected: VIRTIO_VEND,
            found: INTEL_VEND
        })
    ));
    assert_eq!(total_mappings(), total);
    assert!(bar.status_log().is_empty());
}

#[test]
fn test_bring_up_sequence() {
    let (dev, bar, sink) = default_device();

    assert_eq!(
        sink.virtio_states(),
        vec![
            VirtioState::CheckVendor,
            VirtioState::Reset,
            VirtioState::Acknowledge,
            VirtioState::DriverPresent,
            VirtioState::NegotiateFeatures,
            VirtioState::SetupQueues,
            VirtioState::AllocatePacketPools,
            VirtioState::SignalDriverOk,
            VirtioState::SetPromiscuous,
            VirtioState::Ready,
        ]
    );
    assert_eq!(dev.state(), VirtioState::Ready);

    // status bits accumulate
    let ack = VIRTIO_CONFIG_STATUS_ACK;
    let driver = ack | VIRTIO_CONFIG_STATUS_DRIVER;
    assert_eq!(
        bar.status_log(),
        vec![
            VIRTIO_CONFIG_STATUS_RESET,
            ack,
            driver,
            driver | VIRTIO_CONFIG_STATUS_DRIVER_OK
        ]
    );

    // only the required features are accepted, extras are ignored
    assert_eq!(bar.guest_features(), REQUIRED_FEATURES);
    assert_eq!(dev.features(), REQUIRED_FEATURES);
    assert!(sink.contains(&Event::FeaturesNegotiated {
        offered: REQUIRED_FEATURES | (1 << 16),
        accepted: REQUIRED_FEATURES
    }));

    assert_eq!(dev.mac_addr(), MOCK_MAC);
    assert_eq!(dev.get_mac_addr(), MOCK_MAC);
}

#[test]
fn test_queues_registered() {
    let (dev, bar, sink) = default_device();

    for (id, kind, size) in [
        (VIRTIO_RX_QUEUE, QueueKind::Rx, QUEUE),
        (VIRTIO_TX_QUEUE, QueueKind::Tx, QUEUE),
        (VIRTIO_CTRL_QUEUE, QueueKind::Control, 16),
    ] {
        let phys = dev.queue_addr(id).unwrap();
        assert_eq!(phys % 4096, 0);
        assert_eq!(bar.pfn(id) as usize, phys >> VIRTIO_PCI_QUEUE_ADDR_SHIFT);
        assert_eq!(dev.queue_size(id).unwrap(), size);
        assert!(sink.contains(&Event::QueueConfigured {
            kind,
            index: id,
            entries: size as usize,
            phys,
        }));
    }
    assert!(matches!(dev.queue_size(3), Err(IxyError::InvalidQueue(3))));

    // every receive descriptor holds a buffer; the pool holds more than the queue
    assert_eq!(dev.buffers_held(VIRTIO_RX_QUEUE).unwrap(), QUEUE as usize);
    assert_eq!(dev.pool().capacity(), 4 * QUEUE as usize);
    assert_eq!(dev.pool().free_count(), 3 * QUEUE as usize);
    assert_eq!(dev.buffers_held(VIRTIO_TX_QUEUE).unwrap(), 0);
}

#[test]
fn test_queue_layout_256() {
    let (dev, bar, _sink) = bring_up(MockVirtioBar::new(256, 256, 64));
    assert_eq!(memory_size(256), 10246);

    let layout = VirtqLayout::new(256);
    assert_eq!(layout.avail_offset, 4096);
    assert_eq!(layout.used_offset, 8192);

    let base = dev.queue_addr(VIRTIO_RX_QUEUE).unwrap() as *const u8;
    assert_eq!((bar.pfn(VIRTIO_RX_QUEUE) as usize) << 12, base as usize);
    unsafe {
        let flags = ptr::read_volatile(base.add(layout.avail_offset) as *const u16);
        let avail_idx = ptr::read_volatile(base.add(layout.avail_idx_offset()) as *const u16);
        let used_idx = ptr::read_volatile(base.add(layout.used_idx_offset()) as *const u16);
        assert_eq!(flags, VRING_AVAIL_F_NO_INTERRUPT);
        // the whole queue was offered once
        assert_eq!(avail_idx, 256);
        assert_eq!(used_idx, 0);
    }
}

#[test]
fn test_unsupported_features_rejected_before_queue_setup() {
    let total = total_mappings();
    let bar = Rc::new(MockVirtioBar::new(QUEUE, QUEUE, 16));
    let offered = REQUIRED_FEATURES & !(1 << VIRTIO_NET_F_CTRL_VQ);
    bar.set_host_features(offered);
    let sink = Rc::new(RecordingSink::default());

    let err = try_bring_up(&bar, &sink).err().unwrap();

    assert!(matches!(
        err,
        IxyError::UnsupportedFeatures { required: REQUIRED_FEATURES, offered: o } if o == offered
    ));
    assert_eq!(err.kind(), ErrorKind::Initialization);
    assert_eq!(bar.pfn_writes(), 0);
    assert_eq!(total_mappings(), total);
    assert_eq!(sink.virtio_states().last(), Some(&VirtioState::NegotiateFeatures));
    // the device is left reset
    assert_eq!(bar.status_log().last(), Some(&VIRTIO_CONFIG_STATUS_RESET));
}

#[test]
fn test_missing_queue() {
    let live = live_mappings();
    let bar = Rc::new(MockVirtioBar::new(QUEUE, QUEUE, 0));
    let sink = Rc::new(RecordingSink::default());

    let err = try_bring_up(&bar, &sink).err().unwrap();

    assert!(matches!(err, IxyError::QueueUnavailable(2)));
    assert_eq!(bar.pfn_writes(), 2);
    assert_eq!(bar.status_log().last(), Some(&VIRTIO_CONFIG_STATUS_RESET));
    // rx and tx queue memory is gone again
    assert_eq!(live_mappings(), live);
}

#[test]
fn test_queue_size_not_power_of_two() {
    let bar = Rc::new(MockVirtioBar::new(100, QUEUE, 16));
    let sink = Rc::new(RecordingSink::default());

    let err = try_bring_up(&bar, &sink).err().unwrap();

    assert!(matches!(err, IxyError::QueueNotAligned(100)));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_device_failed() {
    let live = live_mappings();
    let bar = Rc::new(MockVirtioBar::new(QUEUE, QUEUE, 16));
    bar.fail_on_driver_ok();
    let sink = Rc::new(RecordingSink::default());

    let err = try_bring_up(&bar, &sink).err().unwrap();

    let status = VIRTIO_CONFIG_STATUS_ACK
        | VIRTIO_CONFIG_STATUS_DRIVER
        | VIRTIO_CONFIG_STATUS_DRIVER_OK
        | VIRTIO_CONFIG_STATUS_FAILED;
    assert!(matches!(err, IxyError::DeviceFailed(s) if s == status));
    // no buffers were offered to a failed device
    assert!(bar.notifies().is_empty());
    assert_eq!(bar.status_log().last(), Some(&VIRTIO_CONFIG_STATUS_RESET));
    assert_eq!(sink.last(), Some(Event::Shutdown));
    assert_eq!(live_mappings(), live);
}

#[test]
fn test_promiscuous_command() {
    let (mut dev, bar, _sink) = default_device();

    // class, command, payload
    assert_eq!(
        bar.commands(),
        vec![vec![VIRTIO_NET_CTRL_RX, VIRTIO_NET_CTRL_RX_PROMISC, 1]]
    );
    assert!(bar.notifies().contains(&VIRTIO_CTRL_QUEUE));

    dev.set_promisc(false).unwrap();
    assert_eq!(bar.commands().len(), 2);
    assert_eq!(bar.commands()[1], vec![0, 0, 0]);

    // the command buffer is reclaimed after the ack
    assert_eq!(dev.buffers_held(VIRTIO_CTRL_QUEUE).unwrap(), 0);
    assert_eq!(dev.state(), VirtioState::Ready);
}

#[test]
fn test_rejected_command() {
    let live = live_mappings();
    let bar = Rc::new(MockVirtioBar::new(QUEUE, QUEUE, 16));
    bar.set_ctrl_ack(1);
    let sink = Rc::new(RecordingSink::default());

    let err = try_bring_up(&bar, &sink).err().unwrap();

    assert!(matches!(
        err,
        IxyError::CommandFailed {
            class: VIRTIO_NET_CTRL_RX,
            command: VIRTIO_NET_CTRL_RX_PROMISC
        }
    ));
    assert_eq!(sink.virtio_states().last(), Some(&VirtioState::SetPromiscuous));
    assert_eq!(bar.status_log().last(), Some(&VIRTIO_CONFIG_STATUS_RESET));
    assert_eq!(live_mappings(), live);
}

#[test]
fn test_receive() {
    let (mut dev, bar, _sink) = default_device();
    let frames: Vec<_> = (0..3).map(|i| frame(i, 60 + i as usize * 100)).collect();
    for f in &frames {
        assert!(bar.inject_rx(f));
    }

    let first = dev.receive(2);
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].as_bytes(), &frames[0][..]);
    assert_eq!(first[1].as_bytes(), &frames[1][..]);

    let rest = dev.rx_batch(0, 32).unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].as_bytes(), &frames[2][..]);
    assert!(dev.receive(32).is_empty());

    // harvested descriptors were handed back with fresh buffers
    assert_eq!(dev.buffers_held(VIRTIO_RX_QUEUE).unwrap(), QUEUE as usize);
    assert_eq!(dev.pool().free_count(), 3 * QUEUE as usize - 3);
    assert!(bar.notifies().iter().filter(|&&q| q == VIRTIO_RX_QUEUE).count() >= 2);

    let stats = dev.fetch_stats();
    assert_eq!(stats.rx_pkts, 3);
    assert_eq!(stats.rx_bytes, (60 + 160 + 260) as u64);

    drop(first);
    drop(rest);
    assert_eq!(dev.pool().free_count(), 3 * QUEUE as usize);
}

#[test]
fn test_receive_with_empty_pool() {
    let (mut dev, bar, sink) = default_device();
    let pool = Rc::clone(dev.pool());
    let hoard: Vec<_> = std::iter::from_fn(|| pool.alloc()).collect();

    assert!(bar.inject_rx(&frame(1, 64)));
    let packets = dev.receive(32);
    assert_eq!(packets.len(), 1);
    assert!(sink.contains(&Event::RxRefillFailed {
        queue: VIRTIO_RX_QUEUE
    }));
    assert_eq!(dev.buffers_held(VIRTIO_RX_QUEUE).unwrap(), QUEUE as usize - 1);

    drop(hoard);
    assert!(dev.receive(32).is_empty());
    assert_eq!(dev.buffers_held(VIRTIO_RX_QUEUE).unwrap(), QUEUE as usize);
}

#[test]
fn test_transmit() {
    let (mut dev, bar, _sink) = default_device();
    let pool = Rc::clone(dev.pool());
    let free = pool.free_count();

    let frames: Vec<_> = (0..3).map(|i| frame(i, 64)).collect();
    let packets: Vec<_> = frames
        .iter()
        .map(|f| {
            let mut p = alloc_pkt(&pool, f.len()).unwrap();
            p.copy_from_slice(f);
            p
        })
        .collect();

    let batch = dev.transmit(packets);
    assert_eq!((batch.reclaimed, batch.sent, batch.dropped), (0, 3, 0));
    assert_eq!(bar.notifies().last(), Some(&VIRTIO_TX_QUEUE));
    assert_eq!(dev.buffers_held(VIRTIO_TX_QUEUE).unwrap(), 3);
    assert_eq!(pool.free_count(), free - 3);

    // device sees the frames behind an all-zero net header
    assert_eq!(bar.complete_tx(), frames);

    assert_eq!(dev.clean_up_old(), 3);
    assert_eq!(pool.free_count(), free);

    let stats = dev.read_and_reset_stats();
    assert_eq!(stats.tx_pkts, 3);
    assert_eq!(stats.tx_bytes, 3 * 64);
    assert_eq!(dev.fetch_stats().tx_pkts, 0);
}

#[test]
fn test_transmit_full_queue_drops() {
    let (mut dev, bar, sink) = default_device();
    let pool = Rc::clone(dev.pool());
    let free = pool.free_count();

    let packets: Vec<_> = (0..QUEUE as usize + 6)
        .map(|_| alloc_pkt(&pool, 60).unwrap())
        .collect();
    let batch = dev.tx_batch(0, packets).unwrap();

    assert_eq!(batch.sent, QUEUE as usize);
    assert_eq!(batch.dropped, 6);
    assert!(sink.contains(&Event::TxDropped {
        queue: VIRTIO_TX_QUEUE,
        count: 6
    }));
    assert_eq!(pool.free_count(), free - QUEUE as usize);

    // nothing completed yet: no room
    let batch = dev.transmit(alloc_pkt(&pool, 60));
    assert_eq!((batch.reclaimed, batch.sent, batch.dropped), (0, 0, 1));

    assert_eq!(bar.complete_tx().len(), QUEUE as usize);
    let batch = dev.transmit(alloc_pkt(&pool, 60));
    assert_eq!((batch.reclaimed, batch.sent, batch.dropped), (QUEUE as usize, 1, 0));
}

#[test]
fn test_nic_device_interface() {
    let (mut dev, _bar, _sink) = default_device();

    assert_eq!(dev.get_driver_name(), "ixy-virtio");
    assert_eq!(dev.get_link_speed(), 1000);
    assert!(matches!(dev.rx_batch(1, 32), Err(IxyError::InvalidQueue(1))));
    assert!(matches!(
        dev.tx_batch(2, Vec::new()),
        Err(IxyError::InvalidQueue(2))
    ));
    assert_eq!(NicDevice::fetch_stats(&mut dev).unwrap().rx_pkts, 0);
}

#[test]
fn test_drop_resets_device() {
    let live = live_mappings();
    let (dev, bar, sink) = default_device();
    assert!(live_mappings() > live);

    drop(dev);

    assert_eq!(bar.status_log().last(), Some(&VIRTIO_CONFIG_STATUS_RESET));
    assert_eq!(bar.pfn(VIRTIO_RX_QUEUE), 0);
    assert_eq!(sink.last(), Some(Event::Shutdown));
    assert_eq!(live_mappings(), live);
}
