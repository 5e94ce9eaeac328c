//! Shared mocks for the functional tests.
//!
//! - `MockHal`: hugepages from the global allocator, identity page table
//! - `MockConfigSpace`: vendor id and command register
//! - `MockIxgbeBar`: an 82599 register file that completes every reset and
//!   reports a 10G link
//! - `MockVirtioBar`: a legacy VirtIO-net device that serves its virtqueues
//!   straight out of (identity mapped) queue memory

#![allow(dead_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::io;
use std::ptr::{self, NonNull};
use std::time::Duration;

use ixy_driver::constants::*;
use ixy_driver::hal::{PCI_COMMAND, PCI_VENDOR_ID};
use ixy_driver::memory::HUGE_PAGE_SIZE;
use ixy_driver::virtqueue::{VirtqDesc, VirtqLayout, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};
use ixy_driver::{Event, EventSink, IxgbeState, IxyError, IxyHal, IxyResult, ResourceIo};
use ixy_driver::{VirtioState, Width};

thread_local! {
    static LIVE_MAPPINGS: Cell<usize> = Cell::new(0);
    static TOTAL_MAPPINGS: Cell<usize> = Cell::new(0);
    static WAITS: Cell<usize> = Cell::new(0);
}

/// Number of hugepage mappings of this thread not yet released.
pub fn live_mappings() -> usize {
    LIVE_MAPPINGS.with(Cell::get)
}

/// Number of hugepage mappings this thread ever made.
pub fn total_mappings() -> usize {
    TOTAL_MAPPINGS.with(Cell::get)
}

/// Number of `wait` calls on this thread.
pub fn waits() -> usize {
    WAITS.with(Cell::get)
}

fn hugepage_layout(size: usize) -> Layout {
    Layout::from_size_align(size, HUGE_PAGE_SIZE).expect("hugepage layout")
}

// Mock HAL: physical address == virtual address
pub struct MockHal;

unsafe impl IxyHal for MockHal {
    fn map_hugepages(size: usize) -> IxyResult<NonNull<u8>> {
        let ptr = unsafe { alloc_zeroed(hugepage_layout(size)) };
        let ptr = NonNull::new(ptr).ok_or(IxyError::NoMemory)?;
        LIVE_MAPPINGS.with(|c| c.set(c.get() + 1));
        TOTAL_MAPPINGS.with(|c| c.set(c.get() + 1));
        Ok(ptr)
    }

    unsafe fn unmap_hugepages(vaddr: NonNull<u8>, size: usize) {
        dealloc(vaddr.as_ptr(), hugepage_layout(size));
        LIVE_MAPPINGS.with(|c| c.set(c.get() - 1));
    }

    fn pagemap_entry(page_index: usize) -> IxyResult<u64> {
        Ok((1 << 63) | page_index as u64)
    }

    fn wait(_duration: Duration) {
        WAITS.with(|c| c.set(c.get() + 1));
    }
}

/// Collects every event in order.
#[derive(Default)]
pub struct RecordingSink {
    events: RefCell<Vec<Event>>,
}

impl EventSink for RecordingSink {
    fn record(&self, event: &Event) {
        self.events.borrow_mut().push(event.clone());
    }
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn ixgbe_states(&self) -> Vec<IxgbeState> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Ixgbe(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    pub fn virtio_states(&self) -> Vec<VirtioState> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                Event::Virtio(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    pub fn contains(&self, event: &Event) -> bool {
        self.events.borrow().contains(event)
    }

    pub fn last(&self) -> Option<Event> {
        self.events.borrow().last().cloned()
    }
}

fn injected_error() -> IxyError {
    io::Error::new(io::ErrorKind::Other, "injected register failure").into()
}

/// PCI configuration space with a vendor id and a command register.
pub struct MockConfigSpace {
    vendor: u16,
    command: Cell<u16>,
}

impl MockConfigSpace {
    pub fn new(vendor: u16) -> Self {
        MockConfigSpace {
            vendor,
            command: Cell::new(0x0003),
        }
    }

    pub fn command(&self) -> u16 {
        self.command.get()
    }
}

impl ResourceIo for MockConfigSpace {
    fn read_at(&self, offset: u32, _width: Width) -> IxyResult<u32> {
        Ok(match offset {
            PCI_VENDOR_ID => self.vendor as u32,
            PCI_COMMAND => self.command.get() as u32,
            _ => 0,
        })
    }

    fn write_at(&self, offset: u32, value: u32, _width: Width) -> IxyResult {
        if offset == PCI_COMMAND {
            self.command.set(value as u16);
        }
        Ok(())
    }
}

pub const MOCK_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

/// BAR0 of an 82599 that completes every reset immediately.
pub struct MockIxgbeBar {
    regs: RefCell<HashMap<u32, u32>>,
    writes: RefCell<Vec<(u32, u32)>>,
    failing: RefCell<HashSet<u32>>,
    links: Cell<u32>,
}

impl MockIxgbeBar {
    pub fn new() -> Self {
        let mut regs = HashMap::new();
        regs.insert(
            IXGBE_RAL0,
            u32::from_le_bytes([MOCK_MAC[0], MOCK_MAC[1], MOCK_MAC[2], MOCK_MAC[3]]),
        );
        regs.insert(
            IXGBE_RAH0,
            u32::from_le_bytes([MOCK_MAC[4], MOCK_MAC[5], 0, 0x80]),
        );
        // counters hold garbage from before the reset
        regs.insert(IXGBE_GPRC, 1234);
        MockIxgbeBar {
            regs: RefCell::new(regs),
            writes: RefCell::new(Vec::new()),
            failing: RefCell::new(HashSet::new()),
            links: Cell::new(IXGBE_LINKS_UP | IXGBE_LINKS_SPEED_10G_82599),
        }
    }

    pub fn set(&self, reg: u32, value: u32) {
        self.regs.borrow_mut().insert(reg, value);
    }

    pub fn get(&self, reg: u32) -> u32 {
        self.regs.borrow().get(&reg).copied().unwrap_or(0)
    }

    pub fn set_links(&self, value: u32) {
        self.links.set(value);
    }

    /// Makes every later write to `reg` fail.
    pub fn fail_writes(&self, reg: u32) {
        self.failing.borrow_mut().insert(reg);
    }

    pub fn writes_to(&self, reg: u32) -> Vec<u32> {
        self.writes
            .borrow()
            .iter()
            .filter(|(r, _)| *r == reg)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn last_write(&self, reg: u32) -> Option<u32> {
        self.writes_to(reg).last().copied()
    }
}

impl ResourceIo for MockIxgbeBar {
    fn read_at(&self, offset: u32, _width: Width) -> IxyResult<u32> {
        let stored = self.get(offset);
        Ok(match offset {
            IXGBE_EEC => stored | IXGBE_EEC_ARD,
            IXGBE_RDRXCTL => stored | IXGBE_RDRXCTL_DMAIDONE,
            IXGBE_LINKS => self.links.get(),
            IXGBE_GPRC | IXGBE_GPTC | IXGBE_GORCL | IXGBE_GORCH | IXGBE_GOTCL
            | IXGBE_GOTCH => {
                // clear on read
                self.regs.borrow_mut().remove(&offset);
                stored
            }
            _ => stored,
        })
    }

    fn write_at(&self, offset: u32, value: u32, _width: Width) -> IxyResult {
        if self.failing.borrow().contains(&offset) {
            return Err(injected_error());
        }
        self.writes.borrow_mut().push((offset, value));
        let value = match offset {
            // reset bits clear themselves
            IXGBE_CTRL => value & !IXGBE_CTRL_RST_MASK,
            _ => value,
        };
        self.set(offset, value);
        Ok(())
    }
}

#[derive(Default, Clone, Copy)]
struct DeviceQueue {
    size: u16,
    pfn: u32,
    last_avail: u16,
    used_idx: u16,
}

/// A legacy VirtIO-net device.
///
/// The control queue is served synchronously on notify. Transmit and receive
/// queues are only touched when a test calls [`MockVirtioBar::complete_tx`]
/// or [`MockVirtioBar::inject_rx`].
pub struct MockVirtioBar {
    host_features: Cell<u32>,
    guest_features: Cell<u32>,
    status: Cell<u8>,
    status_log: RefCell<Vec<u8>>,
    fail_on_driver_ok: Cell<bool>,
    queue_sel: Cell<u16>,
    queues: RefCell<[DeviceQueue; 3]>,
    pfn_writes: Cell<usize>,
    notifies: RefCell<Vec<u16>>,
    ctrl_ack: Cell<u8>,
    commands: RefCell<Vec<Vec<u8>>>,
}

impl MockVirtioBar {
    pub fn new(rx_size: u16, tx_size: u16, ctrl_size: u16) -> Self {
        let mut queues = [DeviceQueue::default(); 3];
        queues[0].size = rx_size;
        queues[1].size = tx_size;
        queues[2].size = ctrl_size;
        MockVirtioBar {
            host_features: Cell::new(REQUIRED_FEATURES | (1 << 16)),
            guest_features: Cell::new(0),
            status: Cell::new(0),
            status_log: RefCell::new(Vec::new()),
            fail_on_driver_ok: Cell::new(false),
            queue_sel: Cell::new(0),
            queues: RefCell::new(queues),
            pfn_writes: Cell::new(0),
            notifies: RefCell::new(Vec::new()),
            ctrl_ack: Cell::new(VIRTIO_NET_OK),
            commands: RefCell::new(Vec::new()),
        }
    }

    pub fn set_host_features(&self, features: u32) {
        self.host_features.set(features);
    }

    pub fn guest_features(&self) -> u32 {
        self.guest_features.get()
    }

    /// Sets FAILED as soon as the driver signals DRIVER_OK.
    pub fn fail_on_driver_ok(&self) {
        self.fail_on_driver_ok.set(true);
    }

    /// Ack byte written for every later control command.
    pub fn set_ctrl_ack(&self, ack: u8) {
        self.ctrl_ack.set(ack);
    }

    pub fn status_log(&self) -> Vec<u8> {
        self.status_log.borrow().clone()
    }

    pub fn pfn_writes(&self) -> usize {
        self.pfn_writes.get()
    }

    pub fn pfn(&self, queue: u16) -> u32 {
        self.queues.borrow()[queue as usize].pfn
    }

    pub fn notifies(&self) -> Vec<u16> {
        self.notifies.borrow().clone()
    }

    /// Control commands seen so far: class, command, payload.
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.commands.borrow().clone()
    }

    fn queue_memory(&self, queue: u16) -> Option<(*mut u8, VirtqLayout)> {
        let q = self.queues.borrow()[queue as usize];
        if q.pfn == 0 {
            return None;
        }
        let base = ((q.pfn as usize) << VIRTIO_PCI_QUEUE_ADDR_SHIFT) as *mut u8;
        Some((base, VirtqLayout::new(q.size as usize)))
    }

    fn pop_avail(&self, queue: u16) -> Option<u16> {
        let (base, layout) = self.queue_memory(queue)?;
        let mut queues = self.queues.borrow_mut();
        let q = &mut queues[queue as usize];
        let avail_idx =
            unsafe { ptr::read_volatile(base.add(layout.avail_idx_offset()) as *const u16) };
        if avail_idx == q.last_avail {
            return None;
        }
        let slot = (q.last_avail % q.size) as usize;
        let head =
            unsafe { ptr::read_volatile(base.add(layout.avail_ring_offset(slot)) as *const u16) };
        q.last_avail = q.last_avail.wrapping_add(1);
        Some(head)
    }

    fn push_used(&self, queue: u16, id: u16, len: u32) {
        let Some((base, layout)) = self.queue_memory(queue) else {
            return;
        };
        let mut queues = self.queues.borrow_mut();
        let q = &mut queues[queue as usize];
        let slot = (q.used_idx % q.size) as usize;
        unsafe {
            let elem = base.add(layout.used_ring_offset(slot));
            ptr::write_volatile(elem as *mut u32, id as u32);
            ptr::write_volatile(elem.add(4) as *mut u32, len);
        }
        q.used_idx = q.used_idx.wrapping_add(1);
        unsafe {
            ptr::write_volatile(base.add(layout.used_idx_offset()) as *mut u16, q.used_idx)
        };
    }

    /// Descriptors of the chain starting at `head` as `(addr, len, flags)`.
    fn chain(&self, queue: u16, head: u16) -> Vec<(usize, u32, u16)> {
        let Some((base, _)) = self.queue_memory(queue) else {
            return Vec::new();
        };
        let mut chain = Vec::new();
        let mut id = head;
        loop {
            let desc = unsafe { &*(base as *const VirtqDesc).add(id as usize) };
            let flags = desc.flags.read();
            chain.push((desc.addr.read() as usize, desc.len.read(), flags));
            if flags & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            id = desc.next.read();
        }
        chain
    }

    fn serve_ctrl(&self) {
        while let Some(head) = self.pop_avail(VIRTIO_CTRL_QUEUE) {
            let mut command = Vec::new();
            for (addr, len, flags) in self.chain(VIRTIO_CTRL_QUEUE, head) {
                if flags & VIRTQ_DESC_F_WRITE != 0 {
                    unsafe { ptr::write_volatile(addr as *mut u8, self.ctrl_ack.get()) };
                } else {
                    let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, len as usize) };
                    command.extend_from_slice(bytes);
                }
            }
            self.commands.borrow_mut().push(command);
            self.push_used(VIRTIO_CTRL_QUEUE, head, 1);
        }
    }

    /// Consumes every available transmit chain and returns the frames
    /// without their net header.
    pub fn complete_tx(&self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(head) = self.pop_avail(VIRTIO_TX_QUEUE) {
            let mut bytes = Vec::new();
            for (addr, len, _) in self.chain(VIRTIO_TX_QUEUE, head) {
                bytes.extend_from_slice(unsafe {
                    std::slice::from_raw_parts(addr as *const u8, len as usize)
                });
            }
            assert!(
                bytes[..VIRTIO_NET_HDR_LEN].iter().all(|&b| b == 0),
                "net header must be zeroed"
            );
            frames.push(bytes[VIRTIO_NET_HDR_LEN..].to_vec());
            self.push_used(VIRTIO_TX_QUEUE, head, 0);
        }
        frames
    }

    /// Delivers `frame` into the next receive buffer. Returns false if the
    /// driver has not posted one.
    pub fn inject_rx(&self, frame: &[u8]) -> bool {
        let Some(head) = self.pop_avail(VIRTIO_RX_QUEUE) else {
            return false;
        };
        let (addr, len, flags) = self.chain(VIRTIO_RX_QUEUE, head)[0];
        assert!(flags & VIRTQ_DESC_F_WRITE != 0);
        assert!(frame.len() + VIRTIO_NET_HDR_LEN <= len as usize);
        unsafe {
            ptr::write_bytes(addr as *mut u8, 0, VIRTIO_NET_HDR_LEN);
            ptr::copy_nonoverlapping(
                frame.as_ptr(),
                (addr as *mut u8).add(VIRTIO_NET_HDR_LEN),
                frame.len(),
            );
        }
        self.push_used(
            VIRTIO_RX_QUEUE,
            head,
            (frame.len() + VIRTIO_NET_HDR_LEN) as u32,
        );
        true
    }
}

impl ResourceIo for MockVirtioBar {
    fn read_at(&self, offset: u32, _width: Width) -> IxyResult<u32> {
        let sel = self.queue_sel.get() as usize;
        Ok(match offset {
            VIRTIO_PCI_HOST_FEATURES => self.host_features.get(),
            VIRTIO_PCI_GUEST_FEATURES => self.guest_features.get(),
            VIRTIO_PCI_QUEUE_NUM => self.queues.borrow().get(sel).map_or(0, |q| q.size as u32),
            VIRTIO_PCI_QUEUE_PFN => self.queues.borrow().get(sel).map_or(0, |q| q.pfn),
            VIRTIO_PCI_QUEUE_SEL => sel as u32,
            VIRTIO_PCI_STATUS => {
                let status = self.status.get();
                let failed = self.fail_on_driver_ok.get()
                    && status & VIRTIO_CONFIG_STATUS_DRIVER_OK != 0;
                (if failed {
                    status | VIRTIO_CONFIG_STATUS_FAILED
                } else {
                    status
                }) as u32
            }
            o if (VIRTIO_PCI_CONFIG..VIRTIO_PCI_CONFIG + 6).contains(&o) => {
                MOCK_MAC[(o - VIRTIO_PCI_CONFIG) as usize] as u32
            }
            _ => 0,
        })
    }

    fn write_at(&self, offset: u32, value: u32, _width: Width) -> IxyResult {
        match offset {
            VIRTIO_PCI_GUEST_FEATURES => self.guest_features.set(value),
            VIRTIO_PCI_QUEUE_SEL => self.queue_sel.set(value as u16),
            VIRTIO_PCI_QUEUE_PFN => {
                self.pfn_writes.set(self.pfn_writes.get() + 1);
                let sel = self.queue_sel.get() as usize;
                if let Some(q) = self.queues.borrow_mut().get_mut(sel) {
                    q.pfn = value;
                }
            }
            VIRTIO_PCI_STATUS => {
                let status = value as u8;
                self.status.set(status);
                self.status_log.borrow_mut().push(status);
                if status == VIRTIO_CONFIG_STATUS_RESET {
                    // forget the queues, their memory is about to go away
                    for q in self.queues.borrow_mut().iter_mut() {
                        *q = DeviceQueue {
                            size: q.size,
                            ..DeviceQueue::default()
                        };
                    }
                }
            }
            VIRTIO_PCI_QUEUE_NOTIFY => {
                let queue = value as u16;
                self.notifies.borrow_mut().push(queue);
                if queue == VIRTIO_CTRL_QUEUE {
                    self.serve_ctrl();
                }
            }
            _ => return Err(injected_error()),
        }
        Ok(())
    }
}
