//! Register maps of the supported NICs.
//!
//! Intel 82599 offsets and bit definitions follow the 82599 datasheet and the
//! names used by the Linux `ixgbe_type.h`. The VirtIO part is the legacy PCI
//! transport of `virtio_pci.h` and `virtio_net.h`.

#![allow(missing_docs)]

// ---- Intel 82599 (BAR0) ----

pub const IXGBE_CTRL: u32 = 0x00000;
pub const IXGBE_STATUS: u32 = 0x00008;
pub const IXGBE_CTRL_EXT: u32 = 0x00018;
pub const IXGBE_EIMC: u32 = 0x00888;
pub const IXGBE_EEC: u32 = 0x10010;

pub const IXGBE_CTRL_LNK_RST: u32 = 0x0000_0008;
pub const IXGBE_CTRL_RST: u32 = 0x0400_0000;
pub const IXGBE_CTRL_RST_MASK: u32 = IXGBE_CTRL_LNK_RST | IXGBE_CTRL_RST;

pub const IXGBE_CTRL_EXT_NS_DIS: u32 = 0x0001_0000;

pub const IXGBE_IRQ_CLEAR_MASK: u32 = 0x7FFF_FFFF;

pub const IXGBE_EEC_ARD: u32 = 0x0000_0200;

pub const IXGBE_RDRXCTL: u32 = 0x02F00;
pub const IXGBE_RDRXCTL_CRCSTRIP: u32 = 0x0000_0001;
pub const IXGBE_RDRXCTL_DMAIDONE: u32 = 0x0000_0008;

pub const IXGBE_AUTOC: u32 = 0x042A0;
pub const IXGBE_AUTOC_LMS_SHIFT: u32 = 13;
pub const IXGBE_AUTOC_LMS_MASK: u32 = 0x7 << IXGBE_AUTOC_LMS_SHIFT;
pub const IXGBE_AUTOC_LMS_10G_SERIAL: u32 = 0x3 << IXGBE_AUTOC_LMS_SHIFT;
pub const IXGBE_AUTOC_10G_PMA_PMD_MASK: u32 = 0x0000_0180;
pub const IXGBE_AUTOC_10G_XAUI: u32 = 0x0 << 7;
pub const IXGBE_AUTOC_AN_RESTART: u32 = 0x0000_1000;

pub const IXGBE_LINKS: u32 = 0x042A4;
pub const IXGBE_LINKS_UP: u32 = 0x4000_0000;
pub const IXGBE_LINKS_SPEED_82599: u32 = 0x3000_0000;
pub const IXGBE_LINKS_SPEED_100_82599: u32 = 0x1000_0000;
pub const IXGBE_LINKS_SPEED_1G_82599: u32 = 0x2000_0000;
pub const IXGBE_LINKS_SPEED_10G_82599: u32 = 0x3000_0000;

pub const IXGBE_RAL0: u32 = 0x0A200;
pub const IXGBE_RAH0: u32 = 0x0A204;

pub const IXGBE_RXCTRL: u32 = 0x03000;
pub const IXGBE_RXCTRL_RXEN: u32 = 0x0000_0001;

pub const IXGBE_RXPBSIZE_128KB: u32 = 0x0002_0000;
pub const IXGBE_TXPBSIZE_40KB: u32 = 0x0000_A000;

pub const IXGBE_HLREG0: u32 = 0x04240;
pub const IXGBE_HLREG0_TXCRCEN: u32 = 0x0000_0001;
pub const IXGBE_HLREG0_RXCRCSTRP: u32 = 0x0000_0002;
pub const IXGBE_HLREG0_TXPADEN: u32 = 0x0000_0400;

pub const IXGBE_FCTRL: u32 = 0x05080;
pub const IXGBE_FCTRL_MPE: u32 = 0x0000_0100;
pub const IXGBE_FCTRL_UPE: u32 = 0x0000_0200;
pub const IXGBE_FCTRL_BAM: u32 = 0x0000_0400;

pub const IXGBE_SRRCTL_DESCTYPE_MASK: u32 = 0x0E00_0000;
pub const IXGBE_SRRCTL_DESCTYPE_ADV_ONEBUF: u32 = 0x0200_0000;
pub const IXGBE_SRRCTL_DROP_EN: u32 = 0x1000_0000;

pub const IXGBE_RXDCTL_ENABLE: u32 = 0x0200_0000;
pub const IXGBE_TXDCTL_ENABLE: u32 = 0x0200_0000;

pub const IXGBE_DTXMXSZRQ: u32 = 0x08100;
pub const IXGBE_RTTDCS: u32 = 0x04900;
pub const IXGBE_RTTDCS_ARBDIS: u32 = 0x0000_0040;
pub const IXGBE_DMATXCTL: u32 = 0x04A80;
pub const IXGBE_DMATXCTL_TE: u32 = 0x1;

// statistics, all clear on read
pub const IXGBE_GPRC: u32 = 0x04074;
pub const IXGBE_GPTC: u32 = 0x04080;
pub const IXGBE_GORCL: u32 = 0x04088;
pub const IXGBE_GORCH: u32 = 0x0408C;
pub const IXGBE_GOTCL: u32 = 0x04090;
pub const IXGBE_GOTCH: u32 = 0x04094;

/// Number of packet buffers of the receive and transmit data paths.
pub const IXGBE_PACKET_BUFFERS: u32 = 8;

pub const fn ixgbe_rdbal(i: u32) -> u32 {
    if i < 64 {
        0x01000 + i * 0x40
    } else {
        0x0D000 + (i - 64) * 0x40
    }
}

pub const fn ixgbe_rdbah(i: u32) -> u32 {
    ixgbe_rdbal(i) + 0x04
}

pub const fn ixgbe_rdlen(i: u32) -> u32 {
    ixgbe_rdbal(i) + 0x08
}

pub const fn ixgbe_rdh(i: u32) -> u32 {
    ixgbe_rdbal(i) + 0x10
}

pub const fn ixgbe_rdt(i: u32) -> u32 {
    ixgbe_rdbal(i) + 0x18
}

pub const fn ixgbe_rxdctl(i: u32) -> u32 {
    ixgbe_rdbal(i) + 0x28
}

pub const fn ixgbe_srrctl(i: u32) -> u32 {
    if i <= 15 {
        0x02100 + i * 4
    } else {
        ixgbe_rdbal(i) + 0x14
    }
}

pub const fn ixgbe_dca_rxctrl(i: u32) -> u32 {
    if i <= 15 {
        0x02200 + i * 4
    } else {
        ixgbe_rdbal(i) + 0x0C
    }
}

pub const fn ixgbe_rxpbsize(i: u32) -> u32 {
    0x03C00 + i * 4
}

pub const fn ixgbe_txpbsize(i: u32) -> u32 {
    0x0CC00 + i * 4
}

pub const fn ixgbe_tdbal(i: u32) -> u32 {
    0x06000 + i * 0x40
}

pub const fn ixgbe_tdbah(i: u32) -> u32 {
    ixgbe_tdbal(i) + 0x04
}

pub const fn ixgbe_tdlen(i: u32) -> u32 {
    ixgbe_tdbal(i) + 0x08
}

pub const fn ixgbe_tdh(i: u32) -> u32 {
    ixgbe_tdbal(i) + 0x10
}

pub const fn ixgbe_tdt(i: u32) -> u32 {
    ixgbe_tdbal(i) + 0x18
}

pub const fn ixgbe_txdctl(i: u32) -> u32 {
    ixgbe_tdbal(i) + 0x28
}

// ---- VirtIO legacy PCI transport (BAR0) ----

pub const VIRTIO_PCI_HOST_FEATURES: u32 = 0;
pub const VIRTIO_PCI_GUEST_FEATURES: u32 = 4;
pub const VIRTIO_PCI_QUEUE_PFN: u32 = 8;
pub const VIRTIO_PCI_QUEUE_NUM: u32 = 12;
pub const VIRTIO_PCI_QUEUE_SEL: u32 = 14;
pub const VIRTIO_PCI_QUEUE_NOTIFY: u32 = 16;
pub const VIRTIO_PCI_STATUS: u32 = 18;
pub const VIRTIO_PCI_ISR: u32 = 19;
/// Start of the device specific configuration (no MSI-X).
pub const VIRTIO_PCI_CONFIG: u32 = 20;

/// Queue PFNs are given in units of this shift.
pub const VIRTIO_PCI_QUEUE_ADDR_SHIFT: u32 = 12;

// device status
pub const VIRTIO_CONFIG_STATUS_RESET: u8 = 0x00;
pub const VIRTIO_CONFIG_STATUS_ACK: u8 = 0x01;
pub const VIRTIO_CONFIG_STATUS_DRIVER: u8 = 0x02;
pub const VIRTIO_CONFIG_STATUS_DRIVER_OK: u8 = 0x04;
pub const VIRTIO_CONFIG_STATUS_FAILED: u8 = 0x80;

// feature bits
pub const VIRTIO_NET_F_CSUM: u32 = 0;
pub const VIRTIO_NET_F_GUEST_CSUM: u32 = 1;
pub const VIRTIO_NET_F_MAC: u32 = 5;
pub const VIRTIO_NET_F_CTRL_VQ: u32 = 17;
pub const VIRTIO_NET_F_CTRL_RX: u32 = 18;
pub const VIRTIO_F_ANY_LAYOUT: u32 = 27;

/// Every feature the driver depends on. Partial negotiation is not attempted.
pub const REQUIRED_FEATURES: u32 = (1 << VIRTIO_NET_F_CSUM)
    | (1 << VIRTIO_NET_F_GUEST_CSUM)
    | (1 << VIRTIO_NET_F_MAC)
    | (1 << VIRTIO_NET_F_CTRL_VQ)
    | (1 << VIRTIO_NET_F_CTRL_RX)
    | (1 << VIRTIO_F_ANY_LAYOUT);

// control queue commands
pub const VIRTIO_NET_CTRL_RX: u8 = 0;
pub const VIRTIO_NET_CTRL_RX_PROMISC: u8 = 0;
pub const VIRTIO_NET_OK: u8 = 0;

/// Size of the legacy `virtio_net_hdr` (without `num_buffers`).
pub const VIRTIO_NET_HDR_LEN: usize = 10;

// queue indices
pub const VIRTIO_RX_QUEUE: u16 = 0;
pub const VIRTIO_TX_QUEUE: u16 = 1;
pub const VIRTIO_CTRL_QUEUE: u16 = 2;
