//! Advanced receive and transmit descriptors of the 82599.
//!
//! Both formats are 16 bytes. Software fills in the "read" format; the NIC
//! overwrites the same memory with the "write-back" format once it is done
//! with a descriptor, which is how completion is signalled.
//!
//! Datasheet sections 7.1.6 (receive) and 7.2.3.2.4 (transmit).

use bit_field::BitField;
use volatile::Volatile;

use crate::memory::PhysAddr;
use crate::ring::HwDescriptor;

/// Descriptor done: the NIC has finished with this receive descriptor.
pub const RX_STATUS_DD: u32 = 1 << 0;
/// End of packet: the last descriptor of a packet.
pub const RX_STATUS_EOP: u32 = 1 << 1;

/// End of packet.
pub const TX_CMD_EOP: u8 = 1 << 0;
/// Insert FCS.
pub const TX_CMD_IFCS: u8 = 1 << 1;
/// Report status: write back DD once the descriptor is processed.
pub const TX_CMD_RS: u8 = 1 << 3;
/// Descriptor extension: advanced format.
pub const TX_CMD_DEXT: u8 = 1 << 5;
/// Advanced data descriptor type.
pub const TX_DTYP_ADV: u8 = 0x3 << 4;
/// Shift of PAYLEN inside the upper descriptor dword.
pub const TX_PAYLEN_SHIFT: u32 = 46 - 32;
/// Descriptor done: the NIC has transmitted this descriptor.
pub const TX_STATUS_DD: u32 = 1 << 0;

/// Advanced receive descriptor.
///
/// Read format: packet buffer address, header buffer address.
/// Write-back format: RSS type and packet type in the low qword, status,
/// errors and length in the high qword.
#[repr(C)]
pub struct AdvancedRxDescriptor {
    /// Packet buffer address (read) / RSS and packet type (write-back).
    pub packet_buffer_address: Volatile<u64>,
    /// Header buffer address (read) / status, error and length (write-back).
    pub header_buffer_address: Volatile<u64>,
}

impl AdvancedRxDescriptor {
    /// Zeroes the descriptor.
    pub fn init(&mut self) {
        self.packet_buffer_address.write(0);
        self.header_buffer_address.write(0);
    }

    /// Points the descriptor at a packet buffer.
    pub fn set_packet_address(&mut self, packet_buffer_address: u64) {
        self.packet_buffer_address.write(packet_buffer_address);
    }

    /// Clears the write-back status so the descriptor reads as not done.
    pub fn reset_status(&mut self) {
        self.header_buffer_address.write(0);
    }

    fn status(&self) -> u32 {
        self.header_buffer_address.read().get_bits(0..20) as u32
    }

    /// Returns true once the NIC has written a packet into this descriptor.
    pub fn descriptor_done(&self) -> bool {
        self.status() & RX_STATUS_DD != 0
    }

    /// Returns true if this descriptor holds the last part of a packet.
    pub fn end_of_packet(&self) -> bool {
        self.status() & RX_STATUS_EOP != 0
    }

    /// Returns the packet length written back by the NIC.
    pub fn length(&self) -> u64 {
        self.header_buffer_address.read().get_bits(32..48)
    }

    /// Returns the packet length written back by the NIC.
    pub fn get_pkt_len(&self) -> u64 {
        self.length()
    }

    /// Returns the RSS type of the received packet.
    pub fn get_rss_type(&self) -> u64 {
        self.packet_buffer_address.read().get_bits(0..4)
    }

    /// Returns the packet type of the received packet.
    pub fn get_packet_type(&self) -> u64 {
        self.packet_buffer_address.read().get_bits(4..16)
    }
}

impl HwDescriptor for AdvancedRxDescriptor {
    fn completed(&self) -> bool {
        self.descriptor_done()
    }

    fn post(&mut self, phys: PhysAddr, _len: usize) {
        self.set_packet_address(phys as u64);
        self.reset_status();
    }
}

/// Advanced transmit data descriptor.
#[repr(C)]
pub struct AdvancedTxDescriptor {
    /// Packet buffer address.
    pub packet_buffer_address: Volatile<u64>,
    /// Length of the data buffer.
    pub data_len: Volatile<u16>,
    /// Descriptor type and MAC fields.
    pub dtyp_mac_rsv: Volatile<u8>,
    /// Command bits.
    pub dcmd: Volatile<u8>,
    /// Payload length, options, context index and status (write-back).
    pub paylen_popts_cc_idx_sta: Volatile<u32>,
}

impl AdvancedTxDescriptor {
    /// Zeroes the descriptor.
    pub fn init(&mut self) {
        self.packet_buffer_address.write(0);
        self.data_len.write(0);
        self.dtyp_mac_rsv.write(0);
        self.dcmd.write(0);
        self.paylen_popts_cc_idx_sta.write(0);
    }

    /// Fills the descriptor for transmitting one single-buffer packet.
    pub fn send(&mut self, packet_buffer_address: u64, data_len: u16) {
        self.packet_buffer_address.write(packet_buffer_address);
        self.data_len.write(data_len);
        self.dtyp_mac_rsv.write(TX_DTYP_ADV);
        self.paylen_popts_cc_idx_sta
            .write((data_len as u32) << TX_PAYLEN_SHIFT);
        self.dcmd
            .write(TX_CMD_DEXT | TX_CMD_RS | TX_CMD_IFCS | TX_CMD_EOP);
    }

    /// Returns true once the NIC has transmitted this descriptor.
    pub fn transmitted(&self) -> bool {
        self.paylen_popts_cc_idx_sta.read() & TX_STATUS_DD != 0
    }
}

impl HwDescriptor for AdvancedTxDescriptor {
    fn completed(&self) -> bool {
        self.transmitted()
    }

    fn post(&mut self, phys: PhysAddr, len: usize) {
        self.send(phys as u64, len as u16);
    }
}
