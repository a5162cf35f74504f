//! CC1101 register tables for the two oscillator frequencies the radio
//! module ships with (spec.md §6), transcribed from
//! `original_source/src/PhysicalInterfaces/TICC1100.cpp::setConfig`.
//!
//! Each entry is `(register_address, value)`, address 0x00-0x28.

pub const REGISTERS_26MHZ: &[(u8, u8)] = &[
    (0x00, 0x5B), // IOCFG2
    (0x01, 0x2E), // IOCFG1
    (0x02, 0x5B), // IOCFG0
    (0x03, 0x07), // FIFOTHR
    (0x04, 0xE9), // SYNC1
    (0x05, 0xCA), // SYNC0
    (0x06, 0xFF), // PKTLEN
    (0x07, 0x0C), // PKTCTRL1
    (0x08, 0x45), // PKTCTRL0
    (0x09, 0x00), // ADDR
    (0x0A, 0x00), // CHANNR
    (0x0B, 0x06), // FSCTRL1
    (0x0C, 0x00), // FSCTRL0
    (0x0D, 0x21), // FREQ2
    (0x0E, 0x65), // FREQ1
    (0x0F, 0x6A), // FREQ0
    (0x10, 0xC8), // MDMCFG4
    (0x11, 0x93), // MDMCFG3
    (0x12, 0x03), // MDMCFG2
    (0x13, 0x22), // MDMCFG1
    (0x14, 0xF8), // MDMCFG0
    (0x15, 0x34), // DEVIATN
    (0x16, 0x07), // MCSM2
    (0x17, 0x30), // MCSM1
    (0x18, 0x18), // MCSM0
    (0x19, 0x16), // FOCCFG
    (0x1A, 0x6C), // BSCFG
    (0x1B, 0x03), // AGCCTRL2
    (0x1C, 0x40), // AGCCTRL1
    (0x1D, 0x91), // AGCCTRL0
    (0x1E, 0x87), // WOREVT1
    (0x1F, 0x6B), // WOREVT0
    (0x20, 0xF8), // WORCTRL
    (0x21, 0x56), // FREND1
    (0x22, 0x10), // FREND0
    (0x23, 0xE9), // FSCAL3
    (0x24, 0x2A), // FSCAL2
    (0x25, 0x00), // FSCAL1
    (0x26, 0x1F), // FSCAL0
    (0x27, 0x41), // RCCTRL1
    (0x28, 0x00), // RCCTRL0
];

pub const REGISTERS_27MHZ: &[(u8, u8)] = &[
    (0x00, 0x5B), // IOCFG2
    (0x01, 0x2E), // IOCFG1
    (0x02, 0x5B), // IOCFG0
    (0x03, 0x07), // FIFOTHR
    (0x04, 0xE9), // SYNC1
    (0x05, 0xCA), // SYNC0
    (0x06, 0xFF), // PKTLEN
    (0x07, 0x0C), // PKTCTRL1
    (0x08, 0x45), // PKTCTRL0
    (0x09, 0x00), // ADDR
    (0x0A, 0x00), // CHANNR
    (0x0B, 0x06), // FSCTRL1
    (0x0C, 0x00), // FSCTRL0
    (0x0D, 0x20), // FREQ2
    (0x0E, 0x28), // FREQ1
    (0x0F, 0xC5), // FREQ0
    (0x10, 0xC8), // MDMCFG4
    (0x11, 0x84), // MDMCFG3
    (0x12, 0x03), // MDMCFG2
    (0x13, 0x22), // MDMCFG1
    (0x14, 0xE5), // MDMCFG0
    (0x15, 0x34), // DEVIATN
    (0x16, 0x07), // MCSM2
    (0x17, 0x30), // MCSM1
    (0x18, 0x18), // MCSM0
    (0x19, 0x16), // FOCCFG
    (0x1A, 0x6C), // BSCFG
    (0x1B, 0x03), // AGCCTRL2
    (0x1C, 0x40), // AGCCTRL1
    (0x1D, 0x91), // AGCCTRL0
    (0x1E, 0x87), // WOREVT1
    (0x1F, 0x6B), // WOREVT0
    (0x20, 0xF8), // WORCTRL
    (0x21, 0x56), // FREND1
    (0x22, 0x10), // FREND0
    (0x23, 0xE9), // FSCAL3
    (0x24, 0x2A), // FSCAL2
    (0x25, 0x00), // FSCAL1
    (0x26, 0x1F), // FSCAL0
    (0x27, 0x41), // RCCTRL1
    (0x28, 0x00), // RCCTRL0
];

/// Command strobes relevant to the transport layer (others exist on the
/// real chip but are never issued outside `TICC1100.cpp` internals).
pub mod strobe {
    pub const SRES: u8 = 0x30;
    pub const SIDLE: u8 = 0x36;
    pub const SFRX: u8 = 0x3A;
    pub const SFTX: u8 = 0x3B;
    pub const SNOP: u8 = 0x3D;
    pub const SRX: u8 = 0x34;
    pub const STX: u8 = 0x35;
}

/// TX/RX FIFO burst-access command bytes (`TICC1100.cpp::sendPacket` /
/// `readFifo`). The FIFO shares address 0x3F; direction is the R/W bit.
pub mod fifo {
    pub const TX_BURST: u8 = 0x7F;
    pub const RX_BURST: u8 = 0xFF;
}

/// `CHIP_RDYn`: bit 7 of every status byte the chip returns on SPI.
/// Clear once the chip has settled into the state just strobed for.
pub const CHIP_RDYN: u8 = 0x80;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_tables_cover_every_register_address() {
        for table in [REGISTERS_26MHZ, REGISTERS_27MHZ] {
            assert_eq!(table.len(), 0x29);
            for (i, (addr, _)) in table.iter().enumerate() {
                assert_eq!(*addr, i as u8);
            }
        }
    }

    #[test]
    fn oscillator_specific_registers_differ() {
        let freq2_26 = REGISTERS_26MHZ[0x0D].1;
        let freq2_27 = REGISTERS_27MHZ[0x0D].1;
        assert_ne!(freq2_26, freq2_27);
    }
}
