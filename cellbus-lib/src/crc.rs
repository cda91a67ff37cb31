//! CRC-16/XMODEM: polynomial 0x1021, initial value 0, no reflection.
//!
//! Every reply block and every firmware page carries this checksum as a
//! little-endian trailer. Producers and consumers must agree bit for bit.

const POLY: u16 = 0x1021;

/// Feeds one byte into a running CRC, MSB first.
pub fn xmodem_update(crc: u16, byte: u8) -> u16 {
    let mut crc = crc ^ ((byte as u16) << 8);
    for _ in 0..8 {
        crc = if crc & 0x8000 != 0 { (crc << 1) ^ POLY } else { crc << 1 };
    }
    crc
}

/// CRC over a whole buffer
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    data.iter().fold(0, |crc, &byte| xmodem_update(crc, byte))
}
