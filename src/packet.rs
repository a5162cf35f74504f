//! The BidCoS wire frame (spec.md §3, §6).
//!
//! A frame is ten or more bytes: length, message counter, control byte,
//! message type, 3-byte sender address, 3-byte destination address, and
//! up to 54 bytes of payload. `length` is the on-wire byte count minus
//! one (i.e. it does not count itself).

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum payload length (spec.md §3, §8 boundary case).
pub const MAX_PAYLOAD_LEN: usize = 54;
/// Minimum total on-wire byte count (length + counter + control + type + 3 + 3).
pub const MIN_PACKET_LEN: usize = 10;
/// Minimum hex-encoded line length serial transports will accept (spec.md §8).
pub const MIN_SERIAL_HEX_LEN: usize = 21;

/// Control-byte bit flags (spec.md §3).
pub mod control {
    pub const WAKE_ME_UP: u8 = 0x02;
    pub const CONFIG: u8 = 0x04;
    pub const BURST: u8 = 0x10;
    pub const ACK_REQ: u8 = 0x20;
    pub const RPTEN: u8 = 0x80;
}

/// Common BidCoS message types referenced by the protocol engine.
pub mod message_type {
    pub const ACK: u8 = 0x02;
    pub const AES_CHALLENGE: u8 = 0x03;
    pub const WAKE_UP: u8 = 0x12;
}

/// A parsed BidCoS frame.
///
/// `equals` (the `PartialEq` impl) intentionally ignores `timestamp` and
/// `rssi`, matching spec.md §3: two receptions of the same bytes are the
/// same packet regardless of when or how strongly they were received.
#[derive(Debug, Clone)]
pub struct Packet {
    pub message_counter: u8,
    pub control_byte: u8,
    pub message_type: u8,
    pub sender_address: u32,
    pub destination_address: u32,
    pub payload: Vec<u8>,
    /// Time the packet was received or queued for sending, in ms since epoch.
    pub timestamp: i64,
    /// Signal strength of the reception, if known.
    pub rssi: Option<i8>,
}

impl Packet {
    /// Build an outgoing packet. `timestamp` is set to "now".
    pub fn new(
        message_counter: u8,
        control_byte: u8,
        message_type: u8,
        sender_address: u32,
        destination_address: u32,
        payload: Vec<u8>,
    ) -> Self {
        Packet {
            message_counter,
            control_byte,
            message_type,
            sender_address,
            destination_address,
            payload,
            timestamp: now_ms(),
            rssi: None,
        }
    }

    /// Total on-wire byte count (not counting the ASCII framing used by
    /// serial transports): the 10-byte header (length, counter, control,
    /// type, 3-byte sender, 3-byte destination) plus the payload.
    pub fn wire_len(&self) -> usize {
        10 + self.payload.len()
    }

    /// The `length` byte: on-wire byte count minus one.
    pub fn length_byte(&self) -> u8 {
        (self.wire_len() - 1) as u8
    }

    /// Serialize to the raw byte array `[length, counter, control, type,
    /// sender(3), dest(3), payload...]`.
    pub fn byte_array(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_len());
        buf.push(self.length_byte());
        buf.push(self.message_counter);
        buf.push(self.control_byte);
        buf.push(self.message_type);
        buf.extend_from_slice(&self.sender_address.to_be_bytes()[1..]);
        buf.extend_from_slice(&self.destination_address.to_be_bytes()[1..]);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse from a raw byte array as produced by `byte_array`.
    pub fn from_byte_array(data: &[u8], timestamp: i64, rssi: Option<i8>) -> Result<Self, String> {
        if data.len() < MIN_PACKET_LEN {
            return Err(format!("packet too short: {} bytes", data.len()));
        }
        let payload_len = data.len() - 10;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(format!("payload too large: {} bytes", payload_len));
        }
        let sender = u32::from_be_bytes([0, data[4], data[5], data[6]]);
        let dest = u32::from_be_bytes([0, data[7], data[8], data[9]]);
        Ok(Packet {
            message_counter: data[1],
            control_byte: data[2],
            message_type: data[3],
            sender_address: sender,
            destination_address: dest,
            payload: data[10..].to_vec(),
            timestamp,
            rssi,
        })
    }

    /// Upper-case hex encoding of `byte_array`, as sent in `As<hex>\n`.
    pub fn hex_string(&self) -> String {
        self.byte_array().iter().map(|b| format!("{:02X}", b)).collect()
    }

    /// Parse from an ASCII hex line as received from a serial transport
    /// (without the leading `A` and trailing newline, which the caller
    /// strips).
    pub fn from_hex(hex: &str, timestamp: i64) -> Result<Self, String> {
        if hex.len() < MIN_SERIAL_HEX_LEN {
            return Err(format!("hex line too short: {} chars", hex.len()));
        }
        let mut bytes = Vec::with_capacity(hex.len() / 2);
        let mut chars = hex.chars();
        while let (Some(a), Some(b)) = (chars.next(), chars.next()) {
            let byte = u8::from_str_radix(&format!("{a}{b}"), 16)
                .map_err(|e| format!("invalid hex byte: {e}"))?;
            bytes.push(byte);
        }
        // RSSI, if present, is appended after the declared length.
        let declared_len = bytes[0] as usize + 1;
        let rssi = if bytes.len() > declared_len {
            Some(bytes[declared_len] as i8)
        } else {
            None
        };
        Self::from_byte_array(&bytes[..declared_len.min(bytes.len())], timestamp, rssi)
    }

    pub fn has_control(&self, flag: u8) -> bool {
        self.control_byte & flag != 0
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.message_counter == other.message_counter
            && self.control_byte == other.control_byte
            && self.message_type == other.message_type
            && self.sender_address == other.sender_address
            && self.destination_address == other.destination_address
            && self.payload == other.payload
    }
}
impl Eq for Packet {}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex_string())
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_byte_array() {
        let p = Packet::new(0x42, control::ACK_REQ, 0x02, 0x123456, 0xABCDEF, vec![1, 2, 3]);
        let bytes = p.byte_array();
        let p2 = Packet::from_byte_array(&bytes, p.timestamp, None).unwrap();
        assert_eq!(p, p2);
    }

    #[test]
    fn equals_ignores_timestamp_and_rssi() {
        let mut a = Packet::new(1, 0, 0x02, 1, 2, vec![0]);
        let mut b = a.clone();
        b.timestamp += 1000;
        b.rssi = Some(-70);
        assert_eq!(a, b);
        a.payload.push(9);
        assert_ne!(a, b);
    }

    #[test]
    fn length_byte_is_wire_len_minus_one() {
        let p = Packet::new(0, 0, 0, 0, 0, vec![0; 10]);
        assert_eq!(p.wire_len(), 20);
        assert_eq!(p.length_byte(), 19);
    }

    #[test]
    fn payload_boundary_54_accepted_55_rejected() {
        let ok = Packet::new(0, 0, 0, 0, 0, vec![0; MAX_PAYLOAD_LEN]);
        let bytes = ok.byte_array();
        assert!(Packet::from_byte_array(&bytes, 0, None).is_ok());

        let mut too_big = bytes.clone();
        too_big.push(0xFF);
        too_big[0] = too_big.len() as u8 - 1;
        assert!(Packet::from_byte_array(&too_big, 0, None).is_err());
    }

    #[test]
    fn hex_round_trip() {
        let p = Packet::new(7, control::BURST, 0x01, 0x1, 0x2, vec![0xAA, 0xBB]);
        let hex = p.hex_string();
        let p2 = Packet::from_hex(&hex, p.timestamp).unwrap();
        assert_eq!(p, p2);
    }

    #[test]
    fn hex_line_shorter_than_minimum_is_rejected() {
        assert!(Packet::from_hex("A0686ECDDBBBBBAC4", 0).is_err());
    }
}
