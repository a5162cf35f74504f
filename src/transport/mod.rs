//! Physical-interface abstraction (spec.md §4.A), grounded in
//! `original_source/src/PhysicalInterfaces/{Cul.cpp, COC.cpp, TICC1100.cpp}`.
//!
//! Every concrete transport (CUL serial, COC/CUNO serial-over-TCP, CC1101
//! SPI) implements `RadioTransport`. The engine code in this crate talks
//! only to the trait, never to a concrete transport, so new interfaces can
//! be added without touching queue/peer/AES logic.

pub mod cc1101;
pub mod coc;
pub mod cul;

use std::collections::HashSet;

use crate::error::TransportError;
use crate::packet::Packet;
use crate::peer::PeerInfo;

/// A received frame together with the interface it arrived on, handed to
/// the engine's dispatch loop.
#[derive(Debug, Clone)]
pub struct Reception {
    pub interface_id: String,
    pub packet: Packet,
}

/// Capability flags a transport advertises, because not every interface
/// can do everything a CC1101 can (spec.md §4.A Non-goals, §9).
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub aes_supported: bool,
    /// The interface retries on its own firmware/hardware instead of
    /// relying on the queue's resend logic (CUL's `Ar\n` auto-ACK wait).
    pub auto_resend: bool,
    /// The interface needs to be told about peers explicitly (CC1101's
    /// filter table) rather than accepting any address.
    pub needs_peers: bool,
}

/// Common behaviour every physical interface exposes to the engine.
pub trait RadioTransport: Send + Sync {
    fn id(&self) -> &str;
    fn capabilities(&self) -> Capabilities;

    fn start_listening(&self) -> Result<(), TransportError>;
    fn stop_listening(&self) -> Result<(), TransportError>;
    fn is_open(&self) -> bool;

    /// Send `packet`, waiting up to `wait_for_response` for an ACK when
    /// the transport does its own retry (spec.md §4.A).
    fn send_packet(&self, packet: &Packet, wait_for_response: bool) -> Result<(), TransportError>;

    /// Pull any frames received since the last call (non-blocking). The
    /// transport's own receive thread is responsible for buffering them.
    fn poll_receptions(&self) -> Vec<Reception>;

    /// Switch to the 100 kBaud firmware-update channel. While enabled,
    /// `send_packet` must silently drop any packet not addressed to
    /// `target_address` (spec.md §4.A, §8 scenario 6).
    fn enable_update_mode(&self, target_address: u32) -> Result<(), TransportError>;
    fn disable_update_mode(&self) -> Result<(), TransportError>;

    fn add_peer(&self, info: PeerInfo);
    fn remove_peer(&self, address: u32);
    fn set_wake_up(&self, address: u32, wake_up: bool);
    fn set_aes_channels(&self, address: u32, channels: HashSet<u8>);
}

/// Parse one ASCII CUL/COC response line into a `Reception`, shared by
/// the two serial transports (`A<hex><rssi-byte>` framing, spec.md §4.A,
/// §6). `interface_id` is attached to the result for roaming decisions.
pub(crate) fn parse_ascii_frame(interface_id: &str, line: &str, timestamp: i64) -> Option<Reception> {
    let hex = line.strip_prefix('A')?;
    let packet = Packet::from_hex(hex, timestamp).ok()?;
    Some(Reception {
        interface_id: interface_id.to_string(),
        packet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_leading_a_hex_line() {
        let p = Packet::new(0xA0, 0, 0x01, 0x000200, 0x010203, vec![]);
        let line = format!("A{}", p.hex_string());
        let r = parse_ascii_frame("CUL1", &line, 1000).unwrap();
        assert_eq!(r.interface_id, "CUL1");
        assert_eq!(r.packet.message_counter, 0xA0);
    }

    #[test]
    fn non_a_prefixed_line_is_ignored() {
        assert!(parse_ascii_frame("CUL1", "LOVF", 1000).is_none());
    }
}
