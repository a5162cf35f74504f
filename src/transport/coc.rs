//! COC/CUNO coprocessor, reached over a TCP socket using the same ASCII
//! framing as CUL (spec.md §4.A), grounded in
//! `original_source/src/PhysicalInterfaces/{COC.cpp, CUNO.h}`.
//!
//! Unlike CUL, COC/CUNO do the AES challenge/response dance themselves
//! (`_aesHandshake` in the original); this transport owns an
//! `AesHandshake` and drives it from the dispatch loop in
//! `handle_reception`, rather than leaving AES framing to the caller.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use parking_lot::Mutex;

use crate::aes_handshake::AesHandshake;
use crate::error::TransportError;
use crate::packet::{control, message_type, Packet};
use crate::peer::PeerInfo;

use super::{Capabilities, RadioTransport, Reception};

pub struct CocConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub my_address: u32,
    pub current_key: [u8; 16],
    pub old_key: [u8; 16],
    pub key_index: u8,
}

struct Inner {
    socket: Option<TcpStream>,
    peers: HashMap<u32, PeerInfo>,
    /// Outstanding non-AES queue ids per destination, so an AES c-frame
    /// that interrupts a plain send can cancel everything already queued
    /// for that address (`COC.cpp`'s `_queueIds`/`removeQueueEntry`).
    queue_ids: HashMap<u32, BTreeSet<u64>>,
    aes: AesHandshake,
    update_target: Option<u32>,
}

pub struct Coc {
    config: CocConfig,
    inner: Mutex<Inner>,
    received: Mutex<Vec<Reception>>,
}

impl Coc {
    pub fn new(config: CocConfig) -> Self {
        let aes = AesHandshake::new(config.my_address, config.current_key, config.old_key, config.key_index);
        Coc {
            config,
            inner: Mutex::new(Inner {
                socket: None,
                peers: HashMap::new(),
                queue_ids: HashMap::new(),
                aes,
                update_target: None,
            }),
            received: Mutex::new(Vec::new()),
        }
    }

    /// Register a queue id as outstanding for `address`, so it can be
    /// cancelled if an AES handshake preempts it.
    pub fn track_queue_id(&self, address: u32, queue_id: u64) {
        self.inner.lock().queue_ids.entry(address).or_default().insert(queue_id);
    }

    fn write_line(&self, line: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        let socket = inner.socket.as_mut().ok_or(TransportError::NotOpen)?;
        socket.write_all(line.as_bytes()).map_err(TransportError::Io)
    }

    /// AES channel decision for an incoming frame (spec.md §4.B), mirrors
    /// `COC.cpp`'s channel-mask lookup: a one-byte payload whose low six
    /// bits are a registered AES channel for this peer, or any frame at
    /// all when channel 0 is registered, triggers a challenge.
    fn requires_aes_challenge(peer: &PeerInfo, packet: &Packet) -> bool {
        if peer.aes_channels.is_empty() {
            return false;
        }
        let is_config_like = (packet.message_type & 0xF0) == 0x40;
        match packet.payload.first() {
            Some(first) if is_config_like && peer.aes_channels.contains(&(first & 0x3F)) => true,
            Some(_) if packet.payload.len() >= 2 && peer.aes_channels.contains(&(packet.payload[1] & 0x3F)) => true,
            _ => peer.aes_channels.contains(&0),
        }
    }

    /// Dispatch one received frame through the AES state machine,
    /// returning any frames that must be sent back out and the final
    /// payload frame to raise to the engine once authenticated (if any).
    ///
    /// This is the direct analogue of the big `if`/`else if` chain in
    /// `COC.cpp`'s `processPacket`.
    pub fn handle_reception(&self, packet: &Packet) -> (Vec<Packet>, Option<Packet>) {
        let mut inner = self.inner.lock();
        let peer = match inner.peers.get(&packet.sender_address).cloned() {
            Some(p) => p,
            None => return (Vec::new(), None),
        };

        if packet.message_type == message_type::AES_CHALLENGE {
            match inner.aes.get_r_frame(packet, peer.key_index) {
                Ok((r_frame, _m_frame)) => return (vec![r_frame], None),
                Err(err) => {
                    log::error!("AES handshake failed for 0x{:06x}: {err}", packet.sender_address);
                    return (Vec::new(), None);
                }
            }
        }

        if packet.message_type == message_type::ACK && packet.payload.len() == 8 && packet.payload.first() == Some(&0x04) {
            let key_index = packet.payload.last().copied().unwrap_or(0) / 2;
            match inner.aes.get_a_frame(packet, key_index, peer.wake_up) {
                Ok((a_frame, m_frame)) => {
                    // A plain (non-AES) send for this address that was
                    // queued just before the handshake started is stale;
                    // cancel it and reschedule the authenticated m-frame.
                    let mut requeue = Vec::new();
                    if let Some(ids) = inner.queue_ids.remove(&packet.sender_address) {
                        if !ids.is_empty() {
                            requeue.push(reschedule(&m_frame, 600));
                            requeue.push(reschedule(&m_frame, 1200));
                        }
                    }
                    let mut out = vec![a_frame];
                    out.extend(requeue);
                    return (out, Some(m_frame));
                }
                Err(err) => {
                    log::error!("AES handshake failed for 0x{:06x}: {err}", packet.sender_address);
                    return (Vec::new(), None);
                }
            }
        }

        if inner.aes.handshake_started(packet.sender_address) && !inner.aes.check_a_frame(packet) {
            log::warn!("discarding frame from 0x{:06x}: handshake in progress", packet.sender_address);
            return (Vec::new(), None);
        }

        if Self::requires_aes_challenge(&peer, packet) {
            inner.aes.set_m_frame(packet.clone());
            let c_frame = inner.aes.get_c_frame(packet);
            return (vec![c_frame], None);
        }

        (Vec::new(), Some(packet.clone()))
    }
}

fn reschedule(packet: &Packet, delay_ms: i64) -> Packet {
    let mut p = packet.clone();
    p.timestamp += delay_ms;
    p
}

impl RadioTransport for Coc {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            aes_supported: true,
            auto_resend: false,
            needs_peers: true,
        }
    }

    fn start_listening(&self) -> Result<(), TransportError> {
        let socket = TcpStream::connect((self.config.host.as_str(), self.config.port)).map_err(TransportError::Io)?;
        socket.set_read_timeout(Some(Duration::from_millis(500))).map_err(TransportError::Io)?;
        self.inner.lock().socket = Some(socket);
        Ok(())
    }

    fn stop_listening(&self) -> Result<(), TransportError> {
        self.inner.lock().socket = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.lock().socket.is_some()
    }

    fn send_packet(&self, packet: &Packet, _wait_for_response: bool) -> Result<(), TransportError> {
        if packet.wire_len() > crate::packet::MAX_PAYLOAD_LEN + 10 {
            return Err(TransportError::FrameTooLarge(packet.wire_len()));
        }
        if let Some(target) = self.inner.lock().update_target {
            if target != packet.destination_address {
                log::info!(
                    "{}: dropping packet to 0x{:06x} while update mode targets 0x{:06x}",
                    self.config.id,
                    packet.destination_address,
                    target
                );
                return Ok(());
            }
        }
        self.write_line(&format!("As{}\n", packet.hex_string()))
    }

    fn poll_receptions(&self) -> Vec<Reception> {
        let interface_id = self.config.id.clone();
        let mut inner = self.inner.lock();
        let Some(socket) = inner.socket.as_mut() else { return Vec::new() };
        let mut buf = [0u8; 256];
        let n = match socket.read(&mut buf) {
            Ok(n) if n > 0 => n,
            _ => return Vec::new(),
        };
        let text = String::from_utf8_lossy(&buf[..n]);
        drop(inner);
        text.lines()
            .filter_map(|line| super::parse_ascii_frame(&interface_id, line, crate::packet::now_ms()))
            .collect()
    }

    fn enable_update_mode(&self, target_address: u32) -> Result<(), TransportError> {
        self.inner.lock().update_target = Some(target_address);
        Ok(())
    }

    fn disable_update_mode(&self) -> Result<(), TransportError> {
        self.inner.lock().update_target = None;
        Ok(())
    }

    fn add_peer(&self, info: PeerInfo) {
        self.inner.lock().peers.insert(info.address, info);
    }

    fn remove_peer(&self, address: u32) {
        self.inner.lock().peers.remove(&address);
    }

    fn set_wake_up(&self, address: u32, wake_up: bool) {
        if let Some(info) = self.inner.lock().peers.get_mut(&address) {
            info.wake_up = wake_up;
        }
    }

    fn set_aes_channels(&self, address: u32, channels: HashSet<u8>) {
        if let Some(info) = self.inner.lock().peers.get_mut(&address) {
            info.aes_channels = channels;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coc() -> Coc {
        Coc::new(CocConfig {
            id: "COC1".into(),
            host: "127.0.0.1".into(),
            port: 0,
            my_address: 0x111111,
            current_key: [1u8; 16],
            old_key: [2u8; 16],
            key_index: 1,
        })
    }

    #[test]
    fn plain_frame_without_aes_channel_is_raised_directly() {
        let coc = coc();
        coc.add_peer(PeerInfo {
            address: 0x222222,
            key_index: 1,
            wake_up: false,
            aes_channels: HashSet::new(),
        });
        let packet = Packet::new(1, control::ACK_REQ, 0x11, 0x222222, 0x111111, vec![1, 2]);
        let (out, raised) = coc.handle_reception(&packet);
        assert!(out.is_empty());
        assert_eq!(raised.unwrap(), packet);
    }

    #[test]
    fn aes_channel_0_triggers_challenge_for_any_frame() {
        let coc = coc();
        let mut channels = HashSet::new();
        channels.insert(0);
        coc.add_peer(PeerInfo {
            address: 0x222222,
            key_index: 1,
            wake_up: false,
            aes_channels: channels,
        });
        let packet = Packet::new(1, control::ACK_REQ, 0x11, 0x222222, 0x111111, vec![1, 2]);
        let (out, raised) = coc.handle_reception(&packet);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message_type, message_type::AES_CHALLENGE);
        assert!(raised.is_none());
    }

    #[test]
    fn unknown_peer_is_ignored() {
        let coc = coc();
        let packet = Packet::new(1, 0, 0x11, 0xDEAD, 0x111111, vec![]);
        let (out, raised) = coc.handle_reception(&packet);
        assert!(out.is_empty() && raised.is_none());
    }

    #[test]
    fn update_mode_drops_packets_not_addressed_to_the_target() {
        let coc = coc();
        coc.enable_update_mode(0xAAAAAA).unwrap();
        let other = Packet::new(1, 0, 0x11, 0x111111, 0xBBBBBB, vec![]);
        // Not connected, so a real write would fail with NotOpen; the
        // gate must short-circuit before that.
        assert!(coc.send_packet(&other, false).is_ok());
    }

    #[test]
    fn disable_update_mode_clears_the_target() {
        let coc = coc();
        coc.enable_update_mode(0xAAAAAA).unwrap();
        coc.disable_update_mode().unwrap();
        assert!(coc.inner.lock().update_target.is_none());
    }
}
