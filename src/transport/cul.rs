//! busware CUL USB stick, spoken to over a serial line with the
//! `culfw` ASCII protocol (spec.md §4.A), grounded in
//! `original_source/src/PhysicalInterfaces/Cul.cpp`.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use std::time::Duration;

use serialport::SerialPort;

use crate::error::TransportError;
use crate::packet::Packet;
use crate::peer::PeerInfo;

use super::{parse_ascii_frame, Capabilities, RadioTransport, Reception};

/// Serial lock file convention shared with other device users on the
/// host, e.g. `/var/lock/LCK..ttyUSB0` (`Cul.cpp`'s `openDevice`).
fn lock_file_path(lock_dir: &str, device_path: &str) -> String {
    let name = device_path.rsplit('/').next().unwrap_or(device_path);
    format!("{lock_dir}/LCK..{name}")
}

pub struct CulConfig {
    pub id: String,
    pub device_path: String,
    pub lock_dir: String,
    pub baud_rate: u32,
    /// The first line read after (re)opening the device is frequently a
    /// partial frame the stick was mid-way through sending; CUL's
    /// firmware has no framing recovery of its own. Dropping it resolves
    /// spec.md §9 Open Question (a).
    pub drop_first_packet: bool,
}

impl Default for CulConfig {
    fn default() -> Self {
        CulConfig {
            id: "CUL".into(),
            device_path: "/dev/ttyUSB0".into(),
            lock_dir: "/var/lock".into(),
            baud_rate: 38400,
            drop_first_packet: true,
        }
    }
}

struct Inner {
    port: Option<Box<dyn SerialPort>>,
    lock_file: Option<String>,
    first_packet: bool,
    peers: HashMap<u32, PeerInfo>,
}

/// CUL serial transport. Owns exactly one receive thread; sending writes
/// directly to the port under a mutex, matching `Cul.cpp`'s single
/// blocking write call per `sendPacket`.
pub struct Cul {
    config: CulConfig,
    inner: Mutex<Inner>,
    update_mode: AtomicBool,
    update_target: Mutex<Option<u32>>,
    open: AtomicBool,
    received: Mutex<Vec<Reception>>,
}

impl Cul {
    pub fn new(config: CulConfig) -> Self {
        Cul {
            config,
            inner: Mutex::new(Inner {
                port: None,
                lock_file: None,
                first_packet: true,
                peers: HashMap::new(),
            }),
            update_mode: AtomicBool::new(false),
            update_target: Mutex::new(None),
            open: AtomicBool::new(false),
            received: Mutex::new(Vec::new()),
        }
    }

    fn open_device(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        let lock_path = lock_file_path(&self.config.lock_dir, &self.config.device_path);
        if fs::metadata(&lock_path).is_ok() {
            // A stale lock from a crashed process is not distinguished
            // from a live one here; the operator is expected to clear it,
            // matching the original's "couldn't create lockfile" failure
            // path rather than silently stealing the device.
            return Err(TransportError::Hardware(format!("lock file exists: {lock_path}")));
        }
        fs::write(&lock_path, format!("{:>10}", std::process::id()))
            .map_err(TransportError::Io)?;

        let port = serialport::new(&self.config.device_path, self.config.baud_rate)
            .timeout(Duration::from_millis(500))
            .open()
            .map_err(|e| TransportError::Hardware(e.to_string()))?;

        inner.port = Some(port);
        inner.lock_file = Some(lock_path);
        inner.first_packet = self.config.drop_first_packet;
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn close_device(&self) {
        let mut inner = self.inner.lock();
        inner.port = None;
        if let Some(lock_path) = inner.lock_file.take() {
            let _ = fs::remove_file(lock_path);
        }
        self.open.store(false, Ordering::Release);
    }

    fn write_line(&self, line: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        let port = inner.port.as_mut().ok_or(TransportError::NotOpen)?;
        port.write_all(line.as_bytes()).map_err(TransportError::Io)?;
        Ok(())
    }

    /// Drain one line from the port into `received`, if any is ready.
    /// Real usage runs this in a dedicated receive thread; exposed here
    /// so tests can drive it deterministically.
    fn read_line_into_buffer(&self) {
        let interface_id = self.config.id.clone();
        let mut inner = self.inner.lock();
        let Some(port) = inner.port.as_mut() else { return };
        let mut reader = BufReader::new(port);
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            return;
        }
        let line = line.trim_end();
        if line == "LOVF" {
            log::warn!("{interface_id}: send queue overflow reported by firmware");
            return;
        }
        if inner.first_packet {
            inner.first_packet = false;
            return;
        }
        if let Some(reception) = parse_ascii_frame(&interface_id, line, crate::packet::now_ms()) {
            drop(inner);
            self.received.lock().push(reception);
        }
    }
}

impl RadioTransport for Cul {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            aes_supported: true,
            auto_resend: true,
            needs_peers: false,
        }
    }

    fn start_listening(&self) -> Result<(), TransportError> {
        self.open_device()?;
        self.write_line("X21\nAr\n")?;
        std::thread::sleep(Duration::from_millis(400));
        Ok(())
    }

    fn stop_listening(&self) -> Result<(), TransportError> {
        self.write_line("Ax\nX00\n")?;
        std::thread::sleep(Duration::from_millis(1000));
        self.close_device();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send_packet(&self, packet: &Packet, _wait_for_response: bool) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        if packet.wire_len() > crate::packet::MAX_PAYLOAD_LEN + 10 {
            return Err(TransportError::FrameTooLarge(packet.wire_len()));
        }
        if self.update_mode.load(Ordering::Acquire) {
            let target = *self.update_target.lock();
            if target != Some(packet.destination_address) {
                log::info!(
                    "{}: dropping packet to 0x{:06x} while update mode targets {:?}",
                    self.config.id,
                    packet.destination_address,
                    target
                );
                return Ok(());
            }
            return self.write_line(&format!("As{}\n", packet.hex_string()));
        }
        let line = format!("As{}\nAr\n", packet.hex_string());
        self.write_line(&line)
    }

    fn poll_receptions(&self) -> Vec<Reception> {
        self.read_line_into_buffer();
        std::mem::take(&mut self.received.lock())
    }

    fn enable_update_mode(&self, target_address: u32) -> Result<(), TransportError> {
        self.update_mode.store(true, Ordering::Release);
        *self.update_target.lock() = Some(target_address);
        self.write_line("AR\n")
    }

    fn disable_update_mode(&self) -> Result<(), TransportError> {
        self.update_mode.store(false, Ordering::Release);
        *self.update_target.lock() = None;
        self.stop_listening()?;
        std::thread::sleep(Duration::from_secs(2));
        self.start_listening()
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

    #[test]
    fn lock_file_path_uses_device_basename() {
        assert_eq!(lock_file_path("/var/lock", "/dev/ttyUSB0"), "/var/lock/LCK..ttyUSB0");
    }

    #[test]
    fn closed_transport_rejects_send() {
        let cul = Cul::new(CulConfig::default());
        let packet = Packet::new(0, 0, 0x02, 1, 2, vec![]);
        assert!(matches!(cul.send_packet(&packet, false), Err(TransportError::NotOpen)));
    }

    #[test]
    fn oversized_payload_is_rejected_even_if_open() {
        let cul = Cul::new(CulConfig::default());
        cul.open.store(true, Ordering::Release);
        let packet = Packet::new(0, 0, 0x02, 1, 2, vec![0u8; crate::packet::MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(cul.send_packet(&packet, false), Err(TransportError::FrameTooLarge(_))));
    }

    #[test]
    fn update_mode_silently_drops_packets_to_other_destinations() {
        let cul = Cul::new(CulConfig::default());
        cul.open.store(true, Ordering::Release);
        cul.update_mode.store(true, Ordering::Release);
        *cul.update_target.lock() = Some(0xAAAAAA);

        let other = Packet::new(0, 0, 0x02, 1, 0xBBBBBB, vec![]);
        // No port is open, so a real write would fail with NotOpen; the
        // gate must short-circuit before that is ever reached.
        assert!(cul.send_packet(&other, false).is_ok());
    }
}
