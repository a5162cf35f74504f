//! Duplicate-packet cache (spec.md §4.C), grounded in
//! `original_source/src/BidCoSPacketManager.cpp`.
//!
//! A short-lived, per-address TTL cache used to deduplicate radio replays
//! and to expose "last known radio packet" for RSSI/roaming decisions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::packet::{now_ms, Packet};

/// Entry TTL before the worker reclaims it (spec.md §4.C, §8).
const ENTRY_TTL_MS: i64 = 2000;
/// Window used for the adaptive sleep calculation (`workerThreadWindow`).
const DEFAULT_WORKER_WINDOW_MS: i64 = 1000;
const MIN_SLEEP_MS: u64 = 10;

/// One cached reception.
#[derive(Debug, Clone)]
pub struct BidCoSPacketInfo {
    pub packet: Packet,
    pub id: u32,
    pub time: i64,
}

struct Inner {
    packets: HashMap<u32, BidCoSPacketInfo>,
    next_id: u32,
}

/// TTL cache of the latest received packet per source address.
pub struct PacketManager {
    inner: Arc<Mutex<Inner>>,
    disposing: Arc<AtomicBool>,
    stop_worker: Arc<AtomicBool>,
    worker_window_ms: Arc<AtomicU32>,
    worker: Option<JoinHandle<()>>,
}

impl PacketManager {
    pub fn new() -> Self {
        Self::with_worker_window(DEFAULT_WORKER_WINDOW_MS as u32)
    }

    pub fn with_worker_window(worker_window_ms: u32) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            packets: HashMap::new(),
            next_id: 0,
        }));
        let disposing = Arc::new(AtomicBool::new(false));
        let stop_worker = Arc::new(AtomicBool::new(false));
        let worker_window = Arc::new(AtomicU32::new(worker_window_ms));

        let worker = {
            let inner = Arc::clone(&inner);
            let disposing = Arc::clone(&disposing);
            let stop_worker = Arc::clone(&stop_worker);
            let worker_window = Arc::clone(&worker_window);
            std::thread::Builder::new()
                .name("packet-manager".into())
                .spawn(move || worker_loop(inner, disposing, stop_worker, worker_window))
                .expect("spawn packet-manager worker")
        };

        PacketManager {
            inner,
            disposing,
            stop_worker,
            worker_window_ms: worker_window,
            worker: Some(worker),
        }
    }

    /// Record a reception. Returns `true` if an existing entry with an
    /// equal packet was kept (i.e. this was a duplicate); `false` if a
    /// new entry was inserted.
    pub fn set(&self, address: u32, packet: Packet, time: Option<i64>) -> bool {
        if self.disposing.load(Ordering::Acquire) {
            return false;
        }
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.packets.get(&address) {
            if existing.packet == packet {
                return true;
            }
        }
        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1);
        inner.packets.insert(
            address,
            BidCoSPacketInfo {
                packet,
                id,
                time: time.unwrap_or_else(now_ms),
            },
        );
        false
    }

    pub fn get(&self, address: u32) -> Option<Packet> {
        if self.disposing.load(Ordering::Acquire) {
            return None;
        }
        self.inner.lock().packets.get(&address).map(|i| i.packet.clone())
    }

    pub fn get_info(&self, address: u32) -> Option<BidCoSPacketInfo> {
        if self.disposing.load(Ordering::Acquire) {
            return None;
        }
        self.inner.lock().packets.get(&address).cloned()
    }

    pub fn keep_alive(&self, address: u32) {
        if self.disposing.load(Ordering::Acquire) {
            return;
        }
        if let Some(entry) = self.inner.lock().packets.get_mut(&address) {
            entry.time = now_ms();
        }
    }

    pub fn dispose(&mut self) {
        self.disposing.store(true, Ordering::Release);
        self.stop_worker.store(true, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PacketManager {
    fn drop(&mut self) {
        if !self.disposing.load(Ordering::Acquire) {
            self.dispose();
        }
    }
}

impl Default for PacketManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Adaptive-interval round-robin scan. See spec.md §4.C and Open Question
/// (b) in §9 (the original carries `lastPacket` across unlocks and may
/// skip entries on concurrent mutation; at-least-once-per-period
/// semantics is preserved here, not strict round robin).
fn worker_loop(
    inner: Arc<Mutex<Inner>>,
    disposing: Arc<AtomicBool>,
    stop_worker: Arc<AtomicBool>,
    worker_window_ms: Arc<AtomicU32>,
) {
    let mut sleep_ms: u64 = 1000;
    let mut counter: u32 = 0;
    let mut last_address: Option<u32> = None;

    while !stop_worker.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(sleep_ms));
        if stop_worker.load(Ordering::Acquire) {
            return;
        }
        if disposing.load(Ordering::Acquire) {
            return;
        }

        if counter > 100 {
            counter = 0;
            let len = inner.lock().packets.len();
            if len > 0 {
                let packets_per_second = ((len as u64 * 1000) / sleep_ms.max(1)).max(1);
                let window = worker_window_ms.load(Ordering::Relaxed) as u64;
                let time_per_packet = ((window * 10) / packets_per_second).max(MIN_SLEEP_MS);
                sleep_ms = time_per_packet;
            }
        }

        let candidate = {
            let guard = inner.lock();
            if guard.packets.is_empty() {
                None
            } else {
                let mut keys: Vec<u32> = guard.packets.keys().copied().collect();
                keys.sort_unstable();
                let next = match last_address.and_then(|addr| keys.iter().position(|k| *k == addr)) {
                    Some(pos) => keys[(pos + 1) % keys.len()],
                    None => keys[0],
                };
                guard.packets.get(&next).map(|info| (next, info.id))
            }
        };

        if let Some((address, id)) = candidate {
            last_address = Some(address);
            // Reacquire the lock per-entry rather than holding it across
            // the deletion decision, matching the original's design.
            delete_stale(&inner, &disposing, address, id);
        }

        counter += 1;
    }
}

fn delete_stale(inner: &Arc<Mutex<Inner>>, disposing: &Arc<AtomicBool>, address: u32, id: u32) {
    if disposing.load(Ordering::Acquire) {
        return;
    }
    let mut guard = inner.lock();
    if let Some(entry) = guard.packets.get(&address) {
        if entry.id == id && now_ms() > entry.time + ENTRY_TTL_MS {
            guard.packets.remove(&address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    fn sample_packet(counter: u8) -> Packet {
        Packet::new(counter, 0, 0x02, 0x123456, 0x654321, vec![0])
    }

    #[test]
    fn duplicate_set_keeps_original_id() {
        let mgr = PacketManager::new();
        assert!(!mgr.set(0x123456, sample_packet(1), Some(1000)));
        let id_before = mgr.get_info(0x123456).unwrap().id;
        assert!(mgr.set(0x123456, sample_packet(1), Some(1050)));
        let id_after = mgr.get_info(0x123456).unwrap().id;
        assert_eq!(id_before, id_after);
    }

    #[test]
    fn distinct_packet_replaces_entry() {
        let mgr = PacketManager::new();
        assert!(!mgr.set(1, sample_packet(1), Some(1000)));
        assert!(!mgr.set(1, sample_packet(2), Some(1001)));
        assert_eq!(mgr.get(1).unwrap().message_counter, 2);
    }

    #[test]
    fn keep_alive_refreshes_timestamp() {
        let mgr = PacketManager::new();
        mgr.set(1, sample_packet(1), Some(1000));
        mgr.keep_alive(1);
        assert!(mgr.get_info(1).unwrap().time >= 1000);
    }

    #[test]
    fn get_on_absent_address_is_none() {
        let mgr = PacketManager::new();
        assert!(mgr.get(0xDEAD).is_none());
    }
}
