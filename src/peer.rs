//! Per-peer runtime state (spec.md §3, §4.E), grounded in
//! `original_source/src/BidCoSPeer.h`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::queue::QueueStep;

/// External sink for peer-reachability notifications (spec.md §7). The
/// RPC/event layer that actually surfaces these to clients lives outside
/// this crate; the core only needs to be able to call it.
pub trait ServiceMessageSink: Send + Sync {
    fn set_unreach(&self, sticky: bool, notify: bool);
    fn set_config_pending(&self, pending: bool);
    fn set_low_battery(&self, low: bool);
}

/// A sink that does nothing; useful for tests and for peers that have not
/// yet been wired to an event layer.
#[derive(Default)]
pub struct NullServiceMessageSink;
impl ServiceMessageSink for NullServiceMessageSink {
    fn set_unreach(&self, _sticky: bool, _notify: bool) {}
    fn set_config_pending(&self, _pending: bool) {}
    fn set_low_battery(&self, _low: bool) {}
}

/// Interface-level peer record (spec.md §3 `PeerInfo`). Owned by each
/// `RadioTransport`; populated by `Peer::get_peer_info`.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub address: u32,
    pub key_index: u8,
    pub wake_up: bool,
    pub aes_channels: HashSet<u8>,
}

/// Team membership (spec.md §3 `team{address, channel, id}`), expanded
/// with serial number and opaque data per `BidCoSPeer.h`'s `_team.*`
/// accessors (SPEC_FULL.md §3).
#[derive(Debug, Clone, Default)]
pub struct Team {
    pub address: u32,
    pub channel: u8,
    pub id: u64,
    pub serial_number: String,
    pub data: Vec<u8>,
}

/// A deferred per-channel state reset (spec.md §3, SPEC_FULL.md §3).
#[derive(Debug, Clone)]
pub struct VariableToReset {
    pub channel: u32,
    pub key: String,
    pub data: Vec<u8>,
    pub reset_time: i64,
    pub is_domino: bool,
}

/// One observed reception used by the roaming decision (spec.md §4.E).
#[derive(Debug, Clone, Copy)]
struct Reception {
    message_counter: u8,
    rssi: i32,
}

/// Runtime state for one paired device.
pub struct Peer {
    pub address: u32,
    pub serial_number: String,
    pub id: u64,

    message_counter: AtomicU8,
    general_counter: AtomicU8,

    pub aes_key_index: AtomicU8,
    physical_interface_id: Mutex<String>,
    pub remote_channel: u8,
    pub team: Mutex<Team>,

    pub pending_queues: Mutex<Vec<QueueStep>>,
    value_pending: AtomicBool,

    roaming_enabled: AtomicBool,
    last_reception: Mutex<Option<Reception>>,

    variables_to_reset: Mutex<HashMap<(u32, String), VariableToReset>>,

    pub rssi_device: Mutex<Option<i8>>,
    pub service_messages: Arc<dyn ServiceMessageSink>,
}

impl Peer {
    pub fn new(
        address: u32,
        serial_number: String,
        id: u64,
        physical_interface_id: String,
        service_messages: Arc<dyn ServiceMessageSink>,
    ) -> Self {
        Peer {
            address,
            serial_number,
            id,
            message_counter: AtomicU8::new(0),
            general_counter: AtomicU8::new(0),
            aes_key_index: AtomicU8::new(0),
            physical_interface_id: Mutex::new(physical_interface_id),
            remote_channel: 0,
            team: Mutex::new(Team::default()),
            pending_queues: Mutex::new(Vec::new()),
            value_pending: AtomicBool::new(false),
            roaming_enabled: AtomicBool::new(false),
            last_reception: Mutex::new(None),
            variables_to_reset: Mutex::new(HashMap::new()),
            rssi_device: Mutex::new(None),
            service_messages,
        }
    }

    pub fn message_counter(&self) -> u8 {
        self.message_counter.load(Ordering::Acquire)
    }

    /// Next outbound counter, wrapping at 0xFF -> 0x00 (spec.md §8).
    pub fn next_message_counter(&self) -> u8 {
        self.message_counter.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    pub fn general_counter(&self) -> u8 {
        self.general_counter.load(Ordering::Acquire)
    }

    pub fn set_general_counter(&self, value: u8) {
        self.general_counter.store(value, Ordering::Release);
    }

    pub fn physical_interface_id(&self) -> String {
        self.physical_interface_id.lock().clone()
    }

    pub fn set_physical_interface_id(&self, id: String) {
        *self.physical_interface_id.lock() = id;
    }

    pub fn value_pending(&self) -> bool {
        self.value_pending.load(Ordering::Acquire)
    }

    pub fn set_value_pending(&self, pending: bool) {
        self.value_pending.store(pending, Ordering::Release);
    }

    pub fn set_roaming_enabled(&self, enabled: bool) {
        self.roaming_enabled.store(enabled, Ordering::Release);
    }

    pub fn set_rssi_device(&self, rssi: i8) {
        *self.rssi_device.lock() = Some(rssi);
    }

    pub fn add_variable_to_reset(&self, v: VariableToReset) {
        self.variables_to_reset
            .lock()
            .insert((v.channel, v.key.clone()), v);
    }

    pub fn due_variable_resets(&self, now_ms: i64) -> Vec<VariableToReset> {
        let mut guard = self.variables_to_reset.lock();
        let due: Vec<_> = guard
            .iter()
            .filter(|(_, v)| v.reset_time <= now_ms)
            .map(|(k, _)| k.clone())
            .collect();
        due.into_iter().filter_map(|k| guard.remove(&k)).collect()
    }

    pub fn get_peer_info(&self, aes_channels: HashSet<u8>) -> PeerInfo {
        PeerInfo {
            address: self.address,
            key_index: self.aes_key_index.load(Ordering::Acquire),
            wake_up: false,
            aes_channels,
        }
    }

    fn is_wrap(previous: u8, next: u8) -> bool {
        previous > next && (previous - next) > 128
    }

    /// Record one reception and decide whether a better interface is
    /// available, switching to it if `ROAMING` is enabled for this peer
    /// (spec.md §4.E, scenario 5). Strongest signal wins (lowest absolute
    /// RSSI); ties favor the interface already recorded (earlier
    /// arrival). Counter wrap (0xFF -> 0x00) must not be mistaken for a
    /// replay: a new counter lower than the last by more than 128 is a
    /// wrap, not the same message arriving late on another interface.
    pub fn check_for_best_interface(&self, interface_id: &str, rssi: i32, message_counter: u8) -> bool {
        let mut last = self.last_reception.lock();
        let switched = match *last {
            Some(r) if r.message_counter == message_counter && !Self::is_wrap(r.message_counter, message_counter) => {
                let better = rssi.abs() < r.rssi.abs();
                if better && self.roaming_enabled.load(Ordering::Acquire) {
                    self.set_physical_interface_id(interface_id.to_string());
                }
                better && self.roaming_enabled.load(Ordering::Acquire)
            }
            _ => false,
        };
        *last = Some(Reception { message_counter, rssi });
        switched
    }

    /// Blocking reachability probe (spec.md §4.E `ping`). The caller is
    /// expected to have already enqueued the CONFIG-read step through the
    /// bound `QueueManager`; this just waits on the supplied channel.
    pub fn ping(&self, wait_for_response: bool, ack: crossbeam_channel::Receiver<bool>, timeout: std::time::Duration) -> bool {
        if !wait_for_response {
            return true;
        }
        ack.recv_timeout(timeout).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer::new(0x123456, "SN1".into(), 1, "CUL1".into(), Arc::new(NullServiceMessageSink))
    }

    #[test]
    fn roaming_switches_to_stronger_signal_when_enabled() {
        let p = peer();
        p.set_roaming_enabled(true);
        p.set_physical_interface_id("CUL1".into());
        assert!(!p.check_for_best_interface("CUL1", -60, 0x17));
        assert!(p.check_for_best_interface("CUL2", -50, 0x17));
        assert_eq!(p.physical_interface_id(), "CUL2");
    }

    #[test]
    fn roaming_disabled_never_switches() {
        let p = peer();
        p.set_physical_interface_id("CUL1".into());
        p.check_for_best_interface("CUL1", -60, 0x17);
        assert!(!p.check_for_best_interface("CUL2", -50, 0x17));
        assert_eq!(p.physical_interface_id(), "CUL1");
    }

    #[test]
    fn counter_wrap_is_not_treated_as_duplicate() {
        let p = peer();
        p.set_roaming_enabled(true);
        p.check_for_best_interface("CUL1", -60, 0xFF);
        // 0x00 following 0xFF is a wrap, not the same message re-observed.
        assert!(!p.check_for_best_interface("CUL2", -40, 0x00));
    }

    #[test]
    fn message_counter_wraps_at_0xff() {
        let p = peer();
        for _ in 0..255 {
            p.next_message_counter();
        }
        assert_eq!(p.next_message_counter(), 0);
    }
}
