//! The dispatch glue between a `RadioTransport`, `PacketManager`,
//! `AesHandshake`, `QueueManager` and the peer registry (spec.md §2,
//! §4.E), grounded in `original_source/src/BidCoSPeer.h`'s
//! `packetReceived` entry point and `BidCoSQueueManager.cpp`'s
//! `createQueue`/`get` call sites.
//!
//! `spec.md` §1 scopes the RPC/device-model layer out of this crate, but
//! the control flow joining the in-scope pieces together — "an incoming
//! frame traverses A -> (C dedup) -> E (routing) -> B (if AES) -> D
//! (ack/response matching)" — is itself core engine behavior (component
//! E, "Peer/Central", 20% share in spec.md §2). `Central` is that join
//! point; it owns no protocol logic of its own; everything it does is a
//! one-line call into the module that owns that logic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::packet::{message_type, Packet};
use crate::packet_manager::PacketManager;
use crate::peer::Peer;
use crate::queue::{BidCoSQueue, QueueType, ResendOutcome, RESEND_INTERVAL_MS};
use crate::queue_manager::QueueManager;
use crate::transport::{RadioTransport, Reception};

/// What the caller should do with a reception once `Central::dispatch`
/// has run the full routing chain. The upper (RPC/device-model) layer is
/// out of scope (spec.md §1), so rather than calling into it directly,
/// `Central` hands back a small enum describing what happened; the
/// embedding application decides what a `Delivered` packet means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The reception was a byte-for-byte duplicate of the last frame
    /// seen from this address within the TTL window (spec.md §4.C); no
    /// further action was taken.
    Duplicate,
    /// The sender is not a known peer; dropped (spec.md §4.A Non-goals —
    /// pairing policy, which would register the peer, lives outside this
    /// crate).
    UnknownPeer,
    /// The frame satisfied the head of the peer's outgoing queue (an
    /// ACK matching the pending step's expected response types).
    AckMatched,
    /// The frame carries no matching queue step; it is a fresh
    /// application-level payload to raise upward.
    Delivered(Packet),
}

/// Joins the five in-scope components for one physical interface's worth
/// of traffic. A gateway with multiple interfaces runs one `Central` per
/// `RadioTransport`, sharing the same `QueueManager`/peer registry (so
/// roaming can move a peer from one interface's `Central` to another's).
pub struct Central {
    my_address: u32,
    transport: Arc<dyn RadioTransport>,
    packet_manager: Arc<PacketManager>,
    queue_manager: Arc<QueueManager>,
    peers: Arc<Mutex<HashMap<u32, Arc<Peer>>>>,
}

impl Central {
    pub fn new(
        my_address: u32,
        transport: Arc<dyn RadioTransport>,
        packet_manager: Arc<PacketManager>,
        queue_manager: Arc<QueueManager>,
        peers: Arc<Mutex<HashMap<u32, Arc<Peer>>>>,
    ) -> Self {
        Central {
            my_address,
            transport,
            packet_manager,
            queue_manager,
            peers,
        }
    }

    /// Run one reception through the full routing chain (spec.md §2).
    ///
    /// 1. Dedup against `PacketManager` (component C).
    /// 2. Look the sender up in the peer registry and update roaming
    ///    state (component E).
    /// 3. If the frame satisfies the head of that peer's outgoing queue,
    ///    advance the queue (component D) and report `AckMatched`.
    /// 4. Otherwise hand the frame back as `Delivered` for whatever AES
    ///    dispatch (component B, owned by the transport for COC/CUNO, or
    ///    performed by the caller for CUL) or upper layer wants it.
    pub fn dispatch(&self, reception: Reception) -> DispatchOutcome {
        let Reception { interface_id, packet } = reception;

        if self.packet_manager.set(packet.sender_address, packet.clone(), None) {
            return DispatchOutcome::Duplicate;
        }

        let peer = match self.peers.lock().get(&packet.sender_address).cloned() {
            Some(p) => p,
            None => return DispatchOutcome::UnknownPeer,
        };

        // A reception with no RSSI reading must not be compared against
        // one that has a real reading: defaulting to 0 would make the
        // silent interface look like the strongest possible signal and
        // win every roaming comparison regardless of actual quality.
        if let Some(rssi) = packet.rssi {
            peer.check_for_best_interface(&interface_id, rssi as i32, packet.message_counter);
            peer.set_rssi_device(rssi);
        }

        if packet.destination_address == self.my_address && packet.message_type == message_type::ACK {
            if let Some(queue) = self.queue_manager.get(peer.address) {
                if queue.process_ack(packet.message_type, packet.message_counter, packet.sender_address) {
                    self.advance_queue(&queue);
                    return DispatchOutcome::AckMatched;
                }
            }
        }

        DispatchOutcome::Delivered(packet)
    }

    /// Send the next step of `queue` via this `Central`'s bound
    /// transport, if any step remains (spec.md §4.D `processAck`:
    /// "invoke `send` on the next step if any"). If the step carries a
    /// packet, also arms the per-queue retry timer (spec.md §4.A
    /// "transmit scheduler & retry machine").
    fn advance_queue(&self, queue: &Arc<BidCoSQueue>) {
        if let Some(step) = queue.send() {
            if let Some(packet) = step.packet {
                if let Err(err) = self.transport.send_packet(&packet, false) {
                    log::warn!(
                        "{}: failed to send next queue step to 0x{:06x}: {err}",
                        self.transport.id(),
                        queue.peer_address
                    );
                }
                self.spawn_retry_timer(Arc::clone(queue));
            }
        }
    }

    /// Drive `queue`'s bounded resend (spec.md §4.D `resend`, §8 scenario
    /// 2) on its own thread, woken every `RESEND_INTERVAL_MS`. Stops once
    /// the head is satisfied (`resend` returns `Idle` because the queue
    /// advanced or emptied) or its retry budget is exhausted, in which
    /// case the peer is marked unreachable.
    fn spawn_retry_timer(&self, queue: Arc<BidCoSQueue>) {
        let transport = Arc::clone(&self.transport);
        let peers = Arc::clone(&self.peers);
        std::thread::Builder::new()
            .name("queue-retry".into())
            .spawn(move || loop {
                std::thread::sleep(Duration::from_millis(RESEND_INTERVAL_MS));
                match queue.resend() {
                    ResendOutcome::Idle => return,
                    ResendOutcome::Sent(step) => {
                        if let Some(packet) = step.packet {
                            if let Err(err) = transport.send_packet(&packet, false) {
                                log::warn!("{}: resend to 0x{:06x} failed: {err}", transport.id(), queue.peer_address);
                            }
                        }
                    }
                    ResendOutcome::Exhausted(_) => {
                        if let Some(peer) = peers.lock().get(&queue.peer_address).cloned() {
                            log::warn!(
                                "{}: 0x{:06x} exhausted its retry budget, marking unreachable",
                                transport.id(),
                                queue.peer_address
                            );
                            peer.service_messages.set_unreach(true, true);
                        }
                        return;
                    }
                }
            })
            .expect("spawn queue-retry thread");
    }

    /// Create (or replace) the outgoing queue for `peer_address` and
    /// enqueue its first step, mirroring `BidCoSQueueManager::createQueue`
    /// followed by an immediate `push`/`send` (spec.md §4.D, §4.E).
    pub fn enqueue(
        &self,
        peer_address: u32,
        queue_type: QueueType,
        step: crate::queue::QueueStep,
    ) -> Option<Arc<crate::queue::BidCoSQueue>> {
        let queue = self.queue_manager.create_queue(self.transport.id().to_string(), queue_type, peer_address)?;
        queue.push(step);
        self.advance_queue(&queue);
        Some(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::control;
    use crate::peer::{NullServiceMessageSink, ServiceMessageSink};
    use crate::queue::{QueueStep, MAX_RESENDS};
    use crate::transport::Capabilities;
    use crate::error::TransportError;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeTransport {
        sent: Mutex<Vec<Packet>>,
        sends: AtomicUsize,
    }

    impl FakeTransport {
        fn new() -> Self {
            FakeTransport {
                sent: Mutex::new(Vec::new()),
                sends: AtomicUsize::new(0),
            }
        }
    }

    impl RadioTransport for FakeTransport {
        fn id(&self) -> &str {
            "FAKE1"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
        fn start_listening(&self) -> Result<(), TransportError> {
            Ok(())
        }
        fn stop_listening(&self) -> Result<(), TransportError> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            true
        }
        fn send_packet(&self, packet: &Packet, _wait_for_response: bool) -> Result<(), TransportError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.sent.lock().push(packet.clone());
            Ok(())
        }
        fn poll_receptions(&self) -> Vec<Reception> {
            Vec::new()
        }
        fn enable_update_mode(&self, _target_address: u32) -> Result<(), TransportError> {
            Ok(())
        }
        fn disable_update_mode(&self) -> Result<(), TransportError> {
            Ok(())
        }
        fn add_peer(&self, _info: crate::peer::PeerInfo) {}
        fn remove_peer(&self, _address: u32) {}
        fn set_wake_up(&self, _address: u32, _wake_up: bool) {}
        fn set_aes_channels(&self, _address: u32, _channels: HashSet<u8>) {}
    }

    fn setup() -> (Central, Arc<Peer>) {
        let peers = Arc::new(Mutex::new(HashMap::new()));
        let peer = Arc::new(Peer::new(0x222222, "SN1".into(), 1, "FAKE1".into(), Arc::new(NullServiceMessageSink)));
        peers.lock().insert(0x222222, Arc::clone(&peer));

        let transport: Arc<dyn RadioTransport> = Arc::new(FakeTransport::new());
        let packet_manager = Arc::new(PacketManager::new());
        let queue_manager = Arc::new(QueueManager::new(Arc::clone(&peers)));
        let central = Central::new(0x111111, transport, packet_manager, queue_manager, peers);
        (central, peer)
    }

    #[test]
    fn unknown_peer_is_dropped() {
        let (central, _peer) = setup();
        let packet = Packet::new(1, 0, 0x11, 0xDEAD, 0x111111, vec![]);
        let outcome = central.dispatch(Reception { interface_id: "FAKE1".into(), packet });
        assert_eq!(outcome, DispatchOutcome::UnknownPeer);
    }

    #[test]
    fn duplicate_reception_is_reported_once() {
        let (central, _peer) = setup();
        let packet = Packet::new(1, 0, 0x11, 0x222222, 0x111111, vec![9]);
        let first = central.dispatch(Reception { interface_id: "FAKE1".into(), packet: packet.clone() });
        assert!(matches!(first, DispatchOutcome::Delivered(_)));
        let second = central.dispatch(Reception { interface_id: "FAKE1".into(), packet });
        assert_eq!(second, DispatchOutcome::Duplicate);
    }

    #[test]
    fn matching_ack_advances_the_peers_queue() {
        let (central, peer) = setup();

        let mut expected = HashSet::new();
        expected.insert(message_type::ACK);
        let outgoing = Packet::new(5, control::ACK_REQ, 0x11, 0x111111, 0x222222, vec![1]);
        central.enqueue(peer.address, QueueType::Default, QueueStep::message(outgoing, expected)).unwrap();

        let ack = Packet::new(5, 0, message_type::ACK, 0x222222, 0x111111, vec![0]);
        let outcome = central.dispatch(Reception { interface_id: "FAKE1".into(), packet: ack });
        assert_eq!(outcome, DispatchOutcome::AckMatched);
    }

    #[test]
    fn non_ack_frame_is_delivered_upward() {
        let (central, peer) = setup();
        let packet = Packet::new(1, 0, 0x11, peer.address, 0x111111, vec![7, 7]);
        let outcome = central.dispatch(Reception { interface_id: "FAKE1".into(), packet: packet.clone() });
        assert_eq!(outcome, DispatchOutcome::Delivered(packet));
    }

    struct RecordingSink {
        unreached: AtomicBool,
    }
    impl ServiceMessageSink for RecordingSink {
        fn set_unreach(&self, _sticky: bool, _notify: bool) {
            self.unreached.store(true, Ordering::SeqCst);
        }
        fn set_config_pending(&self, _pending: bool) {}
        fn set_low_battery(&self, _low: bool) {}
    }

    #[test]
    fn exhausting_retries_marks_the_peer_unreachable() {
        let peers = Arc::new(Mutex::new(HashMap::new()));
        let sink = Arc::new(RecordingSink { unreached: AtomicBool::new(false) });
        let peer = Arc::new(Peer::new(0x222222, "SN1".into(), 1, "FAKE1".into(), sink.clone()));
        peers.lock().insert(0x222222, Arc::clone(&peer));

        let transport: Arc<dyn RadioTransport> = Arc::new(FakeTransport::new());
        let packet_manager = Arc::new(PacketManager::new());
        let queue_manager = Arc::new(QueueManager::new(Arc::clone(&peers)));
        let central = Central::new(0x111111, transport, packet_manager, queue_manager, peers);

        let mut expected = HashSet::new();
        expected.insert(message_type::ACK);
        let outgoing = Packet::new(9, control::ACK_REQ, 0x11, 0x111111, 0x222222, vec![1]);
        central.enqueue(peer.address, QueueType::Default, QueueStep::message(outgoing, expected)).unwrap();

        // No ACK ever arrives: the retry timer exhausts MAX_RESENDS
        // resends, RESEND_INTERVAL_MS apart, and marks the peer
        // unreachable on the attempt after the last one.
        std::thread::sleep(Duration::from_millis(RESEND_INTERVAL_MS * (MAX_RESENDS as u64 + 1) + 200));
        assert!(sink.unreached.load(Ordering::SeqCst));
    }
}
