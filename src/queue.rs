//! A queued exchange with one peer (spec.md §4.D), grounded in
//! `original_source/src/BidCoSQueueManager.cpp` (the `BidCoSQueue` type
//! itself lives in a header not included in the retrieval pack; the shape
//! below follows its usage from the manager and from spec.md §4.D).

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::packet::{now_ms, Packet};

/// What kind of exchange a queue represents (spec.md §4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    Default,
    Pairing,
    Unpairing,
    Config,
    Peer,
}

/// What a queued step does once it reaches the head of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    Message,
    StateChange,
    WakeUp,
}

/// One step of a queue: a packet to send (or state change to apply) and
/// the message types that count as a satisfying response.
#[derive(Debug, Clone)]
pub struct QueueStep {
    pub step_type: StepType,
    pub packet: Option<Packet>,
    pub expected_responses: HashSet<u8>,
}

/// Outcome of one `resend()` tick (spec.md §4.A, §4.D `resend`, §8
/// scenario 2).
#[derive(Debug, Clone)]
pub enum ResendOutcome {
    /// Nothing to resend: the queue is empty, disposed, or the head step
    /// carries no packet (a STATECHANGE/WAKEUP step has nothing to
    /// re-transmit).
    Idle,
    /// The head step should be handed to the transport again; still
    /// within its retry budget.
    Sent(QueueStep),
    /// The head exhausted its retry budget. The queue has already been
    /// disposed as a side effect; the caller must mark the peer
    /// unreachable.
    Exhausted(QueueStep),
}

impl QueueStep {
    pub fn message(packet: Packet, expected_responses: HashSet<u8>) -> Self {
        QueueStep {
            step_type: StepType::Message,
            packet: Some(packet),
            expected_responses,
        }
    }

    pub fn state_change() -> Self {
        QueueStep {
            step_type: StepType::StateChange,
            packet: None,
            expected_responses: HashSet::new(),
        }
    }

    pub fn wake_up() -> Self {
        QueueStep {
            step_type: StepType::WakeUp,
            packet: None,
            expected_responses: HashSet::new(),
        }
    }

    pub fn is_satisfied_by(&self, message_type: u8) -> bool {
        self.expected_responses.is_empty() || self.expected_responses.contains(&message_type)
    }
}

/// A FIFO of steps to run against one peer address, shared between the
/// owning `QueueManager` entry and whichever transport worker is
/// currently sending from it.
pub struct BidCoSQueue {
    pub id: u32,
    pub queue_type: Mutex<QueueType>,
    pub physical_interface_id: String,
    pub peer_address: u32,
    steps: Mutex<VecDeque<QueueStep>>,
    disposing: AtomicBool,
    /// Times the head step has been resent since it became the head
    /// (spec.md §4.A, §4.D `resend`). Reset whenever the head changes.
    retry_count: AtomicU8,
    /// Shared with the owning `QueueData` entry so `keep_alive` from either
    /// side postpones eviction (spec.md §4.D, `lastAction`).
    last_action: Arc<AtomicI64>,
}

/// Bound on how many times a head step is resent before the queue gives
/// up on it (spec.md §8 scenario 2: "no ACK within 3 retries x 400 ms").
pub const MAX_RESENDS: u8 = 3;

/// Interval a per-queue retry timer should sleep between `resend()` calls
/// (spec.md §8 scenario 2).
pub const RESEND_INTERVAL_MS: u64 = 400;

impl BidCoSQueue {
    pub fn new(id: u32, physical_interface_id: String, peer_address: u32, last_action: Arc<AtomicI64>) -> Self {
        BidCoSQueue {
            id,
            queue_type: Mutex::new(QueueType::Default),
            physical_interface_id,
            peer_address,
            steps: Mutex::new(VecDeque::new()),
            disposing: AtomicBool::new(false),
            retry_count: AtomicU8::new(0),
            last_action,
        }
    }

    pub fn set_queue_type(&self, queue_type: QueueType) {
        *self.queue_type.lock() = queue_type;
    }

    pub fn queue_type(&self) -> QueueType {
        *self.queue_type.lock()
    }

    pub fn push(&self, step: QueueStep) {
        let mut steps = self.steps.lock();
        let was_empty = steps.is_empty();
        steps.push_back(step);
        drop(steps);
        if was_empty {
            self.retry_count.store(0, Ordering::Release);
        }
        self.keep_alive();
    }

    /// Jump a step to the front of the queue, used to preempt an in-flight
    /// exchange with an AES c/r/a frame (spec.md §4.B, §4.D). Always
    /// becomes the new head, so its retry budget starts fresh.
    pub fn push_front(&self, step: QueueStep) {
        self.steps.lock().push_front(step);
        self.retry_count.store(0, Ordering::Release);
        self.keep_alive();
    }

    pub fn front(&self) -> Option<QueueStep> {
        self.steps.lock().front().cloned()
    }

    /// Send the head step: here "send" means hand it to the caller, who
    /// owns the actual transport. Returns the step without removing it —
    /// callers pop it only once a satisfying response arrives
    /// (`process_ack`) or retries are exhausted (`resend`'s caller).
    pub fn send(&self) -> Option<QueueStep> {
        self.keep_alive();
        self.front()
    }

    /// Pop the head step if an ACK with the given `message_type`,
    /// `message_counter`, and `sender` satisfies it. A step never retires
    /// on a message type match alone: spec.md §8 requires the ACK's
    /// counter to equal the pending step's packet's counter and the
    /// ACK's sender to equal that packet's destination, which is exactly
    /// how a reply is correlated to the request it answers rather than
    /// to some unrelated in-flight exchange with the same message type.
    /// A `STATECHANGE`/`WAKEUP` step (no outgoing packet) is matched on
    /// message type alone, since it has no counter/destination to check.
    /// Returns `true` if the queue advanced.
    pub fn process_ack(&self, message_type: u8, message_counter: u8, sender: u32) -> bool {
        let mut steps = self.steps.lock();
        match steps.front() {
            Some(step) if step.is_satisfied_by(message_type) => {
                let matches = match &step.packet {
                    Some(packet) => packet.message_counter == message_counter && packet.destination_address == sender,
                    None => true,
                };
                if !matches {
                    return false;
                }
                steps.pop_front();
                self.retry_count.store(0, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    /// Re-send the current head step, invoked by a per-queue retry timer
    /// (spec.md §4.A "transmit scheduler & retry machine", §4.D `resend`).
    /// A step with no packet (STATECHANGE/WAKEUP) is never resent — there
    /// is nothing to re-transmit, so the timer driving this queue should
    /// stop once it sees `Idle`. After `MAX_RESENDS` calls without an
    /// intervening `process_ack`/`push` changing the head, the queue
    /// disposes itself here (rather than leaving that to the caller) so a
    /// queue that exhausts its retries is inert immediately, even if the
    /// caller is slow to notice (spec.md §8 scenario 2).
    pub fn resend(&self) -> ResendOutcome {
        if self.is_disposing() {
            return ResendOutcome::Idle;
        }
        let step = match self.front() {
            Some(step) => step,
            None => return ResendOutcome::Idle,
        };
        if step.packet.is_none() {
            return ResendOutcome::Idle;
        }
        let attempt = self.retry_count.fetch_add(1, Ordering::AcqRel) + 1;
        if attempt > MAX_RESENDS {
            self.dispose();
            return ResendOutcome::Exhausted(step);
        }
        self.keep_alive();
        ResendOutcome::Sent(step)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.lock().len()
    }

    pub fn keep_alive(&self) {
        self.last_action.store(now_ms(), Ordering::Release);
    }

    pub fn last_action(&self) -> i64 {
        self.last_action.load(Ordering::Acquire)
    }

    /// Idempotent: calling `dispose` twice (e.g. once from the owning
    /// `QueueManager` and once from a `Drop`) must not panic or double
    /// free anything, since both simply clear shared state.
    pub fn dispose(&self) {
        if self.disposing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.steps.lock().clear();
    }

    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::Acquire)
    }
}

impl Clone for QueueStep {
    fn clone(&self) -> Self {
        QueueStep {
            step_type: self.step_type,
            packet: self.packet.clone(),
            expected_responses: self.expected_responses.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{control, message_type};

    fn queue() -> BidCoSQueue {
        BidCoSQueue::new(1, "CUL1".into(), 0x123456, Arc::new(AtomicI64::new(0)))
    }

    fn packet() -> Packet {
        Packet::new(1, control::ACK_REQ, 0x11, 0x111111, 0x123456, vec![1])
    }

    #[test]
    fn push_then_send_returns_head_without_removing() {
        let q = queue();
        let mut expected = HashSet::new();
        expected.insert(0x02);
        q.push(QueueStep::message(packet(), expected));
        assert!(q.send().is_some());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn process_ack_advances_only_on_matching_type() {
        let q = queue();
        let mut expected = HashSet::new();
        expected.insert(0x02);
        q.push(QueueStep::message(packet(), expected));
        assert!(!q.process_ack(0x99, 1, 0x123456));
        assert_eq!(q.len(), 1);
        assert!(q.process_ack(0x02, 1, 0x123456));
        assert!(q.is_empty());
    }

    #[test]
    fn process_ack_requires_matching_counter_and_sender() {
        let q = queue();
        let mut expected = HashSet::new();
        expected.insert(0x02);
        q.push(QueueStep::message(packet(), expected));

        // Right message type, wrong counter: an ACK for some unrelated
        // exchange must not be mistaken for this step's reply.
        assert!(!q.process_ack(0x02, 2, 0x123456));
        // Right message type and counter, wrong sender.
        assert!(!q.process_ack(0x02, 1, 0x999999));
        assert_eq!(q.len(), 1);

        assert!(q.process_ack(0x02, 1, 0x123456));
        assert!(q.is_empty());
    }

    #[test]
    fn process_ack_on_state_change_step_needs_only_the_message_type() {
        let q = queue();
        q.push(QueueStep::wake_up());
        assert!(q.process_ack(message_type::WAKE_UP, 0xFF, 0xABCDEF));
        assert!(q.is_empty());
    }

    #[test]
    fn push_front_preempts_pending_step() {
        let q = queue();
        q.push(QueueStep::state_change());
        q.push_front(QueueStep::wake_up());
        assert_eq!(q.front().unwrap().step_type, StepType::WakeUp);
    }

    #[test]
    fn dispose_is_idempotent() {
        let q = queue();
        q.push(QueueStep::state_change());
        q.dispose();
        q.dispose();
        assert!(q.is_empty());
        assert!(q.is_disposing());
    }

    #[test]
    fn resend_retries_up_to_the_bound_then_disposes_and_reports_exhausted() {
        let q = queue();
        let mut expected = HashSet::new();
        expected.insert(message_type::ACK);
        q.push(QueueStep::message(packet(), expected));

        for _ in 0..MAX_RESENDS {
            assert!(matches!(q.resend(), ResendOutcome::Sent(_)));
        }
        assert!(!q.is_disposing());

        assert!(matches!(q.resend(), ResendOutcome::Exhausted(_)));
        assert!(q.is_disposing());
        assert!(q.is_empty());
    }

    #[test]
    fn resend_on_empty_queue_is_idle() {
        let q = queue();
        assert!(matches!(q.resend(), ResendOutcome::Idle));
    }

    #[test]
    fn resend_does_not_retransmit_state_change_steps() {
        let q = queue();
        q.push(QueueStep::state_change());
        assert!(matches!(q.resend(), ResendOutcome::Idle));
    }

    #[test]
    fn process_ack_resets_the_retry_budget_for_the_next_step() {
        let q = queue();
        let mut expected = HashSet::new();
        expected.insert(message_type::ACK);
        q.push(QueueStep::message(packet(), expected.clone()));
        q.push(QueueStep::message(packet(), expected));

        q.resend();
        q.resend();
        assert!(q.process_ack(message_type::ACK, 1, 0x123456));

        // The second step just became head; it gets a fresh retry budget
        // rather than inheriting the first step's exhausted count.
        for _ in 0..MAX_RESENDS {
            assert!(matches!(q.resend(), ResendOutcome::Sent(_)));
        }
        assert!(!q.is_disposing());
    }

    #[test]
    fn keep_alive_updates_shared_last_action() {
        let last_action = Arc::new(AtomicI64::new(0));
        let q = BidCoSQueue::new(1, "CUL1".into(), 0x1, Arc::clone(&last_action));
        q.keep_alive();
        assert!(last_action.load(Ordering::Acquire) > 0);
    }
}
