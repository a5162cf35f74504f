//! Registry of live `BidCoSQueue`s, one per peer address (spec.md §4.D,
//! §5), grounded directly in
//! `original_source/src/BidCoSQueueManager.cpp`.
//!
//! The worker thread below preserves the original's "resetQueue must run
//! on its own thread" rule: `reset_queue` can call back into peer
//! reachability handling, which can itself enqueue a new queue through
//! this same manager, so running it while holding `queues` locked would
//! deadlock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::peer::Peer;
use crate::queue::{BidCoSQueue, QueueType};

/// A queue won't be reclaimed within this long of its last activity,
/// even once empty (spec.md §4.D).
const MIN_IDLE_BEFORE_RESET_MS: i64 = 3000;
/// A queue still referenced elsewhere is given up to this long to finish
/// before being force-reset anyway.
const MAX_POSTPONE_MS: i64 = 20_000;

struct QueueData {
    queue: Arc<BidCoSQueue>,
    id: u32,
    last_action: Arc<AtomicI64>,
}

struct Inner {
    queues: HashMap<u32, QueueData>,
}

/// Owns every currently active `BidCoSQueue`, keyed by peer address.
pub struct QueueManager {
    inner: Arc<Mutex<Inner>>,
    next_id: Arc<Mutex<u32>>,
    disposing: Arc<AtomicBool>,
    stop_worker: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    peers: Arc<Mutex<HashMap<u32, Arc<Peer>>>>,
}

impl QueueManager {
    pub fn new(peers: Arc<Mutex<HashMap<u32, Arc<Peer>>>>) -> Self {
        QueueManager {
            inner: Arc::new(Mutex::new(Inner { queues: HashMap::new() })),
            next_id: Arc::new(Mutex::new(0)),
            disposing: Arc::new(AtomicBool::new(false)),
            stop_worker: Arc::new(AtomicBool::new(true)),
            worker: Mutex::new(None),
            peers,
        }
    }

    /// Create (replacing any existing one) the queue for `address`,
    /// starting the worker thread on first use (spec.md §5).
    pub fn create_queue(&self, physical_interface_id: String, queue_type: QueueType, address: u32) -> Option<Arc<BidCoSQueue>> {
        if self.disposing.load(Ordering::Acquire) {
            return None;
        }

        self.ensure_worker_running();

        let id = {
            let mut next_id = self.next_id.lock();
            let id = *next_id;
            *next_id = next_id.wrapping_add(1);
            id
        };

        let last_action = Arc::new(AtomicI64::new(crate::packet::now_ms()));
        let queue = Arc::new(BidCoSQueue::new(id, physical_interface_id, address, Arc::clone(&last_action)));
        queue.set_queue_type(queue_type);

        let mut inner = self.inner.lock();
        inner.queues.insert(
            address,
            QueueData {
                queue: Arc::clone(&queue),
                id,
                last_action,
            },
        );
        Some(queue)
    }

    /// Look up the queue for `address`, refreshing its idle timer so the
    /// worker does not reclaim it out from under the caller.
    pub fn get(&self, address: u32) -> Option<Arc<BidCoSQueue>> {
        if self.disposing.load(Ordering::Acquire) {
            return None;
        }
        let inner = self.inner.lock();
        let data = inner.queues.get(&address)?;
        data.queue.keep_alive();
        Some(Arc::clone(&data.queue))
    }

    fn ensure_worker_running(&self) {
        if !self.stop_worker.swap(false, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let disposing = Arc::clone(&self.disposing);
        let stop_worker = Arc::clone(&self.stop_worker);
        let peers = Arc::clone(&self.peers);
        let this_inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("queue-manager".into())
            .spawn(move || worker_loop(inner, disposing, stop_worker, peers, this_inner))
            .expect("spawn queue-manager worker");
        *self.worker.lock() = Some(handle);
    }

    pub fn dispose(&self) {
        self.disposing.store(true, Ordering::Release);
        self.stop_worker.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.inner.lock().queues.clear();
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        if !self.disposing.load(Ordering::Acquire) {
            self.dispose();
        }
    }
}

/// Round-robin over live queues, resetting (disposing) whichever one has
/// sat idle for too long. Mirrors the C++ worker's "advance past the
/// last visited key, wrapping to the first" behaviour.
fn worker_loop(
    inner: Arc<Mutex<Inner>>,
    disposing: Arc<AtomicBool>,
    stop_worker: Arc<AtomicBool>,
    peers: Arc<Mutex<HashMap<u32, Arc<Peer>>>>,
    reset_inner: Arc<Mutex<Inner>>,
) {
    let mut last_address: Option<u32> = None;

    while !stop_worker.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
        if stop_worker.load(Ordering::Acquire) || disposing.load(Ordering::Acquire) {
            return;
        }

        let candidate = {
            let guard = inner.lock();
            if guard.queues.is_empty() {
                stop_worker.store(true, Ordering::Release);
                None
            } else {
                let mut keys: Vec<u32> = guard.queues.keys().copied().collect();
                keys.sort_unstable();
                let next = match last_address.and_then(|addr| keys.iter().position(|k| *k == addr)) {
                    Some(pos) => keys[(pos + 1) % keys.len()],
                    None => keys[0],
                };
                guard.queues.get(&next).map(|d| (next, d.id))
            }
        };

        if let Some((address, id)) = candidate {
            last_address = Some(address);
            reset_queue(&reset_inner, &disposing, &peers, address, id);
        }
    }
}

/// Reclaim the queue for `address` if it is empty and idle, or forcibly
/// after `MAX_POSTPONE_MS` even if still referenced elsewhere. Lock on
/// `queues` is dropped before calling into peer reachability handling,
/// because `set_unreach` can end up creating a new queue through this
/// same manager (spec.md §4.D, §9 resetQueue deadlock note).
fn reset_queue(
    inner: &Arc<Mutex<Inner>>,
    disposing: &Arc<AtomicBool>,
    peers: &Arc<Mutex<HashMap<u32, Arc<Peer>>>>,
    address: u32,
    id: u32,
) {
    if disposing.load(Ordering::Acquire) {
        return;
    }

    let mut set_unreach_for: Option<u32> = None;
    {
        let mut guard = inner.lock();
        let now = crate::packet::now_ms();

        let still_busy = guard
            .queues
            .get(&address)
            .map(|d| !d.queue.is_empty() && now <= d.last_action.load(Ordering::Acquire) + MIN_IDLE_BEFORE_RESET_MS)
            .unwrap_or(false);
        if still_busy {
            return;
        }

        if let Some(data) = guard.queues.get(&address) {
            if data.id != id {
                return;
            }
            let referenced_elsewhere = Arc::strong_count(&data.queue) > 1;
            if referenced_elsewhere && now <= data.last_action.load(Ordering::Acquire) + MAX_POSTPONE_MS {
                log::debug!("postponing reset of queue {id} for 0x{address:06x}: still in use");
                return;
            }

            let had_pending_non_pairing = !data.queue.is_empty() && data.queue.queue_type() != QueueType::Pairing;
            data.queue.dispose();
            guard.queues.remove(&address);
            if had_pending_non_pairing {
                set_unreach_for = Some(address);
            }
        }

        if guard.queues.is_empty() {
            // Caller's loop will observe this on its next iteration and stop.
        }
    }

    if let Some(address) = set_unreach_for {
        if let Some(peer) = peers.lock().get(&address) {
            log::info!("setting peer 0x{address:06x} unreachable: queue processing was interrupted");
            peer.service_messages.set_unreach(true, true);
        }
    }
}
