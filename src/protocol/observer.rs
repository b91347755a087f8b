//! Per-peer packet queue between a pipe reader and a protocol actor.
//!
//! The observer decouples the network reader from the protocol actor: the
//! reader enqueues at line rate and never blocks on protocol logic, while
//! the actor drains at its own pace. The queue is bounded at
//! [`MAX_PROPOSALS`](super::MAX_PROPOSALS) packets.
//!
//! Overflow policy: the incoming packet is dropped, logged, and counted.
//! `send` must never block because callers may hold locks; a lost packet
//! merely triggers a protocol-level retry or timeout upstream.

use super::MAX_PROPOSALS;
use crate::message::Packet;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::warn;

/// Bounded FIFO of inbound packets with non-destructive peek.
pub struct Observer {
    queue: Mutex<VecDeque<Packet>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl Observer {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a packet. Never blocks; on overflow the packet is dropped
    /// and counted.
    pub fn send(&self, packet: Packet) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= MAX_PROPOSALS {
                drop(queue);
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    packet = packet.name(),
                    dropped_total = total,
                    "observer full, dropping packet"
                );
                return;
            }
            queue.push_back(packet);
        }
        self.notify.notify_one();
    }

    /// Return the first packet without consuming it. A subsequent
    /// [`get_next`](Self::get_next) returns the same packet.
    pub fn peek_first(&self) -> Option<Packet> {
        self.queue.lock().front().cloned()
    }

    /// Return and consume the head of the queue.
    pub fn get_next(&self) -> Option<Packet> {
        self.queue.lock().pop_front()
    }

    /// Non-blocking size check.
    pub fn has_data(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Number of packets dropped due to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Await the next packet. This is the actor-facing read; cancellation
    /// safe for use in `select!` arms.
    pub async fn next(&self) -> Packet {
        loop {
            let notified = self.notify.notified();
            if let Some(packet) = self.get_next() {
                return packet;
            }
            notified.await;
        }
    }
}

impl Default for Observer {
    fn default() -> Self {
        Self::new()
    }
}
