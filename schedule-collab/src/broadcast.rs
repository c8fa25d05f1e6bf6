//! Fire-and-forget fan-out to the connections of a room.
//!
//! Every live connection owns a bounded outbound queue drained by its socket
//! task. An event is encoded once and the same `Arc<str>` is pushed with
//! `try_send` to each target, so a slow or vanished member never stalls the
//! sender or the other members: a full queue drops that member's copy, a
//! closed queue is skipped. Nothing is retried or replayed.
//!
//! Per-sender order holds because each sender's events are pushed in emission
//! order and every queue is FIFO. Order across senders is not defined.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::protocol::ServerEvent;

/// Sending half of a connection's outbound queue.
pub type Outbound = mpsc::Sender<Arc<str>>;
/// Receiving half, drained by the socket task.
pub type OutboundRx = mpsc::Receiver<Arc<str>>;

/// Create an outbound queue holding up to `capacity` frames.
pub fn outbound_channel(capacity: usize) -> (Outbound, OutboundRx) {
    mpsc::channel(capacity.max(1))
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub delivered: u64,
    pub dropped: u64,
    pub attached: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Default)]
pub struct RoomBroadcaster {
    outbound: HashMap<Uuid, Outbound>,
    stats: AtomicBroadcastStats,
}

impl RoomBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, conn_id: Uuid, sender: Outbound) {
        self.outbound.insert(conn_id, sender);
    }

    pub fn detach(&mut self, conn_id: Uuid) -> bool {
        self.outbound.remove(&conn_id).is_some()
    }

    pub fn is_attached(&self, conn_id: Uuid) -> bool {
        self.outbound.contains_key(&conn_id)
    }

    /// Deliver `event` to every connection in `targets` except `exclude`.
    /// Returns how many queues accepted it.
    pub fn broadcast<I>(&self, targets: I, event: &ServerEvent, exclude: Option<Uuid>) -> usize
    where
        I: IntoIterator<Item = Uuid>,
    {
        let frame: Arc<str> = match event.encode() {
            Ok(text) => Arc::from(text),
            Err(e) => {
                log::error!("Failed to encode {} event: {e}", event.name());
                return 0;
            }
        };

        let mut delivered = 0;
        for conn_id in targets {
            if Some(conn_id) == exclude {
                continue;
            }
            if self.push(conn_id, frame.clone(), event.name()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver to a single connection.
    pub fn send_to(&self, conn_id: Uuid, event: &ServerEvent) -> bool {
        self.broadcast([conn_id], event, None) == 1
    }

    fn push(&self, conn_id: Uuid, frame: Arc<str>, name: &str) -> bool {
        let Some(sender) = self.outbound.get(&conn_id) else {
            log::debug!("No outbound queue for connection {conn_id}; skipping {name}");
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match sender.try_send(frame) {
            Ok(()) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                log::warn!("Outbound queue full for connection {conn_id}; dropped {name}");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Connection {conn_id} closed before {name} could be delivered");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            attached: self.outbound.len(),
        }
    }
}
