// Per-node fan-out for the single lobby topic.
//
// Delivery must never block on a slow client: state updates land in a watch
// slot where a newer update replaces an undelivered older one (coalescing),
// and critical messages go through a bounded queue whose overflow evicts the
// client rather than stalling the broadcast.
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use hearth_common::ServerMessage;
use tokio::sync::{mpsc, watch};

pub type ClientId = u64;

const DEFAULT_CRITICAL_CAPACITY: usize = 32;

#[derive(Debug)]
struct ClientSink {
    updates: watch::Sender<Option<ServerMessage>>,
    critical: mpsc::Sender<ServerMessage>,
}

/// The receiving half handed to a client's socket writer task. When the hub
/// evicts the client both channels close, which ends the writer.
#[derive(Debug)]
pub struct ClientReceiver {
    pub updates: watch::Receiver<Option<ServerMessage>>,
    pub critical: mpsc::Receiver<ServerMessage>,
}

#[derive(Debug)]
pub struct LobbyHub {
    clients: DashMap<ClientId, ClientSink>,
    next_id: AtomicU64,
    critical_capacity: usize,
}

impl Default for LobbyHub {
    fn default() -> Self {
        Self::new(DEFAULT_CRITICAL_CAPACITY)
    }
}

impl LobbyHub {
    pub fn new(critical_capacity: usize) -> Self {
        Self {
            clients: DashMap::new(),
            next_id: AtomicU64::new(1),
            critical_capacity: critical_capacity.max(1),
        }
    }

    /// Register a client and hand back its receiving half. Broadcasts reach
    /// the client from this point on.
    pub fn join(&self) -> (ClientId, ClientReceiver) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (update_tx, update_rx) = watch::channel(None);
        let (critical_tx, critical_rx) = mpsc::channel(self.critical_capacity);
        self.clients.insert(
            id,
            ClientSink {
                updates: update_tx,
                critical: critical_tx,
            },
        );
        metrics::gauge!("hearth_lobby_clients").increment(1.0);
        (id, ClientReceiver {
            updates: update_rx,
            critical: critical_rx,
        })
    }

    pub fn leave(&self, id: ClientId) {
        if self.clients.remove(&id).is_some() {
            metrics::gauge!("hearth_lobby_clients").decrement(1.0);
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Deliver to every registered client.
    pub fn broadcast(&self, message: &ServerMessage) {
        self.deliver(None, message);
    }

    /// Deliver to every registered client except one, used when the
    /// originator already received the same state in its welcome.
    pub fn broadcast_from(&self, exclude: ClientId, message: &ServerMessage) {
        self.deliver(Some(exclude), message);
    }

    /// Deliver to a single client (the welcome path). Critical semantics
    /// apply: an already-full queue evicts the client.
    pub fn send_to(&self, id: ClientId, message: ServerMessage) {
        let evict = match self.clients.get(&id) {
            Some(sink) => sink.critical.try_send(message).is_err(),
            None => false,
        };
        if evict {
            self.evict(id);
        }
    }

    fn deliver(&self, exclude: Option<ClientId>, message: &ServerMessage) {
        if message.is_coalescable() {
            for entry in self.clients.iter() {
                if Some(*entry.key()) == exclude {
                    continue;
                }
                // A newer update replaces any undelivered older one; that
                // replacement is the coalescing drop.
                entry.value().updates.send_replace(Some(message.clone()));
            }
            return;
        }

        // Critical path: never await, never drop. A full queue means the
        // client cannot keep up with events it must not miss, so it goes.
        let mut evicted = Vec::new();
        for entry in self.clients.iter() {
            if Some(*entry.key()) == exclude {
                continue;
            }
            if entry.value().critical.try_send(message.clone()).is_err() {
                evicted.push(*entry.key());
            }
        }
        for id in evicted {
            tracing::info!(client = id, "evicting client with full critical queue");
            metrics::counter!("hearth_lobby_evicted_total").increment(1);
            self.evict(id);
        }
    }

    fn evict(&self, id: ClientId) {
        // Dropping the sink closes both channels; the client's writer task
        // observes the close and tears the socket down.
        self.leave(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_common::StateSnapshot;
    use std::time::Duration;

    fn update(n: u64) -> ServerMessage {
        ServerMessage::state_update(StateSnapshot {
            concurrent_connections: n,
            total_connection_seconds: 0,
            peak_connections: n,
        })
    }

    fn warning() -> ServerMessage {
        ServerMessage::ShutdownWarning {
            message: "draining".to_string(),
            reconnect_delay: 5000,
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client() {
        let hub = LobbyHub::default();
        let (_, mut a) = hub.join();
        let (_, mut b) = hub.join();
        hub.broadcast(&warning());
        let got_a = tokio::time::timeout(Duration::from_secs(1), a.critical.recv())
            .await
            .expect("timely")
            .expect("message");
        let got_b = tokio::time::timeout(Duration::from_secs(1), b.critical.recv())
            .await
            .expect("timely")
            .expect("message");
        assert_eq!(got_a, warning());
        assert_eq!(got_b, warning());
    }

    #[tokio::test]
    async fn broadcast_from_skips_the_originator() {
        let hub = LobbyHub::default();
        let (origin, mut origin_rx) = hub.join();
        let (_, mut other_rx) = hub.join();
        hub.broadcast_from(origin, &update(2));
        assert!(other_rx.updates.changed().await.is_ok());
        assert_eq!(
            other_rx.updates.borrow_and_update().clone(),
            Some(update(2))
        );
        assert!(!origin_rx.updates.has_changed().expect("open"));
    }

    #[tokio::test]
    async fn stalled_client_sees_only_the_latest_update() {
        let hub = LobbyHub::default();
        let (_, mut rx) = hub.join();
        hub.broadcast(&update(1));
        hub.broadcast(&update(2));
        hub.broadcast(&update(3));
        assert!(rx.updates.changed().await.is_ok());
        assert_eq!(rx.updates.borrow_and_update().clone(), Some(update(3)));
        // Nothing older is queued behind it.
        assert!(!rx.updates.has_changed().expect("open"));
    }

    #[tokio::test]
    async fn full_critical_queue_evicts_the_client() {
        let hub = LobbyHub::new(1);
        let (_, mut rx) = hub.join();
        hub.broadcast(&warning());
        hub.broadcast(&warning());
        assert_eq!(hub.len(), 0);
        // The queued message is still delivered, then the channel closes.
        assert_eq!(rx.critical.recv().await, Some(warning()));
        assert_eq!(rx.critical.recv().await, None);
    }

    #[tokio::test]
    async fn send_to_targets_one_client() {
        let hub = LobbyHub::default();
        let (id, mut target) = hub.join();
        let (_, mut other) = hub.join();
        hub.send_to(id, warning());
        assert_eq!(target.critical.recv().await, Some(warning()));
        assert!(other.critical.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_stops_delivery() {
        let hub = LobbyHub::default();
        let (id, mut rx) = hub.join();
        assert_eq!(hub.len(), 1);
        hub.leave(id);
        assert_eq!(hub.len(), 0);
        assert_eq!(rx.critical.recv().await, None);
    }
}
