// Cluster-wide broadcast bridge.
//
// Every state change is published as a JSON frame on the store's lobby
// channel; each node (the publisher included) receives every frame exactly
// once and performs local per-sink delivery. The optional exclusion only
// applies on the origin node, since the excluded handle lives there.
use std::sync::Arc;

use bytes::Bytes;
use hearth_common::ServerMessage;
use hearth_lobby::{ClientId, LobbyHub};
use hearth_state::{keys, StateStore, StoreError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct BusFrame {
    origin: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    exclude: Option<ClientId>,
    message: ServerMessage,
}

#[derive(Debug, Clone)]
pub struct Fanout {
    store: Arc<dyn StateStore>,
    node: Uuid,
}

impl Fanout {
    pub fn new(store: Arc<dyn StateStore>, node: Uuid) -> Self {
        Self { store, node }
    }

    pub async fn publish(&self, message: ServerMessage) -> hearth_state::Result<()> {
        self.publish_frame(None, message).await
    }

    pub async fn publish_excluding(
        &self,
        exclude: ClientId,
        message: ServerMessage,
    ) -> hearth_state::Result<()> {
        self.publish_frame(Some(exclude), message).await
    }

    async fn publish_frame(
        &self,
        exclude: Option<ClientId>,
        message: ServerMessage,
    ) -> hearth_state::Result<()> {
        let frame = BusFrame {
            origin: self.node,
            exclude,
            message,
        };
        let payload =
            serde_json::to_vec(&frame).map_err(|err| StoreError::Command(err.to_string()))?;
        self.store
            .publish(keys::LOBBY_CHANNEL, Bytes::from(payload))
            .await
    }

    /// Consume bus frames and deliver them to the local lobby. Runs for the
    /// life of the node; returning means the bus subscription is gone.
    pub async fn run_listener(self, lobby: Arc<LobbyHub>) -> hearth_state::Result<()> {
        let mut frames = self.store.subscribe(keys::LOBBY_CHANNEL).await?;
        while let Some(payload) = frames.recv().await {
            match serde_json::from_slice::<BusFrame>(&payload) {
                Ok(frame) => match frame.exclude {
                    Some(exclude) if frame.origin == self.node => {
                        lobby.broadcast_from(exclude, &frame.message)
                    }
                    _ => lobby.broadcast(&frame.message),
                },
                Err(err) => {
                    tracing::warn!(error = %err, "discarding malformed bus frame");
                    metrics::counter!("hearth_bus_malformed_frames_total").increment(1);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_common::StateSnapshot;
    use hearth_state::MemoryStore;
    use std::time::Duration;

    fn update(n: u64) -> ServerMessage {
        ServerMessage::state_update(StateSnapshot {
            concurrent_connections: n,
            total_connection_seconds: 0,
            peak_connections: n,
        })
    }

    #[tokio::test]
    async fn frames_reach_lobbies_on_every_node() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let lobby_a = Arc::new(LobbyHub::default());
        let lobby_b = Arc::new(LobbyHub::default());
        let fanout_a = Fanout::new(store.clone(), Uuid::new_v4());
        let fanout_b = Fanout::new(store.clone(), Uuid::new_v4());
        tokio::spawn(fanout_a.clone().run_listener(lobby_a.clone()));
        tokio::spawn(fanout_b.run_listener(lobby_b.clone()));
        // Let both listeners subscribe before publishing.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (_, mut rx_a) = lobby_a.join();
        let (_, mut rx_b) = lobby_b.join();
        fanout_a.publish(update(4)).await.expect("publish");

        for rx in [&mut rx_a, &mut rx_b] {
            tokio::time::timeout(Duration::from_secs(1), rx.updates.changed())
                .await
                .expect("timely")
                .expect("open");
            assert_eq!(rx.updates.borrow_and_update().clone(), Some(update(4)));
        }
    }

    #[tokio::test]
    async fn exclusion_applies_only_on_the_origin_node() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let lobby_origin = Arc::new(LobbyHub::default());
        let lobby_remote = Arc::new(LobbyHub::default());
        let origin = Fanout::new(store.clone(), Uuid::new_v4());
        let remote = Fanout::new(store.clone(), Uuid::new_v4());
        tokio::spawn(origin.clone().run_listener(lobby_origin.clone()));
        tokio::spawn(remote.run_listener(lobby_remote.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (excluded, mut excluded_rx) = lobby_origin.join();
        let (remote_id, mut remote_rx) = lobby_remote.join();
        // Fresh hubs allocate the same first id: the exclusion must not leak
        // to the remote node even though the ids collide.
        assert_eq!(excluded, remote_id);

        origin
            .publish_excluding(excluded, update(9))
            .await
            .expect("publish");

        tokio::time::timeout(Duration::from_secs(1), remote_rx.updates.changed())
            .await
            .expect("timely")
            .expect("open");
        assert_eq!(remote_rx.updates.borrow_and_update().clone(), Some(update(9)));
        assert!(!excluded_rx.updates.has_changed().expect("open"));
    }

    #[tokio::test]
    async fn malformed_frames_are_discarded() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let lobby = Arc::new(LobbyHub::default());
        let fanout = Fanout::new(store.clone(), Uuid::new_v4());
        tokio::spawn(fanout.clone().run_listener(lobby.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (_, mut rx) = lobby.join();
        store
            .publish(keys::LOBBY_CHANNEL, Bytes::from_static(b"not json"))
            .await
            .expect("publish");
        fanout.publish(update(2)).await.expect("publish");

        // The good frame still arrives after the bad one is dropped.
        tokio::time::timeout(Duration::from_secs(1), rx.updates.changed())
            .await
            .expect("timely")
            .expect("open");
        assert_eq!(rx.updates.borrow_and_update().clone(), Some(update(2)));
    }
}
