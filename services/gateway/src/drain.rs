// Graceful-drain coordinator. One per node, serialized behind a mutex.
//
// State machine: Running -> Draining -> Completing -> Exited, one-way.
// Draining stops admissions and warns connected clients; Completing
// reconciles this node's remaining contribution back into the global
// counter; Exited signals the process to leave.
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use hearth_common::ServerMessage;
use hearth_lobby::LobbyHub;
use hearth_state::{keys, StateStore};
use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainState {
    Running,
    Draining,
    Completing,
    Exited,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DrainStatus {
    pub state: DrainState,
    pub node_local_live: u64,
    pub draining_for_ms: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: DrainState,
    node_local_live: u64,
    shutdown_started_at: Option<Instant>,
}

#[derive(Debug)]
pub struct DrainCoordinator {
    inner: Mutex<Inner>,
    store: Arc<dyn StateStore>,
    lobby: Arc<LobbyHub>,
    force_complete: Duration,
    reconnect_delay_ms: u64,
    completed_tx: watch::Sender<bool>,
}

impl DrainCoordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        lobby: Arc<LobbyHub>,
        force_complete: Duration,
        reconnect_delay_ms: u64,
    ) -> Self {
        let (completed_tx, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner {
                state: DrainState::Running,
                node_local_live: 0,
                shutdown_started_at: None,
            }),
            store,
            lobby,
            force_complete,
            reconnect_delay_ms,
            completed_tx,
        }
    }

    /// Flips to true when the completion path has run.
    pub fn completed(&self) -> watch::Receiver<bool> {
        self.completed_tx.subscribe()
    }

    pub fn accepting(&self) -> bool {
        self.lock().state == DrainState::Running
    }

    pub fn register(&self) {
        let mut inner = self.lock();
        inner.node_local_live += 1;
        metrics::gauge!("hearth_node_live_connections").set(inner.node_local_live as f64);
    }

    pub fn unregister(self: Arc<Self>) {
        let drained = {
            let mut inner = self.lock();
            inner.node_local_live = inner.node_local_live.saturating_sub(1);
            metrics::gauge!("hearth_node_live_connections").set(inner.node_local_live as f64);
            inner.state == DrainState::Draining && inner.node_local_live == 0
        };
        if drained {
            // The last client left before the force timer fired.
            tokio::spawn(async move {
                self.on_completing().await;
            });
        }
    }

    /// Start draining. Idempotent; later calls are no-ops.
    pub fn begin_drain(self: Arc<Self>) {
        let live = {
            let mut inner = self.lock();
            if inner.state != DrainState::Running {
                return;
            }
            inner.state = DrainState::Draining;
            inner.shutdown_started_at = Some(Instant::now());
            inner.node_local_live
        };
        tracing::info!(live, "drain started");

        // Warn this node's clients only; other nodes keep serving.
        self.lobby.broadcast(&ServerMessage::ShutdownWarning {
            message: "server is restarting".to_string(),
            reconnect_delay: self.reconnect_delay_ms,
        });

        if live == 0 {
            tokio::spawn(async move {
                self.on_completing().await;
            });
            return;
        }

        let force_complete = self.force_complete;
        tokio::spawn(async move {
            tokio::time::sleep(force_complete).await;
            self.on_force_complete().await;
        });
    }

    /// Force-complete timer: give up waiting on stragglers.
    pub async fn on_force_complete(&self) {
        if self.lock().state == DrainState::Draining {
            tracing::warn!("drain force-complete deadline reached");
        }
        self.on_completing().await;
    }

    /// Reconcile this node's remaining contribution into the global counter
    /// and signal completion. Only the first caller past the Draining state
    /// does the work.
    pub async fn on_completing(&self) {
        let remaining = {
            let mut inner = self.lock();
            if inner.state != DrainState::Draining {
                return;
            }
            inner.state = DrainState::Completing;
            inner.node_local_live
        };

        if remaining > 0 {
            tracing::warn!(remaining, "reconciling counter for clients that never exited");
            match self
                .store
                .incr_by(keys::CONCURRENT_CONNECTIONS, -(remaining as i64))
                .await
            {
                Ok(post) if post < 0 => {
                    tracing::warn!(post, "counter went negative during reconcile, clamping");
                    if let Err(err) = self.store.set(keys::CONCURRENT_CONNECTIONS, "0").await {
                        tracing::warn!(error = %err, "counter clamp failed");
                    }
                }
                Ok(_) => {}
                // Best effort: the store may be the reason we are leaving.
                Err(err) => tracing::warn!(error = %err, "drain reconcile failed"),
            }
        }

        {
            let mut inner = self.lock();
            inner.state = DrainState::Exited;
        }
        let _ = self.completed_tx.send(true);
        tracing::info!("drain complete");
    }

    pub fn status(&self) -> DrainStatus {
        let inner = self.lock();
        DrainStatus {
            state: inner.state,
            node_local_live: inner.node_local_live,
            draining_for_ms: inner
                .shutdown_started_at
                .map(|started| started.elapsed().as_millis() as u64),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
