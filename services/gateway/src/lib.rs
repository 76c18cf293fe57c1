// Gateway node internals, exposed as a library for the binary and the
// integration tests.
use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use hearth_admission::AdmissionController;
use hearth_lobby::LobbyHub;
use hearth_milestones::Engine;
use hearth_state::StateStore;

pub mod api;
pub mod config;
pub mod drain;
pub mod fanout;
pub mod gateway;
pub mod observability;
pub mod tick;

use config::GatewayConfig;
use drain::DrainCoordinator;
use fanout::Fanout;
use tick::{TickEngine, TickStats};

/// Everything a request handler or background task needs, cheap to clone.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<GatewayConfig>,
    pub store: Arc<dyn StateStore>,
    pub admission: Arc<AdmissionController>,
    pub lobby: Arc<LobbyHub>,
    pub milestones: Engine,
    pub fanout: Fanout,
    pub drain: Arc<DrainCoordinator>,
    pub tick_stats: watch::Receiver<TickStats>,
    pub node: Uuid,
}

impl AppContext {
    /// Wire the components together. The returned tick engine is spawned by
    /// the caller on the elected leader node (and driven directly in tests).
    pub fn build(config: GatewayConfig, store: Arc<dyn StateStore>) -> (Self, TickEngine) {
        let node = Uuid::new_v4();
        let lobby = Arc::new(LobbyHub::new(config.client_buffer));
        let admission = Arc::new(AdmissionController::new(store.clone(), config.admission()));
        let milestones = Engine::new(store.clone());
        let fanout = Fanout::new(store.clone(), node);
        let drain = Arc::new(DrainCoordinator::new(
            store.clone(),
            lobby.clone(),
            config.drain_force_complete(),
            config.reconnect_delay_ms,
        ));
        let (tick_engine, tick_stats) = TickEngine::new(
            store.clone(),
            milestones.clone(),
            fanout.clone(),
            config.tick_interval(),
        );
        (
            Self {
                config: Arc::new(config),
                store,
                admission,
                lobby,
                milestones,
                fanout,
                drain,
                tick_stats,
                node,
            },
            tick_engine,
        )
    }

    /// Start the cluster-broadcast listener feeding the local lobby.
    pub fn spawn_bus_listener(&self) -> tokio::task::JoinHandle<()> {
        let fanout = self.fanout.clone();
        let lobby = self.lobby.clone();
        tokio::spawn(async move {
            if let Err(err) = fanout.run_listener(lobby).await {
                tracing::error!(error = %err, "bus listener exited");
            }
        })
    }
}
