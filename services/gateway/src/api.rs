// Operator HTTP surface: health probes and state metrics, all JSON.
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use hearth_admission::AdmissionStats;
use hearth_common::StateSnapshot;
use hearth_milestones::{unix_now, CATALOG};
use hearth_state::{keys, load_snapshot, StoreError};

use crate::drain::DrainStatus;
use crate::gateway;
use crate::tick::TickStats;
use crate::AppContext;

const PEAK_HISTORY_WINDOW_SECS: u64 = 24 * 3600;

pub fn build_router(app: AppContext) -> Router {
    Router::new()
        .route("/ws", get(gateway::ws_handler))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/health/status", get(health_status))
        .route("/metrics/state", get(metrics_state))
        .route("/metrics/evolution", get(metrics_evolution))
        .route("/metrics/peak-history", get(metrics_peak_history))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn store_unavailable(err: &StoreError) -> ApiError {
    tracing::warn!(error = %err, "store unavailable for operator request");
    ApiError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        body: ErrorResponse {
            code: "store_unavailable".to_string(),
            message: err.to_string(),
        },
    }
}

#[derive(Debug, Serialize)]
struct LiveStatus {
    status: &'static str,
}

// Unconditional while the process runs.
async fn health_live() -> Json<LiveStatus> {
    Json(LiveStatus { status: "ok" })
}

#[derive(Debug, Serialize)]
struct ReadyReport {
    status: &'static str,
    store: bool,
    tick: bool,
    gateway: bool,
}

async fn health_ready(State(app): State<AppContext>) -> Response {
    let store = app.store.ping().await.is_ok();
    // Non-leaders carry no tick; only the elected node gates on freshness.
    let tick = !app.config.tick_leader
        || app
            .tick_stats
            .borrow()
            .is_fresh(app.config.tick_interval());
    let gateway = app.drain.accepting();
    let ready = store && tick && gateway;
    let report = ReadyReport {
        status: if ready { "ready" } else { "unready" },
        store,
        tick,
        gateway,
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

#[derive(Debug, Serialize)]
struct StoreStatus {
    reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    counters: Option<StateSnapshot>,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    store: StoreStatus,
    tick: TickStats,
    admission: AdmissionStats,
    drain: DrainStatus,
}

async fn health_status(State(app): State<AppContext>) -> Json<StatusReport> {
    let reachable = app.store.ping().await.is_ok();
    let counters = load_snapshot(app.store.as_ref()).await.ok();
    Json(StatusReport {
        store: StoreStatus {
            reachable,
            counters,
        },
        tick: *app.tick_stats.borrow(),
        admission: app.admission.stats(),
        drain: app.drain.status(),
    })
}

async fn metrics_state(State(app): State<AppContext>) -> Result<Json<StateSnapshot>, ApiError> {
    load_snapshot(app.store.as_ref())
        .await
        .map(Json)
        .map_err(|err| store_unavailable(&err))
}

#[derive(Debug, Serialize)]
struct EvolutionReport {
    unlocked_count: usize,
    total_count: usize,
    progress_pct: f64,
    current_state: StateSnapshot,
}

async fn metrics_evolution(
    State(app): State<AppContext>,
) -> Result<Json<EvolutionReport>, ApiError> {
    let unlocked = app
        .milestones
        .unlocked_records()
        .await
        .map_err(|err| store_unavailable(&err))?;
    let current_state = load_snapshot(app.store.as_ref())
        .await
        .map_err(|err| store_unavailable(&err))?;
    let total_count = CATALOG.len();
    let progress_pct =
        (unlocked.len() as f64 / total_count as f64 * 1000.0).round() / 10.0;
    Ok(Json(EvolutionReport {
        unlocked_count: unlocked.len(),
        total_count,
        progress_pct,
        current_state,
    }))
}

#[derive(Debug, Serialize, PartialEq)]
struct PeakPoint {
    timestamp: u64,
    peak_value: u64,
}

async fn metrics_peak_history(
    State(app): State<AppContext>,
) -> Result<Json<Vec<PeakPoint>>, ApiError> {
    let now = unix_now();
    let members = app
        .store
        .sorted_range_by_score(
            keys::PEAK_HISTORY,
            now.saturating_sub(PEAK_HISTORY_WINDOW_SECS) as f64,
            now as f64,
        )
        .await
        .map_err(|err| store_unavailable(&err))?;
    let points = members
        .iter()
        .filter_map(|member| parse_peak_member(member))
        .collect();
    Ok(Json(points))
}

fn parse_peak_member(member: &str) -> Option<PeakPoint> {
    let (timestamp, value) = member.split_once(':')?;
    Some(PeakPoint {
        timestamp: timestamp.parse().ok()?,
        peak_value: value.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_members_parse_and_reject_garbage() {
        assert_eq!(
            parse_peak_member("1700000000:42"),
            Some(PeakPoint {
                timestamp: 1_700_000_000,
                peak_value: 42
            })
        );
        assert_eq!(parse_peak_member("no-colon"), None);
        assert_eq!(parse_peak_member("x:1"), None);
        assert_eq!(parse_peak_member("1:"), None);
    }
}
