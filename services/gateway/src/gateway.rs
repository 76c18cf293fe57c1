// The admission/upgrade path for client sockets.
//
// Clients are silent witnesses: after the upgrade the server streams state
// at them and discards everything they send apart from liveness frames. A
// single writer task owns the socket sink; the reader only enforces the
// heartbeat deadline and notices the close.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

use hearth_admission::{Decision, RejectReason};
use hearth_common::ServerMessage;
use hearth_lobby::{ClientId, ClientReceiver};
use hearth_state::{keys, load_snapshot};

use crate::config::GatewayConfig;
use crate::AppContext;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(app): State<AppContext>,
) -> Response {
    let source = source_id(&app.config, &headers, peer);

    match app.admission.check(&source).await {
        Decision::Rejected(reason) => {
            tracing::debug!(source, reason = reason.as_str(), "admission refused");
            return refusal(reason);
        }
        Decision::Allowed => {}
    }
    if !app.drain.accepting() {
        return (StatusCode::SERVICE_UNAVAILABLE, "draining").into_response();
    }

    app.admission.record(&source);
    app.drain.register();
    ws.on_upgrade(move |socket| client_session(socket, app, source))
}

fn refusal(reason: RejectReason) -> Response {
    let status = match reason {
        RejectReason::SourceRateLimited | RejectReason::GlobalRateLimited => {
            StatusCode::TOO_MANY_REQUESTS
        }
        RejectReason::CapacityExceeded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, reason.as_str()).into_response()
}

/// Per-source key for admission limits. Peer address by default; the
/// leftmost X-Forwarded-For entry when the deployment says the balancer
/// can be trusted to set it.
pub(crate) fn source_id(config: &GatewayConfig, headers: &HeaderMap, peer: SocketAddr) -> String {
    if config.trust_forwarded_for {
        if let Some(first) = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
        {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    peer.ip().to_string()
}

async fn client_session(mut socket: WebSocket, app: AppContext, source: String) {
    // Commit the global counter before the lobby sees the client. A failure
    // here aborts the admission: state integrity beats accepting one client.
    let new_count = match app.store.incr(keys::CONCURRENT_CONNECTIONS).await {
        Ok(count) => count.max(0) as u64,
        Err(err) => {
            tracing::warn!(error = %err, "admit aborted: counter increment failed");
            app.drain.clone().unregister();
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    metrics::counter!("hearth_connections_total").increment(1);
    tracing::debug!(source, live = new_count, "client connected");

    let (client, sinks) = app.lobby.join();
    // Set once the increment commits; consumed by exactly one teardown.
    let committed = Arc::new(AtomicBool::new(true));

    post_join(&app, client, new_count).await;

    let (ws_tx, ws_rx) = socket.split();
    let heartbeat = app.config.heartbeat_timeout();
    let mut writer = tokio::spawn(write_loop(ws_tx, sinks, heartbeat / 2));
    let mut reader = tokio::spawn(read_loop(ws_rx, heartbeat));
    // Whichever half finishes first takes the other down with it.
    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    teardown(&app, client, &committed).await;
    tracing::debug!(source, "client disconnected");
}

// Runs after the upgrade handshake: evaluate milestones at the new count,
// welcome this client with the full snapshot, then tell everyone else.
async fn post_join(app: &AppContext, client: ClientId, new_count: u64) {
    let mut snapshot = match load_snapshot(app.store.as_ref()).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            // The client still hears about the world at the next tick.
            tracing::warn!(error = %err, "post-join snapshot unavailable");
            return;
        }
    };
    snapshot.concurrent_connections = new_count;

    let unlocked = match app.milestones.evaluate(snapshot).await {
        Ok(unlocked) => unlocked,
        Err(err) => {
            tracing::warn!(error = %err, "post-join milestone evaluation skipped");
            Vec::new()
        }
    };
    if snapshot.peak_connections < new_count {
        snapshot.peak_connections = new_count;
    }

    // Welcome goes first on the critical queue, before the client becomes
    // eligible for any broadcast below.
    let milestones = app.milestones.unlocked_records().await.unwrap_or_default();
    app.lobby.send_to(
        client,
        ServerMessage::Welcome {
            concurrent_connections: snapshot.concurrent_connections,
            total_connection_seconds: snapshot.total_connection_seconds,
            peak_connections: snapshot.peak_connections,
            unlocked_milestones: milestones,
        },
    );

    for milestone in unlocked {
        if let Err(err) = app
            .fanout
            .publish(ServerMessage::EvolutionEvent { milestone })
            .await
        {
            tracing::warn!(error = %err, "milestone broadcast failed");
        }
    }
    if let Err(err) = app
        .fanout
        .publish_excluding(client, ServerMessage::state_update(snapshot))
        .await
    {
        tracing::warn!(error = %err, "join state update failed");
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    sinks: ClientReceiver,
    ping_period: Duration,
) {
    let ClientReceiver {
        mut updates,
        mut critical,
    } = sinks;
    let mut ping = tokio::time::interval(ping_period.max(Duration::from_secs(1)));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let message = updates.borrow_and_update().clone();
                if let Some(message) = message {
                    if send_json(&mut ws_tx, &message).await.is_err() {
                        break;
                    }
                }
            }
            message = critical.recv() => {
                match message {
                    Some(message) => {
                        if send_json(&mut ws_tx, &message).await.is_err() {
                            break;
                        }
                    }
                    // Closed channel: the client left or the hub evicted it.
                    None => break,
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

async fn send_json(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(message) {
        Ok(text) => ws_tx.send(Message::Text(text)).await,
        Err(err) => {
            tracing::error!(error = %err, "server message failed to encode");
            Ok(())
        }
    }
}

// Inbound frames carry no meaning; any frame refreshes the heartbeat
// deadline, and silence past the deadline ends the session.
async fn read_loop(mut ws_rx: SplitStream<WebSocket>, heartbeat: Duration) {
    loop {
        match tokio::time::timeout(heartbeat, ws_rx.next()).await {
            Err(_) => {
                tracing::debug!("heartbeat deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                tracing::debug!(error = %err, "client frame error");
                metrics::counter!("hearth_protocol_errors_total").increment(1);
                break;
            }
            Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(_))) => {}
        }
    }
}

/// Undo one admission. Both socket halves funnel here; the committed flag
/// makes sure duplicate teardown paths decrement exactly once.
pub async fn teardown(app: &AppContext, client: ClientId, committed: &AtomicBool) {
    if !committed.swap(false, Ordering::SeqCst) {
        return;
    }
    app.lobby.leave(client);
    match app.store.decr(keys::CONCURRENT_CONNECTIONS).await {
        Ok(post) if post < 0 => {
            tracing::warn!(post, "counter went negative after disconnect, clamping");
            if let Err(err) = app.store.set(keys::CONCURRENT_CONNECTIONS, "0").await {
                tracing::warn!(error = %err, "counter clamp failed");
            }
        }
        Ok(_) => {}
        Err(err) => tracing::warn!(error = %err, "disconnect decrement failed"),
    }
    app.drain.clone().unregister();
    match load_snapshot(app.store.as_ref()).await {
        Ok(snapshot) => {
            if let Err(err) = app
                .fanout
                .publish(ServerMessage::state_update(snapshot))
                .await
            {
                tracing::debug!(error = %err, "post-disconnect state update failed");
            }
        }
        Err(err) => tracing::debug!(error = %err, "post-disconnect snapshot unavailable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use hearth_state::{MemoryStore, StateStore};

    fn peer() -> SocketAddr {
        "1.2.3.4:55110".parse().expect("addr")
    }

    #[test]
    fn source_id_defaults_to_peer_ip() {
        let config = GatewayConfig::for_tests();
        let headers = HeaderMap::new();
        assert_eq!(source_id(&config, &headers, peer()), "1.2.3.4");
    }

    #[test]
    fn forwarded_for_is_ignored_unless_trusted() {
        let mut config = GatewayConfig::for_tests();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "9.9.9.9, 10.0.0.1".parse().expect("header"),
        );
        assert_eq!(source_id(&config, &headers, peer()), "1.2.3.4");
        config.trust_forwarded_for = true;
        assert_eq!(source_id(&config, &headers, peer()), "9.9.9.9");
    }

    #[test]
    fn empty_forwarded_for_falls_back_to_peer() {
        let mut config = GatewayConfig::for_tests();
        config.trust_forwarded_for = true;
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "".parse().expect("header"));
        assert_eq!(source_id(&config, &headers, peer()), "1.2.3.4");
    }

    #[tokio::test]
    async fn duplicate_teardown_decrements_once() {
        let store = Arc::new(MemoryStore::new());
        let (app, _tick) = AppContext::build(GatewayConfig::for_tests(), store.clone());
        store
            .set(keys::CONCURRENT_CONNECTIONS, "2")
            .await
            .expect("seed");
        app.drain.register();
        let (client, _rx) = app.lobby.join();
        let committed = AtomicBool::new(true);

        teardown(&app, client, &committed).await;
        teardown(&app, client, &committed).await;

        assert_eq!(
            store
                .get_int(keys::CONCURRENT_CONNECTIONS)
                .await
                .expect("get"),
            Some(1)
        );
    }

    #[tokio::test]
    async fn teardown_clamps_negative_counters() {
        let store = Arc::new(MemoryStore::new());
        let (app, _tick) = AppContext::build(GatewayConfig::for_tests(), store.clone());
        app.drain.register();
        let (client, _rx) = app.lobby.join();
        let committed = AtomicBool::new(true);

        // Counter was never incremented (e.g. repaired elsewhere); the
        // decrement would go negative and must be clamped back to zero.
        teardown(&app, client, &committed).await;
        assert_eq!(
            store
                .get_int(keys::CONCURRENT_CONNECTIONS)
                .await
                .expect("get"),
            Some(0)
        );
    }
}
