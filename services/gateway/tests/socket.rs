// End-to-end socket lifecycle against an in-process listener.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use hearth_common::ServerMessage;
use hearth_gateway::config::GatewayConfig;
use hearth_gateway::{api, AppContext};
use hearth_state::{keys, MemoryStore, StateStore};

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_node(config: GatewayConfig) -> (AppContext, SocketAddr, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let (app, _tick) = AppContext::build(config, store.clone());
    app.spawn_bus_listener();
    // Let the bus listener subscribe before any traffic publishes.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let router = api::build_router(app.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    });
    (app, addr, store)
}

async fn connect(addr: SocketAddr) -> ClientSocket {
    let (socket, _response) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("connect");
    socket
}

async fn next_message(socket: &mut ClientSocket) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timely frame")
            .expect("open socket")
            .expect("clean frame");
        match frame {
            Message::Text(text) => {
                return serde_json::from_str(&text).expect("server message");
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn wait_for_live(store: &MemoryStore, expected: i64) {
    for _ in 0..100 {
        if store
            .get_int(keys::CONCURRENT_CONNECTIONS)
            .await
            .expect("get")
            .unwrap_or(0)
            == expected
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("live count never reached {expected}");
}

#[tokio::test]
async fn first_client_gets_welcome_then_evolution() {
    let (_app, addr, store) = start_node(GatewayConfig::for_tests()).await;
    let mut socket = connect(addr).await;

    // The welcome always arrives first, carrying the just-unlocked list.
    let welcome = next_message(&mut socket).await;
    match welcome {
        ServerMessage::Welcome {
            concurrent_connections,
            peak_connections,
            unlocked_milestones,
            ..
        } => {
            assert_eq!(concurrent_connections, 1);
            assert_eq!(peak_connections, 1);
            assert!(unlocked_milestones
                .iter()
                .any(|record| record.id == "first_awakening"));
        }
        other => panic!("expected welcome, got {other:?}"),
    }

    // The unlock broadcast follows through the cluster bus.
    loop {
        match next_message(&mut socket).await {
            ServerMessage::EvolutionEvent { milestone } => {
                assert_eq!(milestone.id, "first_awakening");
                break;
            }
            ServerMessage::StateUpdate { .. } => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }

    assert_eq!(
        store
            .get_int(keys::CONCURRENT_CONNECTIONS)
            .await
            .expect("get"),
        Some(1)
    );

    socket.close(None).await.expect("close");
    wait_for_live(&store, 0).await;
}

#[tokio::test]
async fn second_client_sees_the_raised_count() {
    let (_app, addr, store) = start_node(GatewayConfig::for_tests()).await;
    let mut first = connect(addr).await;
    let _ = next_message(&mut first).await;
    wait_for_live(&store, 1).await;

    let mut second = connect(addr).await;
    match next_message(&mut second).await {
        ServerMessage::Welcome {
            concurrent_connections,
            ..
        } => assert_eq!(concurrent_connections, 2),
        other => panic!("expected welcome, got {other:?}"),
    }

    // The first client hears about the join without reconnecting.
    loop {
        match next_message(&mut first).await {
            ServerMessage::StateUpdate {
                concurrent_connections,
                ..
            } if concurrent_connections == 2 => break,
            ServerMessage::StateUpdate { .. } | ServerMessage::EvolutionEvent { .. } => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

#[tokio::test]
async fn rate_limited_source_is_refused_with_429() {
    let mut config = GatewayConfig::for_tests();
    config.connections_per_ip_per_minute = 2;
    let (_app, addr, _store) = start_node(config).await;

    let mut sockets = Vec::new();
    for _ in 0..2 {
        sockets.push(connect(addr).await);
    }
    match connect_async(format!("ws://{addr}/ws")).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 429);
        }
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("third connection should be refused"),
    }
}

#[tokio::test]
async fn drain_warns_clients_and_refuses_newcomers() {
    let mut config = GatewayConfig::for_tests();
    // Generous force timer: completion must come from clients leaving.
    config.drain_force_complete_ms = 10_000;
    let (app, addr, store) = start_node(config).await;

    let mut first = connect(addr).await;
    let mut second = connect(addr).await;
    let _ = next_message(&mut first).await;
    let _ = next_message(&mut second).await;
    wait_for_live(&store, 2).await;

    app.drain.clone().begin_drain();

    for socket in [&mut first, &mut second] {
        loop {
            match next_message(socket).await {
                ServerMessage::ShutdownWarning {
                    reconnect_delay, ..
                } => {
                    assert!(reconnect_delay > 0);
                    break;
                }
                ServerMessage::StateUpdate { .. } | ServerMessage::EvolutionEvent { .. } => {
                    continue
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    match connect_async(format!("ws://{addr}/ws")).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 503);
        }
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("admissions must stop during drain"),
    }

    let mut completed = app.drain.completed();
    first.close(None).await.expect("close");
    second.close(None).await.expect("close");
    tokio::time::timeout(Duration::from_secs(5), completed.wait_for(|done| *done))
        .await
        .expect("drain completes once clients leave")
        .expect("watch open");
    wait_for_live(&store, 0).await;
}
