// Gateway node entry point.
//
// Exit codes: 0 clean drain, 1 drain hard-limit forced exit,
// 2 configuration/store setup error, 3 bind failure.
use std::net::SocketAddr;
use std::sync::Arc;

use hearth_gateway::config::GatewayConfig;
use hearth_gateway::{api, observability, AppContext};
use hearth_state::{initialize_counters, MemoryStore, RedisStore, StateStore};

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let metrics_handle = observability::init_observability();

    let config = match GatewayConfig::from_env_or_yaml() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "configuration error");
            return 2;
        }
    };

    let store: Arc<dyn StateStore> = match &config.redis_url {
        Some(url) => {
            match RedisStore::connect(url, config.store_pool_size, config.store_op_timeout()).await
            {
                Ok(store) => Arc::new(store),
                Err(err) => {
                    tracing::error!(error = %err, "store connection failed");
                    return 2;
                }
            }
        }
        None => {
            tracing::warn!("REDIS_URL unset; using the in-memory store (single node only)");
            Arc::new(MemoryStore::new())
        }
    };
    if let Err(err) = initialize_counters(store.as_ref()).await {
        tracing::error!(error = %err, "counter initialization failed");
        return 2;
    }

    let (app, tick_engine) = AppContext::build(config.clone(), store);
    tracing::info!(node = %app.node, "gateway node starting");

    app.spawn_bus_listener();
    app.admission.clone().run_sweeper();
    if config.tick_leader {
        tracing::info!(interval_secs = config.tick_interval_secs, "running the cluster tick");
        tokio::spawn(tick_engine.run());
    } else {
        tracing::info!("tick leadership held elsewhere");
        drop(tick_engine);
    }
    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let listener = match tokio::net::TcpListener::bind(config.bind).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, addr = %config.bind, "bind failed");
            return 3;
        }
    };
    match listener.local_addr() {
        Ok(addr) => tracing::info!(%addr, "gateway listening"),
        Err(_) => tracing::info!("gateway listening"),
    }

    let router = api::build_router(app.clone());
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    });

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");
    app.drain.clone().begin_drain();

    let mut completed = app.drain.completed();
    let exit_code = match tokio::time::timeout(
        config.drain_hard_limit(),
        completed.wait_for(|done| *done),
    )
    .await
    {
        Ok(_) => {
            tracing::info!("drained cleanly");
            0
        }
        Err(_) => {
            tracing::error!("drain hard limit reached, forcing exit");
            1
        }
    };
    server.abort();
    exit_code
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    tracing::error!(error = %err, "SIGTERM handler failed, falling back to ctrl-c");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
