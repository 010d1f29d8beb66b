use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use crypto_core::InMemoryKeyStore;
use delivery_service::{
    config::Config, error::AppError, jobs::DeliveryJobHandler, jobs::LoggingNotifier, logging,
    metrics::MetricsMiddleware, routes, state::AppState,
};
use job_queue::{InMemoryJobStore, JobStore, RedisJobStore, WorkerPool};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Request bodies larger than this are rejected.
const JSON_LIMIT_BYTES: usize = 256 * 1024;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn spawn_signaling_sweeper(
    state: &AppState,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let relay = state.relay.clone();
    let period = state.config.signaling_ttl;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    relay.purge_expired();
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    logging::init_tracing();
    let cfg = Config::from_env()?;

    let store: Arc<dyn JobStore> = if cfg.uses_redis() {
        Arc::new(
            RedisJobStore::connect(&cfg.queue_backend_url)
                .await
                .map_err(|e| AppError::StartServer(format!("queue backend: {e}")))?,
        )
    } else {
        tracing::warn!("QUEUE_BACKEND_URL is memory://; jobs do not survive a restart");
        Arc::new(InMemoryJobStore::new())
    };

    let system = cfg.system_keyring()?;
    let state = AppState::new(cfg, store, Arc::new(InMemoryKeyStore::new()), system);
    state
        .delivery
        .register_system_key()
        .await
        .map_err(|e| AppError::StartServer(format!("system key: {e}")))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handler = Arc::new(DeliveryJobHandler::new(
        state.broker.clone(),
        Arc::new(LoggingNotifier),
    ));
    let workers = WorkerPool::new(state.queue.clone(), handler, state.config.worker_config())
        .spawn(shutdown_rx.clone());
    let dead_letter_relay = state.delivery.spawn_dead_letter_relay(shutdown_rx.clone());
    let sweeper = spawn_signaling_sweeper(&state, shutdown_rx);

    let bind_addr = format!("0.0.0.0:{}", state.config.port);
    tracing::info!(
        %bind_addr,
        stream_path = %state.config.event_stream_path,
        queue_backend = if state.config.uses_redis() { "redis" } else { "memory" },
        "starting delivery-service"
    );

    let app_state = state.clone();
    let server = HttpServer::new(move || {
        let stream_path = app_state.config.event_stream_path.clone();
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::JsonConfig::default().limit(JSON_LIMIT_BYTES))
            .wrap(MetricsMiddleware)
            .configure(|cfg| routes::register_routes(cfg, &stream_path))
    })
    .disable_signals()
    .bind(&bind_addr)
    .map_err(|e| AppError::StartServer(format!("bind {bind_addr}: {e}")))?
    .run();

    let server_handle = server.handle();
    let broker = state.broker.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");

        // Open event streams would otherwise hold the graceful stop open.
        broker.close_all();
        let _ = shutdown_tx.send(true);
        server_handle.stop(true).await;
    });

    server
        .await
        .map_err(|e| AppError::StartServer(format!("run: {e}")))?;

    workers.join().await;
    let _ = dead_letter_relay.await;
    let _ = sweeper.await;

    tracing::info!("delivery-service stopped");
    Ok(())
}
