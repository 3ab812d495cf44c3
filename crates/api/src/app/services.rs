//! Infrastructure wiring: store selection, notification sink, outbox relay.

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use loomerp_infra::{
    HttpNotificationSink, InMemoryReceivingStore, NotificationSink, OutboxRelay,
    PostgresReceivingStore, ReceivingEngine, ReceivingStore, Settings, TracingNotificationSink,
    config::{NotificationSettings, OutboxSettings},
};

/// A running engine plus the background relay draining its outbox.
pub struct ReceivingServices<S> {
    pub engine: Arc<ReceivingEngine<S>>,
    pub relay_task: JoinHandle<()>,
}

pub fn notification_sink(settings: &NotificationSettings) -> anyhow::Result<Arc<dyn NotificationSink>> {
    match &settings.endpoint {
        Some(endpoint) => {
            let sink = HttpNotificationSink::new(endpoint.clone(), settings.timeout())
                .context("failed to build notification HTTP client")?;
            info!(endpoint = %endpoint, "notifications go to webhook");
            Ok(Arc::new(sink))
        }
        None => {
            info!("no notification endpoint configured; notifications are logged only");
            Ok(Arc::new(TracingNotificationSink))
        }
    }
}

/// Engine + relay over `store`. The relay both drains right after each commit
/// and polls for anything left behind (crashes, failed deliveries).
pub fn wire<S: ReceivingStore>(
    store: Arc<S>,
    sink: Arc<dyn NotificationSink>,
    outbox: &OutboxSettings,
) -> ReceivingServices<S> {
    let relay = Arc::new(
        OutboxRelay::new(store.clone(), sink, outbox.batch_size, outbox.max_attempts)
            .with_lease(outbox.lease()),
    );
    let relay_task = relay.clone().spawn(outbox.poll_interval());
    let engine = Arc::new(ReceivingEngine::new(store).with_relay(relay));
    ReceivingServices { engine, relay_task }
}

/// Pick the store from settings and serve the API until shutdown.
pub async fn serve(settings: Settings) -> anyhow::Result<()> {
    match &settings.database.url {
        Some(url) => {
            let store = PostgresReceivingStore::connect(url, settings.database.max_connections)
                .await
                .context("failed to connect to Postgres")?;
            store.migrate().await.context("failed to apply migrations")?;
            run(Arc::new(store), &settings).await
        }
        None => {
            warn!("no database configured; using the in-memory store (data is lost on restart)");
            run(Arc::new(InMemoryReceivingStore::new()), &settings).await
        }
    }
}

async fn run<S: ReceivingStore>(store: Arc<S>, settings: &Settings) -> anyhow::Result<()> {
    let sink = notification_sink(&settings.notification)?;
    let services = wire(store, sink, &settings.outbox);
    let app = crate::app::build_app(services.engine.clone());

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(address = %listener.local_addr()?, environment = %settings.environment, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    services.relay_task.abort();
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
