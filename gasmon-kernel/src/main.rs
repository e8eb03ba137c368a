/**
 * GASMON KERNEL - Point d'entrée du relais temps réel
 *
 * RÔLE : Orchestration : config, bus MQTT, router de diffusion, hub push,
 * stockage des alarmes/notifications, API HTTP, santé.
 *
 * ARCHITECTURE : capteurs -> bus -> normalisation -> rooms push -> clients.
 * Arrêt propre sur Ctrl-C via un canal watch partagé par toutes les boucles.
 */

mod bus;
mod config;
mod health;
mod http;
mod push;
mod router;
mod store;

use crate::bus::{mqtt_options, BusSubscriber, MqttPublisher};
use crate::config::load_config;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::push::PushHub;
use crate::router::FanoutRouter;
use crate::store::{JsonCollection, Repository};

use anyhow::Context;
use gasmon_common::{BusPublish, Normalizer, PushSink};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gasmon_kernel=info")))
        .init();

    let cfg = load_config().await;
    let plants = cfg.plant_directory();
    tracing::info!(plants = plants.entries().len(), bind = %cfg.http.bind, "kernel starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let health = HealthTracker::new();
    let normalizer = Arc::new(Normalizer::new(plants.clone()));

    // stockage
    let alarms = JsonCollection::open(cfg.data_dir.join("alarms.json")).context("failed to open alarms collection")?;
    let notifications = JsonCollection::open(cfg.data_dir.join("notifications.json"))
        .context("failed to open notifications collection")?;

    // canal push + diffusion
    let hub = PushHub::new(health.clone());
    let router = Arc::new(FanoutRouter::new(
        Arc::new(hub.clone()) as Arc<dyn PushSink>,
        plants,
        cfg.timing.notification_delay(),
        health.clone(),
        shutdown_rx.clone(),
    ));

    // bus MQTT
    let (client, eventloop) = rumqttc::AsyncClient::new(mqtt_options(&cfg.mqtt), 64);
    let subscriber = Arc::new(BusSubscriber::new(&cfg, (*normalizer).clone(), router.clone(), health.clone()));
    let bus_task = subscriber.spawn(client.clone(), eventloop, shutdown_rx.clone());
    let publisher: Arc<dyn BusPublish> = Arc::new(MqttPublisher::new(client));

    let app_state = AppState {
        alarms: Repository::new(Arc::new(alarms), normalizer.clone()),
        notifications: Repository::new(Arc::new(notifications), normalizer.clone()),
        normalizer,
        hub,
        router,
        health,
        publisher: Some(publisher),
        channels: cfg.channels.clone(),
    };

    let app = http::build_router(app_state);
    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http.bind))?;
    tracing::info!("listening on http://{}", cfg.http.bind);

    let mut http_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        gasmon_common::stopped(&mut http_shutdown).await;
    });

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            // garder le sender vivant : sa fermeture vaut arrêt
            std::future::pending::<()>().await;
        }
        tracing::info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    server.await.context("http server failed")?;
    if let Err(e) = bus_task.await {
        tracing::warn!(error = %e, "bus task ended abnormally");
    }
    tracing::info!("kernel stopped");
    Ok(())
}
