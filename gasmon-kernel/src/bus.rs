/**
 * BUS SUBSCRIBER - Abonnement MQTT aux canaux telemetry / alarms
 *
 * RÔLE :
 * Possède la connexion au bus, normalise chaque payload reçu et le passe
 * au FanoutRouter. Publie périodiquement la santé du kernel (sonde de vie).
 *
 * FONCTIONNEMENT :
 * - Machine d'états Disconnected -> Connecting -> Subscribed -> Disconnected
 * - ConnAck : abonnement aux deux canaux en QoS AtLeastOnce
 * - Erreur de connexion : backoff exponentiel borné puis nouvelle tentative
 * - Abonnement ou sonde refusés sur une connexion établie : retour en
 *   Connecting, ré-abonnement + sonde planifiés après le délai de backoff
 * - Payload illisible : warn, compteur `dropped`, l'abonné continue
 *
 * UTILITÉ :
 * 🎯 Ordre garanti par canal uniquement (une seule tâche de poll)
 * 🎯 Aucune attente sur la file de requêtes depuis la boucle de poll
 *    (try_subscribe / try_publish), sinon interblocage
 */

use crate::config::{ChannelsConf, KernelConfig, MqttConf};
use crate::health::{BusStatus, HealthTracker};
use crate::router::FanoutRouter;
use futures_util::future::BoxFuture;
use gasmon_common::{Backoff, BusPublish, CanonicalRecord, Normalizer, PublishError, RecordKind};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<BusError> for PublishError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::Serialization(e) => PublishError::Serialization(e),
            other => PublishError::Rejected(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Disconnected,
    Connecting,
    Subscribed,
}

pub fn mqtt_options(conf: &MqttConf) -> MqttOptions {
    let mut opts = MqttOptions::new(&conf.client_id, &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(15));
    opts
}

pub struct BusSubscriber {
    channels: ChannelsConf,
    normalizer: Normalizer,
    router: Arc<FanoutRouter>,
    health: HealthTracker,
    probe_interval: Duration,
    state: Mutex<BusState>,
    backoff: Mutex<Backoff>,
    /// Échéance de la prochaine reprise quand la connexion est dégradée
    retry_at: Mutex<Option<Instant>>,
}

impl BusSubscriber {
    pub fn new(config: &KernelConfig, normalizer: Normalizer, router: Arc<FanoutRouter>, health: HealthTracker) -> Self {
        Self {
            channels: config.channels.clone(),
            normalizer,
            router,
            health,
            probe_interval: config.timing.probe_interval(),
            state: Mutex::new(BusState::Disconnected),
            backoff: Mutex::new(Backoff::new(
                Duration::from_millis(config.timing.reconnect_base_ms),
                Duration::from_millis(config.timing.reconnect_max_ms),
            )),
            retry_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> BusState {
        *self.state.lock()
    }

    fn set_state(&self, state: BusState) {
        *self.state.lock() = state;
        match state {
            BusState::Connecting => self.health.set_bus_status(BusStatus::Connecting),
            BusState::Subscribed => self.health.set_bus_status(BusStatus::Connected),
            BusState::Disconnected => self.health.set_bus_status(BusStatus::Disconnected),
        }
    }

    fn kind_for(&self, topic: &str) -> Option<RecordKind> {
        if topic == self.channels.telemetry {
            Some(RecordKind::Telemetry)
        } else if topic == self.channels.alarms {
            Some(RecordKind::Alarm)
        } else {
            None
        }
    }

    /// Traite un message du bus : parse, normalise, route.
    /// Retourne l'enregistrement canonique diffusé, ou None si le message est écarté.
    pub fn handle_publish(&self, topic: &str, payload: &[u8]) -> Option<CanonicalRecord> {
        let Some(kind) = self.kind_for(topic) else {
            tracing::debug!(topic, "message on unhandled topic ignored");
            return None;
        };
        self.health.record_received(topic);

        let raw = match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                tracing::warn!(topic, kind = %kind, value_type = json_type(&other), "payload is not a JSON object, dropped");
                self.health.record_dropped(topic);
                return None;
            }
            Err(e) => {
                tracing::warn!(topic, kind = %kind, error = %e, bytes = payload.len(), "invalid JSON payload, dropped");
                self.health.record_dropped(topic);
                return None;
            }
        };

        let record = self.normalizer.normalize(&raw, kind);
        self.router.dispatch(&record);
        Some(record)
    }

    /// ConnAck : abonnement aux canaux, passage en Subscribed
    pub fn on_connected(&self, client: &AsyncClient) -> Result<(), BusError> {
        if let Err(e) = self.subscribe_channels(client) {
            self.degrade("subscribe", &e);
            return Err(e);
        }
        self.mark_subscribed();
        Ok(())
    }

    /// Perte de connexion : retourne le délai avant la prochaine tentative
    pub fn on_connection_error(&self, error: &ConnectionError) -> Duration {
        *self.retry_at.lock() = None;
        self.set_state(BusState::Disconnected);
        self.health.increment_reconnects();
        let delay = self.backoff.lock().next_delay();
        tracing::warn!(error = %error, retry_in_ms = delay.as_millis() as u64, "bus connection lost");
        delay
    }

    /// Sonde de vie : publie la santé du kernel si le bus est abonné
    pub fn probe(&self, client: &AsyncClient) -> Result<(), BusError> {
        if self.state() != BusState::Subscribed {
            tracing::debug!(state = ?self.state(), "bus probe skipped, not subscribed");
            return Ok(());
        }
        if let Err(e) = self.publish_health(client) {
            self.degrade("probe", &e);
            return Err(e);
        }
        Ok(())
    }

    /// Reprise d'une connexion dégradée : ré-abonnement puis sonde.
    /// Un nouvel échec allonge le backoff.
    pub fn recover(&self, client: &AsyncClient) -> Result<(), BusError> {
        *self.retry_at.lock() = None;
        let attempt = self.subscribe_channels(client).and_then(|()| self.publish_health(client));
        match attempt {
            Ok(()) => {
                self.mark_subscribed();
                Ok(())
            }
            Err(e) => {
                self.degrade("recover", &e);
                Err(e)
            }
        }
    }

    /// Échéance de reprise, None si rien n'est planifié
    pub fn retry_deadline(&self) -> Option<Instant> {
        *self.retry_at.lock()
    }

    fn subscribe_channels(&self, client: &AsyncClient) -> Result<(), BusError> {
        for channel in [&self.channels.telemetry, &self.channels.alarms] {
            client.try_subscribe(channel.as_str(), QoS::AtLeastOnce)?;
        }
        Ok(())
    }

    fn publish_health(&self, client: &AsyncClient) -> Result<(), BusError> {
        let payload = serde_json::to_vec(&self.health.get_health())?;
        client.try_publish(self.channels.health.as_str(), QoS::AtMostOnce, false, payload)?;
        Ok(())
    }

    fn mark_subscribed(&self) {
        self.backoff.lock().reset();
        *self.retry_at.lock() = None;
        self.set_state(BusState::Subscribed);
        tracing::info!(telemetry = %self.channels.telemetry, alarms = %self.channels.alarms, "bus subscribed");
    }

    /// La connexion reste ouverte : Connecting jusqu'à la reprise planifiée
    fn degrade(&self, step: &str, error: &BusError) {
        let delay = self.backoff.lock().next_delay();
        *self.retry_at.lock() = Some(Instant::now() + delay);
        self.set_state(BusState::Connecting);
        tracing::warn!(step, error = %error, retry_in_ms = delay.as_millis() as u64, "bus degraded, retry scheduled");
    }

    pub fn spawn(
        self: Arc<Self>,
        client: AsyncClient,
        eventloop: EventLoop,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(client, eventloop, shutdown).await })
    }

    async fn run(&self, client: AsyncClient, mut eventloop: EventLoop, mut shutdown: watch::Receiver<bool>) {
        let mut probe = tokio::time::interval(self.probe_interval);
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        self.set_state(BusState::Connecting);

        loop {
            tokio::select! {
                _ = gasmon_common::stopped(&mut shutdown) => {
                    tracing::info!("bus subscriber stopping");
                    if let Err(e) = client.try_disconnect() {
                        tracing::debug!(error = %e, "bus disconnect request failed");
                    }
                    break;
                }

                _ = probe.tick() => {
                    if let Err(e) = self.probe(&client) {
                        tracing::warn!(error = %e, "bus liveness probe failed");
                    }
                }

                _ = until(self.retry_deadline()) => {
                    if let Err(e) = self.recover(&client) {
                        tracing::warn!(error = %e, "bus recovery failed");
                    }
                }

                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if let Err(e) = self.on_connected(&client) {
                            tracing::error!(error = %e, "bus subscribe failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        self.handle_publish(&p.topic, &p.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let delay = self.on_connection_error(&e);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = gasmon_common::stopped(&mut shutdown) => break,
                        }
                        self.set_state(BusState::Connecting);
                    }
                }
            }
        }

        self.set_state(BusState::Disconnected);
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// `publish(channel, message)` sur le bus MQTT
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }

    async fn send(&self, channel: &str, message: &Value) -> Result<(), BusError> {
        let payload = serde_json::to_vec(message)?;
        self.client.publish(channel, QoS::AtLeastOnce, false, payload).await?;
        Ok(())
    }
}

impl BusPublish for MqttPublisher {
    fn publish<'a>(&'a self, channel: &'a str, message: Value) -> BoxFuture<'a, Result<(), PublishError>> {
        Box::pin(async move { self.send(channel, &message).await.map_err(PublishError::from) })
    }
}
