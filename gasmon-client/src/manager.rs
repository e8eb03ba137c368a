/**
 * GESTIONNAIRE D'ABONNEMENTS - Cycle de vie du canal push côté client
 *
 * RÔLE :
 * Possède l'unique connexion push d'un client, les rooms désirées
 * (au plus une room device et une room plant) et les registres de callbacks.
 *
 * FONCTIONNEMENT :
 * - Une tâche superviseur ouvre la connexion via `PushTransport`, rejoue toutes
 *   les rooms désirées, puis lit les frames entrants
 * - Fin du flux entrant => reconnexion avec backoff borné, sauf après `disconnect()`
 * - `on_focus()` court-circuite l'attente du backoff (et seulement elle :
 *   aucun réveil n'est mémorisé pendant une connexion active)
 * - Changement de room : l'ancienne est quittée avant de rejoindre la nouvelle
 * - Frames re-normalisés puis dédupliqués (un client membre de plusieurs rooms
 *   reçoit le même frame plusieurs fois) avant d'atteindre les callbacks
 *
 * UTILITÉ DANS GASMON :
 * 🎯 Les abonnements survivent aux coupures sans intervention de l'appelant
 * 🎯 Un seul handler par événement, quel que soit le nombre d'enregistrements
 */
use crate::config::ClientConfig;
use crate::listeners::{Callback, ListenerHandle, Listeners};
use gasmon_common::wire::{EVENT_ALARM, EVENT_ALARM_NOTIFICATION, EVENT_NOTIFICATION, EVENT_TELEMETRY};
use gasmon_common::{
    stopped, Alarm, Backoff, ClientCommand, Normalizer, Notification, PushTransport, Room, ServerFrame, Telemetry,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, trace, warn};

/// Taille de la fenêtre de dédup des frames récents
const RECENT_FRAMES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct ManagerState {
    conn: ConnectionState,
    device: Option<Room>,
    plant: Option<Room>,
    /// Rooms effectivement rejointes sur la connexion courante
    sent: BTreeSet<Room>,
    outbound: Option<mpsc::UnboundedSender<ClientCommand>>,
    stop: Option<watch::Sender<bool>>,
    /// Incrémenté à chaque connect/disconnect : un superviseur périmé n'écrit plus l'état
    generation: u64,
}

impl ManagerState {
    fn desired(&self) -> Vec<Room> {
        self.device.iter().chain(self.plant.iter()).cloned().collect()
    }

    fn send_join(&mut self, room: &Room) {
        if self.conn != ConnectionState::Connected {
            return;
        }
        if let Some(tx) = &self.outbound {
            if tx.send(ClientCommand::join(room)).is_ok() {
                self.sent.insert(room.clone());
            }
        }
    }

    fn retire(&mut self, room: &Room) {
        if self.sent.remove(room) {
            if let Some(tx) = &self.outbound {
                let _ = tx.send(ClientCommand::leave(room));
            }
        }
    }

    /// Remplace la room d'un slot (device ou plant) ; `None` si inchangée
    fn switch(slot: &mut Option<Room>, room: Room) -> Option<Option<Room>> {
        if slot.as_ref() == Some(&room) {
            return None;
        }
        Some(slot.replace(room))
    }
}

/// Clés des derniers frames dispatchés
#[derive(Default)]
struct RecentFrames {
    keys: VecDeque<String>,
}

impl RecentFrames {
    fn first_seen(&mut self, key: String) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        if self.keys.len() == RECENT_FRAMES {
            self.keys.pop_front();
        }
        self.keys.push_back(key);
        true
    }
}

struct Inner {
    transport: Arc<dyn PushTransport>,
    normalizer: Arc<Normalizer>,
    listeners: Listeners,
    state: Mutex<ManagerState>,
    recent: Mutex<RecentFrames>,
    wake: Notify,
    reconnect_base: Duration,
    reconnect_max: Duration,
}

#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

impl SubscriptionManager {
    pub fn new(transport: Arc<dyn PushTransport>, normalizer: Arc<Normalizer>, config: &ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                normalizer,
                listeners: Listeners::new(),
                state: Mutex::new(ManagerState {
                    conn: ConnectionState::Disconnected,
                    device: None,
                    plant: None,
                    sent: BTreeSet::new(),
                    outbound: None,
                    stop: None,
                    generation: 0,
                }),
                recent: Mutex::new(RecentFrames::default()),
                wake: Notify::new(),
                reconnect_base: config.reconnect_base,
                reconnect_max: config.reconnect_max,
            }),
        }
    }

    /// Démarre le superviseur de connexion (sans effet s'il tourne déjà).
    /// Doit être appelé depuis un runtime tokio.
    pub fn connect(&self) {
        let (stop_rx, generation) = {
            let mut state = self.inner.state.lock();
            if state.stop.is_some() {
                return;
            }
            let (stop_tx, stop_rx) = watch::channel(false);
            state.stop = Some(stop_tx);
            state.generation += 1;
            state.conn = ConnectionState::Connecting;
            (stop_rx, state.generation)
        };
        info!("🔌 Starting push channel supervisor");
        tokio::spawn(supervise(self.inner.clone(), stop_rx, generation));
    }

    /// Ferme la connexion et arrête les reconnexions. Les rooms désirées sont conservées.
    pub fn disconnect(&self) {
        let mut state = self.inner.state.lock();
        if let Some(stop) = state.stop.take() {
            let _ = stop.send(true);
        }
        state.generation += 1;
        state.outbound = None;
        state.sent.clear();
        state.conn = ConnectionState::Disconnected;
        info!("🔌 Push channel disconnected on request");
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().conn
    }

    /// Reprise de premier plan : reconnexion immédiate si le superviseur
    /// attend son backoff. Sans effet pendant une ouverture ou une connexion active.
    pub fn on_focus(&self) {
        let state = self.inner.state.lock();
        if state.stop.is_some() && state.conn == ConnectionState::Disconnected {
            debug!("Focus regained, skipping reconnect backoff");
            self.inner.wake.notify_waiters();
        }
    }

    pub fn subscribe_to_device(&self, device_id: &str) {
        let room = Room::device(device_id.trim());
        let mut state = self.inner.state.lock();
        if let Some(previous) = ManagerState::switch(&mut state.device, room.clone()) {
            if let Some(old) = previous {
                state.retire(&old);
            }
            state.send_join(&room);
            debug!(room = %room, "Device room requested");
        }
    }

    pub fn subscribe_to_plant(&self, plant_id: &str) {
        let room = Room::plant(plant_id.trim());
        let mut state = self.inner.state.lock();
        if let Some(previous) = ManagerState::switch(&mut state.plant, room.clone()) {
            if let Some(old) = previous {
                state.retire(&old);
            }
            state.send_join(&room);
            debug!(room = %room, "Plant room requested");
        }
    }

    pub fn unsubscribe_from_device(&self, device_id: &str) -> bool {
        let room = Room::device(device_id.trim());
        let mut state = self.inner.state.lock();
        if state.device.as_ref() != Some(&room) {
            return false;
        }
        state.device = None;
        state.retire(&room);
        true
    }

    pub fn unsubscribe_from_plant(&self, plant_id: &str) -> bool {
        let room = Room::plant(plant_id.trim());
        let mut state = self.inner.state.lock();
        if state.plant.as_ref() != Some(&room) {
            return false;
        }
        state.plant = None;
        state.retire(&room);
        true
    }

    pub fn desired_rooms(&self) -> Vec<Room> {
        self.inner.state.lock().desired()
    }

    /// Rooms désirées pas encore rejointes (rejouées à la prochaine connexion)
    pub fn pending_rooms(&self) -> Vec<Room> {
        let state = self.inner.state.lock();
        state.desired().into_iter().filter(|room| !state.sent.contains(room)).collect()
    }

    pub fn on_telemetry(&self, callback: Callback<Telemetry>, device_filter: Option<&str>) -> ListenerHandle {
        self.inner.listeners.add_telemetry(callback, device_filter.map(str::to_string))
    }

    pub fn on_alarm(&self, callback: Callback<Alarm>) -> ListenerHandle {
        self.inner.listeners.add_alarm(callback)
    }

    pub fn on_alarm_notification(&self, callback: Callback<Notification>) -> ListenerHandle {
        self.inner.listeners.add_alarm_notification(callback)
    }

    pub fn on_notification(&self, callback: Callback<Notification>) -> ListenerHandle {
        self.inner.listeners.add_notification(callback)
    }

    pub fn listeners(&self) -> &Listeners {
        &self.inner.listeners
    }
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    fn set_connecting(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.conn = ConnectionState::Connecting;
        }
    }

    /// Installe la connexion et rejoue toutes les rooms désirées
    fn attach(&self, generation: u64, outbound: mpsc::UnboundedSender<ClientCommand>) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        state.outbound = Some(outbound);
        state.conn = ConnectionState::Connected;
        state.sent.clear();
        let rooms = state.desired();
        for room in &rooms {
            state.send_join(room);
        }
        info!(rooms = rooms.len(), "✅ Push channel connected, rooms replayed");
        true
    }

    fn detach(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.outbound = None;
            state.sent.clear();
            state.conn = ConnectionState::Disconnected;
        }
    }

    fn first_seen(&self, key: String) -> bool {
        self.recent.lock().first_seen(key)
    }

    /// Un seul aiguillage par nom d'événement ; les alias `telemetry_<id>` sont ignorés
    fn dispatch(&self, frame: ServerFrame) {
        let Value::Object(raw) = &frame.data else {
            debug!(event = %frame.event, "Ignoring non-object push payload");
            return;
        };
        match frame.event.as_str() {
            EVENT_TELEMETRY => {
                let telemetry = self.normalizer.telemetry(raw);
                let key = format!(
                    "telemetry:{}:{}",
                    telemetry.device_id,
                    telemetry.timestamp.unix_timestamp_nanos()
                );
                if self.first_seen(key) {
                    self.listeners.emit_telemetry(&telemetry);
                }
            }
            EVENT_ALARM => {
                let alarm = self.normalizer.alarm(raw);
                if self.first_seen(format!("alarm:{}", alarm.id)) {
                    self.listeners.emit_alarm(&alarm);
                }
            }
            EVENT_ALARM_NOTIFICATION => {
                let notification = self.normalizer.notification(raw);
                if self.first_seen(format!("alarm_notification:{}", notification.id)) {
                    self.listeners.emit_alarm_notification(&notification);
                }
            }
            EVENT_NOTIFICATION => {
                let notification = self.normalizer.notification(raw);
                if self.first_seen(format!("notification:{}", notification.id)) {
                    self.listeners.emit_notification(&notification);
                }
            }
            other if other.starts_with("telemetry_") => trace!(event = other, "Legacy telemetry alias ignored"),
            other => debug!(event = other, "Unknown push event"),
        }
    }
}

async fn supervise(inner: Arc<Inner>, mut stop: watch::Receiver<bool>, generation: u64) {
    let mut backoff = Backoff::new(inner.reconnect_base, inner.reconnect_max);

    loop {
        if !inner.is_current(generation) {
            break;
        }
        inner.set_connecting(generation);

        let opened = tokio::select! {
            opened = inner.transport.open() => opened,
            _ = stopped(&mut stop) => break,
        };

        let failure = match opened {
            Ok(connection) => {
                backoff.reset();
                let mut inbound = connection.inbound;
                if !inner.attach(generation, connection.outbound) {
                    break;
                }
                loop {
                    tokio::select! {
                        frame = inbound.recv() => match frame {
                            Some(frame) => inner.dispatch(frame),
                            None => break,
                        },
                        _ = stopped(&mut stop) => return,
                    }
                }
                None
            }
            Err(e) => Some(e),
        };

        // inscrit avant de publier Disconnected : un on_focus qui voit cet état atteint l'attente
        let wake = inner.wake.notified();
        tokio::pin!(wake);
        wake.as_mut().enable();
        inner.detach(generation);
        match failure {
            None => warn!("⚠️ Push channel lost, reconnecting"),
            Some(e) => warn!(error = %e, attempt = backoff.attempt() + 1, "❌ Push channel connect failed"),
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Waiting before push reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = &mut wake => debug!("Reconnect triggered early"),
            _ = stopped(&mut stop) => break,
        }
    }
    debug!(generation, "Push supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use gasmon_devkit::{GasPayloadBuilder, MockConnection, MockPushTransport};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(2);

    fn fast_config() -> ClientConfig {
        ClientConfig {
            reconnect_base: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(40),
            ..ClientConfig::default()
        }
    }

    fn manager(transport: &Arc<MockPushTransport>) -> SubscriptionManager {
        SubscriptionManager::new(transport.clone(), Arc::new(Normalizer::default()), &fast_config())
    }

    async fn wait_connected(manager: &SubscriptionManager) {
        tokio::time::timeout(WAIT, async {
            while manager.state() != ConnectionState::Connected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("manager never connected");
    }

    async fn commands(conn: &mut MockConnection, n: usize) -> Vec<ClientCommand> {
        let mut out = Vec::new();
        for _ in 0..n {
            out.push(conn.next_command(WAIT).await.expect("missing command"));
        }
        out
    }

    #[tokio::test]
    async fn test_rooms_queued_then_replayed_on_every_reconnect() {
        let transport = Arc::new(MockPushTransport::new());
        let manager = manager(&transport);
        manager.subscribe_to_device("esp32_04");
        manager.subscribe_to_plant("plant-c");
        assert_eq!(manager.pending_rooms().len(), 2);

        manager.connect();
        let mut first = transport.accept(WAIT).await.unwrap();
        let replayed = commands(&mut first, 2).await;
        assert_eq!(
            replayed,
            vec![ClientCommand::Subscribe("esp32_04".into()), ClientCommand::SubscribePlant("plant-c".into())]
        );
        wait_connected(&manager).await;
        assert!(manager.pending_rooms().is_empty());

        first.drop_connection();
        let mut second = transport.accept(WAIT).await.unwrap();
        let replayed = commands(&mut second, 2).await;
        assert!(replayed.contains(&ClientCommand::Subscribe("esp32_04".into())));
        assert!(replayed.contains(&ClientCommand::SubscribePlant("plant-c".into())));
        assert_eq!(transport.opened(), 2);

        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.desired_rooms().len(), 2);
    }

    #[tokio::test]
    async fn test_switching_device_retires_old_room() {
        let transport = Arc::new(MockPushTransport::new());
        let manager = manager(&transport);
        manager.connect();
        let mut conn = transport.accept(WAIT).await.unwrap();
        wait_connected(&manager).await;

        manager.subscribe_to_device("esp32_04");
        manager.subscribe_to_device("esp32_04");
        manager.subscribe_to_device("esp32_11");
        assert_eq!(
            commands(&mut conn, 3).await,
            vec![
                ClientCommand::Subscribe("esp32_04".into()),
                ClientCommand::Unsubscribe("esp32_04".into()),
                ClientCommand::Subscribe("esp32_11".into()),
            ]
        );
        assert!(manager.unsubscribe_from_device("esp32_11"));
        assert!(!manager.unsubscribe_from_device("esp32_11"));
        assert_eq!(commands(&mut conn, 1).await, vec![ClientCommand::Unsubscribe("esp32_11".into())]);
        assert!(conn.drain_commands().is_empty());
        manager.disconnect();
    }

    #[tokio::test]
    async fn test_failed_open_is_retried() {
        let transport = Arc::new(MockPushTransport::new());
        transport.fail_next(2);
        let manager = manager(&transport);
        manager.subscribe_to_plant("plant-d");
        manager.connect();

        let mut conn = transport.accept(WAIT).await.unwrap();
        assert_eq!(commands(&mut conn, 1).await, vec![ClientCommand::SubscribePlant("plant-d".into())]);
        manager.disconnect();
    }

    #[tokio::test]
    async fn test_frames_are_normalized_and_deduplicated() {
        let transport = Arc::new(MockPushTransport::new());
        let manager = manager(&transport);
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.on_alarm(Arc::new(move |alarm: &Alarm| {
            let _ = tx.send(alarm.clone());
        }));
        manager.connect();
        let conn = transport.accept(WAIT).await.unwrap();
        wait_connected(&manager).await;

        let mut legacy = GasPayloadBuilder::alarm_legacy("esp32_04", "IO_ALR_108", "Plant C - esp32_04");
        legacy["Id"] = json!("a1");
        // reçu via global puis via la room device
        conn.push("alarm", legacy.clone());
        conn.push("alarm", legacy);
        let mut next = GasPayloadBuilder::alarm("esp32_04", "IO_ALR_109", "Plant C - esp32_04");
        next["id"] = json!("a2");
        conn.push("alarm", next);

        let first = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.id, "a1");
        assert_eq!(first.alarm_code, "IO_ALR_108");
        assert_eq!(first.device_id, "esp32_04");
        let second = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(second.id, "a2");
        manager.disconnect();
    }

    #[tokio::test]
    async fn test_same_telemetry_callback_invoked_once() {
        let transport = Arc::new(MockPushTransport::new());
        let manager = manager(&transport);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let cb: Callback<Telemetry> = Arc::new(move |_: &Telemetry| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        manager.on_telemetry(cb.clone(), Some("esp32_04"));
        manager.on_telemetry(cb, Some("esp32_04"));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        manager.on_notification(Arc::new(move |_: &Notification| {
            let _ = done_tx.send(());
        }));
        manager.connect();
        let conn = transport.accept(WAIT).await.unwrap();
        wait_connected(&manager).await;

        let mut sample = GasPayloadBuilder::telemetry("esp32_04", "Plant C - esp32_04");
        conn.push("telemetry_esp32_04", sample.clone());
        conn.push("telemetry", GasPayloadBuilder::telemetry("esp32_11", "Plant D - esp32_11"));
        conn.push("telemetry", sample.clone());
        sample["timestamp"] = json!("2030-01-01T00:00:00Z");
        conn.push("telemetry", sample);
        // frames traités dans l'ordre : la notification marque la fin du lot
        conn.push("notification", GasPayloadBuilder::notification("esp32_04", "done", ""));

        tokio::time::timeout(WAIT, done_rx.recv()).await.unwrap().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        manager.disconnect();
    }

    #[tokio::test]
    async fn test_on_focus_skips_backoff() {
        let transport = Arc::new(MockPushTransport::new());
        let config = ClientConfig {
            reconnect_base: Duration::from_secs(3600),
            reconnect_max: Duration::from_secs(3600),
            ..ClientConfig::default()
        };
        let manager = SubscriptionManager::new(transport.clone(), Arc::new(Normalizer::default()), &config);
        manager.connect();
        let conn = transport.accept(WAIT).await.unwrap();
        wait_connected(&manager).await;

        conn.drop_connection();
        tokio::time::timeout(WAIT, async {
            while manager.state() == ConnectionState::Connected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        manager.on_focus();
        assert!(transport.accept(WAIT).await.is_some());
        manager.disconnect();
    }

    #[tokio::test]
    async fn test_on_focus_after_refused_open_retries_now() {
        let transport = Arc::new(MockPushTransport::new());
        transport.fail_next(1);
        let config = ClientConfig {
            reconnect_base: Duration::from_secs(3600),
            reconnect_max: Duration::from_secs(3600),
            ..ClientConfig::default()
        };
        let manager = SubscriptionManager::new(transport.clone(), Arc::new(Normalizer::default()), &config);
        manager.connect();
        tokio::time::timeout(WAIT, async {
            while manager.state() != ConnectionState::Disconnected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        manager.on_focus();
        assert!(transport.accept(WAIT).await.is_some());
        wait_connected(&manager).await;
        manager.disconnect();
    }

    #[tokio::test]
    async fn test_focus_while_connected_is_not_remembered() {
        let transport = Arc::new(MockPushTransport::new());
        let config = ClientConfig {
            reconnect_base: Duration::from_secs(3600),
            reconnect_max: Duration::from_secs(3600),
            ..ClientConfig::default()
        };
        let manager = SubscriptionManager::new(transport.clone(), Arc::new(Normalizer::default()), &config);
        manager.connect();
        let conn = transport.accept(WAIT).await.unwrap();
        wait_connected(&manager).await;

        manager.on_focus();
        manager.on_focus();
        conn.drop_connection();

        // la coupure suivante respecte le backoff
        assert!(transport.accept(Duration::from_millis(200)).await.is_none());
        assert_eq!(transport.opened(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        manager.disconnect();
    }
}
