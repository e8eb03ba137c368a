/**
 * PUSH HUB - Rooms du canal bidirectionnel kernel -> clients
 *
 * RÔLE :
 * Registre des clients WebSocket connectés et de leurs rooms
 * (`device:<id>`, `plant:<id>`). Implémente `PushSink` pour le router.
 *
 * FONCTIONNEMENT :
 * - Chaque connexion reçoit un ClientId et un canal mpsc de frames sortantes
 * - Commandes client : subscribe / subscribe-plant / unsubscribe / unsubscribe-plant
 * - Au plus une room device et une room plant par client : rejoindre une
 *   nouvelle room device quitte l'ancienne
 * - Émission non bloquante : push dans les mpsc, la tâche socket écrit
 */

use crate::health::HealthTracker;
use crate::http::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRef, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use gasmon_common::{ClientCommand, PushError, PushSink, Room, ServerFrame, Target};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub type ClientId = u64;

struct ClientEntry {
    tx: mpsc::UnboundedSender<ServerFrame>,
    device_room: Option<Room>,
    plant_room: Option<Room>,
}

#[derive(Default)]
struct HubInner {
    clients: HashMap<ClientId, ClientEntry>,
    rooms: HashMap<Room, BTreeSet<ClientId>>,
}

impl HubInner {
    fn remove_member(&mut self, room: &Room, id: ClientId) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(&id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }
}

#[derive(Clone)]
pub struct PushHub {
    inner: Arc<Mutex<HubInner>>,
    next_id: Arc<AtomicU64>,
    health: HealthTracker,
}

impl PushHub {
    pub fn new(health: HealthTracker) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            health,
        }
    }

    pub fn register(&self) -> (ClientId, mpsc::UnboundedReceiver<ServerFrame>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.lock();
            inner.clients.insert(id, ClientEntry { tx, device_room: None, plant_room: None });
            self.publish_gauges(&inner);
        }
        tracing::info!(client_id = id, "push client connected");
        (id, rx)
    }

    pub fn unregister(&self, id: ClientId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.clients.remove(&id) {
            for room in entry.device_room.iter().chain(entry.plant_room.iter()) {
                inner.remove_member(room, id);
            }
            tracing::info!(client_id = id, "push client disconnected");
        }
        self.publish_gauges(&inner);
    }

    /// Rejoint une room ; retourne la room du même type retirée au passage
    pub fn join(&self, id: ClientId, room: Room) -> Option<Room> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.clients.get_mut(&id) else {
            tracing::warn!(client_id = id, room = %room, "join from unknown client");
            return None;
        };
        let slot = if room.is_device() { &mut entry.device_room } else { &mut entry.plant_room };
        if slot.as_ref() == Some(&room) {
            return None;
        }
        let retired = slot.replace(room.clone());
        if let Some(old) = &retired {
            inner.remove_member(old, id);
        }
        inner.rooms.entry(room.clone()).or_default().insert(id);
        self.publish_gauges(&inner);
        tracing::debug!(client_id = id, room = %room, retired = ?retired.as_ref().map(Room::to_string), "room joined");
        retired
    }

    pub fn leave(&self, id: ClientId, room: &Room) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.clients.get_mut(&id) else {
            return false;
        };
        let slot = if room.is_device() { &mut entry.device_room } else { &mut entry.plant_room };
        if slot.as_ref() != Some(room) {
            return false;
        }
        *slot = None;
        inner.remove_member(room, id);
        self.publish_gauges(&inner);
        tracing::debug!(client_id = id, room = %room, "room left");
        true
    }

    pub fn apply(&self, id: ClientId, command: ClientCommand) {
        let room = command.room();
        if command.is_join() {
            self.join(id, room);
        } else {
            self.leave(id, &room);
        }
    }

    pub fn members(&self, room: &Room) -> usize {
        self.inner.lock().rooms.get(room).map_or(0, BTreeSet::len)
    }

    pub fn rooms_of(&self, id: ClientId) -> Vec<Room> {
        let inner = self.inner.lock();
        inner
            .clients
            .get(&id)
            .map(|entry| entry.device_room.iter().chain(entry.plant_room.iter()).cloned().collect())
            .unwrap_or_default()
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    fn publish_gauges(&self, inner: &HubInner) {
        self.health.set_push_gauges(inner.clients.len(), inner.rooms.len());
    }
}

impl PushSink for PushHub {
    fn emit(&self, target: &Target, frame: &ServerFrame) -> Result<usize, PushError> {
        let inner = self.inner.lock();
        let recipients: Vec<&ClientEntry> = match target {
            Target::Global => inner.clients.values().collect(),
            Target::Room(room) => inner
                .rooms
                .get(room)
                .map(|members| members.iter().filter_map(|id| inner.clients.get(id)).collect())
                .unwrap_or_default(),
        };

        let mut delivered = 0;
        for entry in recipients {
            // socket en cours de fermeture : la tâche de la connexion fera le ménage
            if entry.tx.send(frame.clone()).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}

impl FromRef<AppState> for PushHub {
    fn from_ref(app: &AppState) -> Self {
        app.hub.clone()
    }
}

// GET /ws (upgrade canal push)
pub async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<PushHub>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: PushHub) {
    let (id, mut frames) = hub.register();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientCommand>(text.as_str()) {
                    Ok(command) => hub.apply(id, command),
                    Err(e) => tracing::warn!(client_id = id, error = %e, "invalid client command dropped"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(client_id = id, error = %e, "push socket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
            outgoing = frames.recv() => {
                let Some(frame) = outgoing else { break };
                match serde_json::to_string(&frame) {
                    Ok(txt) => {
                        if sender.send(Message::Text(txt.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(client_id = id, error = %e, "frame serialization failed"),
                }
            }
        }
    }

    hub.unregister(id);
}
