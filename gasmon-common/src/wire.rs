use crate::rooms::Room;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_TELEMETRY: &str = "telemetry";
pub const EVENT_ALARM: &str = "alarm";
pub const EVENT_ALARM_NOTIFICATION: &str = "alarm_notification";
pub const EVENT_NOTIFICATION: &str = "notification";

/// Alias historique par device : `telemetry_<deviceId>`
pub fn legacy_telemetry_event(device_id: &str) -> String {
    format!("{EVENT_TELEMETRY}_{device_id}")
}

/// Frame serveur -> client : `{"event": "...", "data": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub event: String,
    pub data: Value,
}

impl ServerFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Commandes client -> serveur : `{"type": "subscribe-plant", "id": "plant-c"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id")]
pub enum ClientCommand {
    #[serde(rename = "subscribe")]
    Subscribe(String),
    #[serde(rename = "subscribe-plant")]
    SubscribePlant(String),
    #[serde(rename = "unsubscribe")]
    Unsubscribe(String),
    #[serde(rename = "unsubscribe-plant")]
    UnsubscribePlant(String),
}

impl ClientCommand {
    pub fn join(room: &Room) -> Self {
        match room {
            Room::Device(id) => ClientCommand::Subscribe(id.clone()),
            Room::Plant(id) => ClientCommand::SubscribePlant(id.clone()),
        }
    }

    pub fn leave(room: &Room) -> Self {
        match room {
            Room::Device(id) => ClientCommand::Unsubscribe(id.clone()),
            Room::Plant(id) => ClientCommand::UnsubscribePlant(id.clone()),
        }
    }

    pub fn room(&self) -> Room {
        match self {
            ClientCommand::Subscribe(id) | ClientCommand::Unsubscribe(id) => Room::Device(id.clone()),
            ClientCommand::SubscribePlant(id) | ClientCommand::UnsubscribePlant(id) => Room::Plant(id.clone()),
        }
    }

    pub fn is_join(&self) -> bool {
        matches!(self, ClientCommand::Subscribe(_) | ClientCommand::SubscribePlant(_))
    }
}
