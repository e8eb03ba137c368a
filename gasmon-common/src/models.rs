use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// Échantillon de télémétrie tel que relayé aux clients.
/// Éphémère : jamais persisté par le kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub device_id: String,
    pub device_name: String,
    pub plant_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Mesures opaques (température, humidité, niveaux de gaz...) conservées telles quelles
    #[serde(flatten)]
    pub readings: Map<String, Value>,
}

/// Alarme canonique (stockage + push temps réel)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alarm {
    pub id: String,
    pub alarm_code: String,
    pub alarm_description: String,
    pub device_id: String,
    pub device_name: String,
    pub plant_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_timestamp: OffsetDateTime,
    pub is_active: bool,
    pub is_read: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    #[default]
    General,
    Alarm,
    Plant,
    Device,
}

impl NotificationType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "general" => Some(Self::General),
            "alarm" => Some(Self::Alarm),
            "plant" => Some(Self::Plant),
            "device" => Some(Self::Device),
            _ => None,
        }
    }
}

/// Notification canonique : même identité et même état lu/non lu qu'une alarme
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    pub device_id: String,
    pub device_name: String,
    pub plant_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_timestamp: OffsetDateTime,
    pub is_read: bool,
}

impl Notification {
    /// Notification dérivée d'une alarme (broadcast `alarm_notification`)
    pub fn from_alarm(alarm: &Alarm) -> Self {
        Self {
            id: format!("notification-{}", alarm.id),
            kind: NotificationType::Alarm,
            title: alarm.alarm_code.clone(),
            message: alarm.alarm_description.clone(),
            device_id: alarm.device_id.clone(),
            device_name: alarm.device_name.clone(),
            plant_name: alarm.plant_name.clone(),
            created_timestamp: alarm.created_timestamp,
            is_read: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Telemetry,
    Alarm,
    Notification,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecordKind::Telemetry => "telemetry",
            RecordKind::Alarm => "alarm",
            RecordKind::Notification => "notification",
        };
        f.write_str(s)
    }
}

/// Enregistrement après normalisation, quel que soit son type
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalRecord {
    Telemetry(Telemetry),
    Alarm(Alarm),
    Notification(Notification),
}

impl CanonicalRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            CanonicalRecord::Telemetry(_) => RecordKind::Telemetry,
            CanonicalRecord::Alarm(_) => RecordKind::Alarm,
            CanonicalRecord::Notification(_) => RecordKind::Notification,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            CanonicalRecord::Telemetry(t) => &t.device_id,
            CanonicalRecord::Alarm(a) => &a.device_id,
            CanonicalRecord::Notification(n) => &n.device_id,
        }
    }

    pub fn plant_name(&self) -> &str {
        match self {
            CanonicalRecord::Telemetry(t) => &t.plant_name,
            CanonicalRecord::Alarm(a) => &a.plant_name,
            CanonicalRecord::Notification(n) => &n.plant_name,
        }
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            CanonicalRecord::Telemetry(t) => serde_json::to_value(t),
            CanonicalRecord::Alarm(a) => serde_json::to_value(a),
            CanonicalRecord::Notification(n) => serde_json::to_value(n),
        }
    }
}
