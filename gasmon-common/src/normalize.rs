/*!
Normalisation des payloads capteurs

Les devices publient avec des conventions de nommage hétérogènes
(`DeviceId`, `deviceId`, `device_id`, `device`...). Chaque champ canonique
est résolu via une table d'alias ordonnée : le premier alias non vide gagne.
Les champs absents prennent une valeur par défaut documentée.

La normalisation est pure (l'horloge est passée en paramètre via `normalize_at`)
et idempotente : re-normaliser une sortie canonique rend la même valeur.
*/

use crate::models::{Alarm, CanonicalRecord, Notification, NotificationType, RecordKind, Telemetry};
use crate::plants::PlantDirectory;
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

pub const UNKNOWN_DEVICE: &str = "Unknown Device";

pub const ID_ALIASES: &[&str] = &["id", "_id", "Id", "ID"];
pub const DEVICE_ID_ALIASES: &[&str] = &["deviceId", "DeviceId", "device_id", "deviceID", "DeviceID", "device"];
pub const DEVICE_NAME_ALIASES: &[&str] = &["deviceName", "DeviceName", "device_name", "devicename"];
pub const PLANT_NAME_ALIASES: &[&str] = &["plantName", "PlantName", "plant_name", "plant", "Plant"];
pub const TIMESTAMP_ALIASES: &[&str] = &["timestamp", "Timestamp", "ts", "time", "createdTimestamp", "CreatedTimestamp"];
pub const CREATED_ALIASES: &[&str] = &[
    "createdTimestamp",
    "CreatedTimestamp",
    "created_timestamp",
    "createdAt",
    "timestamp",
    "Timestamp",
];
pub const ALARM_CODE_ALIASES: &[&str] = &["alarmCode", "AlarmCode", "alarm_code", "code", "Code"];
pub const ALARM_DESCRIPTION_ALIASES: &[&str] = &[
    "alarmDescription",
    "AlarmDescription",
    "alarm_description",
    "description",
    "Description",
];
pub const IS_ACTIVE_ALIASES: &[&str] = &["isActive", "IsActive", "is_active", "active"];
pub const IS_READ_ALIASES: &[&str] = &["isRead", "IsRead", "is_read", "read"];
pub const NOTIFICATION_TYPE_ALIASES: &[&str] = &["type", "Type", "notificationType", "NotificationType"];
pub const TITLE_ALIASES: &[&str] = &["title", "Title"];
pub const MESSAGE_ALIASES: &[&str] = &["message", "Message", "body"];

/// Normaliseur lié à l'annuaire des usines (pour l'inférence de plantName)
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    plants: PlantDirectory,
}

impl Normalizer {
    pub fn new(plants: PlantDirectory) -> Self {
        Self { plants }
    }

    pub fn normalize(&self, raw: &Map<String, Value>, kind: RecordKind) -> CanonicalRecord {
        self.normalize_at(raw, kind, OffsetDateTime::now_utc())
    }

    /// Variante déterministe : `now` sert de défaut aux horodatages absents
    pub fn normalize_at(&self, raw: &Map<String, Value>, kind: RecordKind, now: OffsetDateTime) -> CanonicalRecord {
        match kind {
            RecordKind::Telemetry => CanonicalRecord::Telemetry(self.telemetry_at(raw, now)),
            RecordKind::Alarm => CanonicalRecord::Alarm(self.alarm_at(raw, now)),
            RecordKind::Notification => CanonicalRecord::Notification(self.notification_at(raw, now)),
        }
    }

    pub fn telemetry(&self, raw: &Map<String, Value>) -> Telemetry {
        self.telemetry_at(raw, OffsetDateTime::now_utc())
    }

    pub fn alarm(&self, raw: &Map<String, Value>) -> Alarm {
        self.alarm_at(raw, OffsetDateTime::now_utc())
    }

    pub fn notification(&self, raw: &Map<String, Value>) -> Notification {
        self.notification_at(raw, OffsetDateTime::now_utc())
    }

    pub fn telemetry_at(&self, raw: &Map<String, Value>, now: OffsetDateTime) -> Telemetry {
        let device_id = resolve_str(raw, DEVICE_ID_ALIASES).unwrap_or_default();
        let device_name = resolve_str(raw, DEVICE_NAME_ALIASES).unwrap_or_else(|| device_id.clone());
        let plant_name = self.resolve_plant(raw, &device_id, &device_name);
        let timestamp = resolve_timestamp(raw, TIMESTAMP_ALIASES).unwrap_or(now);

        let readings = raw
            .iter()
            .filter(|(key, _)| !is_telemetry_reserved(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Telemetry {
            device_id,
            device_name,
            plant_name,
            timestamp,
            readings,
        }
    }

    pub fn alarm_at(&self, raw: &Map<String, Value>, now: OffsetDateTime) -> Alarm {
        let device_id = resolve_str(raw, DEVICE_ID_ALIASES).unwrap_or_default();
        let device_name = resolve_str(raw, DEVICE_NAME_ALIASES).unwrap_or_else(|| UNKNOWN_DEVICE.to_string());
        let plant_name = self.resolve_plant(raw, &device_id, &device_name);
        let created_timestamp = resolve_timestamp(raw, CREATED_ALIASES).unwrap_or(now);

        Alarm {
            id: resolve_id(raw).unwrap_or_else(|| synthesize_id("alarm", now)),
            alarm_code: resolve_str(raw, ALARM_CODE_ALIASES).unwrap_or_default(),
            alarm_description: resolve_str(raw, ALARM_DESCRIPTION_ALIASES).unwrap_or_default(),
            device_id,
            device_name,
            plant_name,
            created_timestamp,
            is_active: resolve_bool(raw, IS_ACTIVE_ALIASES).unwrap_or(true),
            is_read: resolve_bool(raw, IS_READ_ALIASES).unwrap_or(false),
        }
    }

    pub fn notification_at(&self, raw: &Map<String, Value>, now: OffsetDateTime) -> Notification {
        let device_id = resolve_str(raw, DEVICE_ID_ALIASES).unwrap_or_default();
        let device_name = resolve_str(raw, DEVICE_NAME_ALIASES).unwrap_or_else(|| UNKNOWN_DEVICE.to_string());
        let plant_name = self.resolve_plant(raw, &device_id, &device_name);

        Notification {
            id: resolve_id(raw).unwrap_or_else(|| synthesize_id("notification", now)),
            kind: resolve_str(raw, NOTIFICATION_TYPE_ALIASES)
                .and_then(|t| NotificationType::parse(&t))
                .unwrap_or_default(),
            title: resolve_str(raw, TITLE_ALIASES).unwrap_or_default(),
            message: resolve_str(raw, MESSAGE_ALIASES).unwrap_or_default(),
            device_id,
            device_name,
            plant_name,
            created_timestamp: resolve_timestamp(raw, CREATED_ALIASES).unwrap_or(now),
            is_read: resolve_bool(raw, IS_READ_ALIASES).unwrap_or(false),
        }
    }

    /// Usine explicite d'abord, sinon inférence par convention de nommage
    fn resolve_plant(&self, raw: &Map<String, Value>, device_id: &str, device_name: &str) -> String {
        resolve_str(raw, PLANT_NAME_ALIASES)
            .or_else(|| self.plants.infer_plant_name(device_id, device_name).map(str::to_string))
            .unwrap_or_default()
    }
}

/// Premier alias dont la valeur (scalaire) est non vide
pub fn resolve_str(raw: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|key| {
        raw.get(*key)
            .and_then(scalar_to_string)
            .filter(|s| !s.trim().is_empty())
    })
}

pub fn resolve_bool(raw: &Map<String, Value>, aliases: &[&str]) -> Option<bool> {
    aliases.iter().find_map(|key| match raw.get(*key)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

/// Horodatage RFC 3339 ou epoch (secondes / millisecondes)
pub fn resolve_timestamp(raw: &Map<String, Value>, aliases: &[&str]) -> Option<OffsetDateTime> {
    aliases.iter().find_map(|key| {
        let value = raw.get(*key)?;
        let parsed = parse_timestamp(value);
        if parsed.is_none() {
            tracing::debug!(field = *key, value = %value, "unparseable timestamp ignored");
        }
        parsed
    })
}

pub fn parse_timestamp(value: &Value) -> Option<OffsetDateTime> {
    match value {
        Value::String(s) if !s.trim().is_empty() => OffsetDateTime::parse(s.trim(), &Rfc3339).ok(),
        Value::Number(n) => {
            let raw = n.as_i64()?;
            // au-delà de ~2286 en secondes, c'est forcément des millisecondes
            let nanos = if raw.abs() > 10_000_000_000 {
                i128::from(raw) * 1_000_000
            } else {
                i128::from(raw) * 1_000_000_000
            };
            OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
        }
        _ => None,
    }
}

/// Id de stockage : accepte aussi la forme Mongo `{"$oid": "..."}`
fn resolve_id(raw: &Map<String, Value>) -> Option<String> {
    ID_ALIASES.iter().find_map(|key| {
        let id = match raw.get(*key)? {
            Value::Object(obj) => obj.get("$oid").and_then(scalar_to_string),
            other => scalar_to_string(other),
        };
        id.filter(|s| !s.trim().is_empty())
    })
}

/// `<prefix>-<epoch millis>-<aléatoire>`
pub fn synthesize_id(prefix: &str, now: OffsetDateTime) -> String {
    let millis = now.unix_timestamp_nanos() / 1_000_000;
    let random = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{millis}-{}", &random[..9])
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_telemetry_reserved(key: &str) -> bool {
    DEVICE_ID_ALIASES.contains(&key)
        || DEVICE_NAME_ALIASES.contains(&key)
        || PLANT_NAME_ALIASES.contains(&key)
        || TIMESTAMP_ALIASES.contains(&key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plants::PlantEntry;
    use serde_json::json;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-05-01 12:00:00 UTC);

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(PlantDirectory::new(vec![PlantEntry {
            id: "plant-c".into(),
            name: "Plant C".into(),
            device_patterns: vec!["esp32_0".into()],
        }]))
    }

    #[test]
    fn test_every_device_id_alias_resolves() {
        let n = normalizer();
        for alias in DEVICE_ID_ALIASES {
            let raw = obj(json!({ *alias: "esp32_04", "AlarmCode": "X" }));
            let alarm = n.alarm_at(&raw, NOW);
            assert_eq!(alarm.device_id, "esp32_04", "alias {alias}");
        }
    }

    #[test]
    fn test_every_alarm_field_alias_resolves() {
        let n = normalizer();
        for alias in ALARM_CODE_ALIASES {
            let alarm = n.alarm_at(&obj(json!({ *alias: "IO_ALR_108" })), NOW);
            assert_eq!(alarm.alarm_code, "IO_ALR_108", "alias {alias}");
        }
        for alias in ALARM_DESCRIPTION_ALIASES {
            let alarm = n.alarm_at(&obj(json!({ *alias: "CO high" })), NOW);
            assert_eq!(alarm.alarm_description, "CO high", "alias {alias}");
        }
        for alias in DEVICE_NAME_ALIASES {
            let alarm = n.alarm_at(&obj(json!({ *alias: "Boiler" })), NOW);
            assert_eq!(alarm.device_name, "Boiler", "alias {alias}");
        }
        for alias in PLANT_NAME_ALIASES {
            let alarm = n.alarm_at(&obj(json!({ *alias: "Plant D" })), NOW);
            assert_eq!(alarm.plant_name, "Plant D", "alias {alias}");
        }
        for alias in IS_ACTIVE_ALIASES {
            let alarm = n.alarm_at(&obj(json!({ *alias: false })), NOW);
            assert!(!alarm.is_active, "alias {alias}");
        }
        for alias in IS_READ_ALIASES {
            let alarm = n.alarm_at(&obj(json!({ *alias: "true" })), NOW);
            assert!(alarm.is_read, "alias {alias}");
        }
        for alias in CREATED_ALIASES {
            let alarm = n.alarm_at(&obj(json!({ *alias: "2024-04-30T08:00:00Z" })), NOW);
            assert_eq!(alarm.created_timestamp, datetime!(2024-04-30 08:00:00 UTC), "alias {alias}");
        }
        for alias in ID_ALIASES {
            let alarm = n.alarm_at(&obj(json!({ *alias: "abc" })), NOW);
            assert_eq!(alarm.id, "abc", "alias {alias}");
        }
    }

    #[test]
    fn test_every_notification_alias_resolves() {
        let n = normalizer();
        for alias in NOTIFICATION_TYPE_ALIASES {
            let notif = n.notification_at(&obj(json!({ *alias: "plant" })), NOW);
            assert_eq!(notif.kind, NotificationType::Plant, "alias {alias}");
        }
        for alias in TITLE_ALIASES {
            let notif = n.notification_at(&obj(json!({ *alias: "Leak" })), NOW);
            assert_eq!(notif.title, "Leak", "alias {alias}");
        }
        for alias in MESSAGE_ALIASES {
            let notif = n.notification_at(&obj(json!({ *alias: "Check valve" })), NOW);
            assert_eq!(notif.message, "Check valve", "alias {alias}");
        }
    }

    #[test]
    fn test_variants_differing_only_in_casing_are_identical() {
        let n = normalizer();
        let a = obj(json!({
            "id": "42",
            "AlarmCode": "IO_ALR_108",
            "AlarmDescription": "CO high",
            "DeviceId": "esp32_04",
            "DeviceName": "Sensor 4",
            "CreatedTimestamp": "2024-05-01T10:00:00Z",
        }));
        let b = obj(json!({
            "_id": { "$oid": "42" },
            "alarm_code": "IO_ALR_108",
            "description": "CO high",
            "device": "esp32_04",
            "device_name": "Sensor 4",
            "createdAt": "2024-05-01T10:00:00Z",
        }));
        assert_eq!(n.alarm_at(&a, NOW), n.alarm_at(&b, NOW));
    }

    #[test]
    fn test_first_non_empty_alias_wins() {
        let raw = obj(json!({ "deviceId": "", "DeviceId": "  ", "device_id": "dev-7", "device": "other" }));
        assert_eq!(resolve_str(&raw, DEVICE_ID_ALIASES).as_deref(), Some("dev-7"));
    }

    #[test]
    fn test_alarm_defaults() {
        let alarm = normalizer().alarm_at(&Map::new(), NOW);
        assert_eq!(alarm.device_name, UNKNOWN_DEVICE);
        assert_eq!(alarm.alarm_code, "");
        assert!(alarm.is_active);
        assert!(!alarm.is_read);
        assert_eq!(alarm.created_timestamp, NOW);
        assert!(alarm.id.starts_with("alarm-1714564800000-"));
    }

    #[test]
    fn test_plant_inference_and_explicit_wins() {
        let n = normalizer();
        let inferred = n.alarm_at(&obj(json!({ "DeviceId": "esp32_04" })), NOW);
        assert_eq!(inferred.plant_name, "Plant C");

        let explicit = n.alarm_at(&obj(json!({ "DeviceId": "esp32_04", "plant": "Plant D" })), NOW);
        assert_eq!(explicit.plant_name, "Plant D");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let n = normalizer();
        let raw = obj(json!({ "AlarmCode": "IO_ALR_108", "DeviceId": "esp32_04" }));
        let once = n.alarm_at(&raw, NOW);
        let again = n.alarm_at(&obj(serde_json::to_value(&once).unwrap()), datetime!(2030-01-01 0:00 UTC));
        assert_eq!(once, again);

        let telemetry = n.telemetry_at(&obj(json!({ "DeviceId": "esp32_04", "co": 12.5, "temperature": 21 })), NOW);
        let again = n.telemetry_at(&obj(serde_json::to_value(&telemetry).unwrap()), datetime!(2030-01-01 0:00 UTC));
        assert_eq!(telemetry, again);
    }

    #[test]
    fn test_telemetry_keeps_readings_and_defaults_name() {
        let t = normalizer().telemetry_at(&obj(json!({ "device": "esp32_04", "co": 12.5, "ts": 1714557600 })), NOW);
        assert_eq!(t.device_name, "esp32_04");
        assert_eq!(t.plant_name, "Plant C");
        assert_eq!(t.timestamp, datetime!(2024-05-01 10:00:00 UTC));
        assert_eq!(t.readings.len(), 1);
        assert_eq!(t.readings["co"], json!(12.5));
    }

    #[test]
    fn test_timestamp_parsing() {
        assert_eq!(parse_timestamp(&json!(1714557600000_i64)), Some(datetime!(2024-05-01 10:00:00 UTC)));
        assert_eq!(parse_timestamp(&json!("not a date")), None);
        let t = normalizer().telemetry_at(&obj(json!({ "timestamp": "garbage" })), NOW);
        assert_eq!(t.timestamp, NOW);
    }

    #[test]
    fn test_does_not_mutate_input() {
        let raw = obj(json!({ "AlarmCode": "A" }));
        let copy = raw.clone();
        let _ = normalizer().normalize_at(&raw, RecordKind::Alarm, NOW);
        assert_eq!(raw, copy);
    }
}
