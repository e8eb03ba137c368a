/*!
Mock MQTT Client pour tests sans broker

Enregistre tous les messages publiés (dont ceux du kernel via `BusPublish`)
et permet de simuler la réception de payloads capteurs.
*/

use anyhow::Result;
use futures_util::future::BoxFuture;
use gasmon_common::{BusPublish, PublishError};
use parking_lot::Mutex;
use rumqttc::QoS;
use serde_json::{json, Value};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Bus simulé : côté kernel via `BusPublish`, côté capteurs via `simulate_incoming`
#[derive(Clone)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    message_sender: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self {
            published_messages: Arc::new(Mutex::new(Vec::new())),
            message_sender: Arc::new(Mutex::new(None)),
        }
    }

    /// Configuration d'un channel pour recevoir les messages simulés
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.message_sender.lock() = Some(sender);
        receiver
    }

    fn record(&self, message: MockMessage) {
        log::info!("📤 [MOCK] Published to {}: {} bytes", message.topic, message.payload.len());
        self.published_messages.lock().push(message);
    }

    /// Simule la réception d'un message (pour tests)
    pub async fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        };

        if let Some(sender) = self.message_sender.lock().as_ref() {
            sender.send(message.clone()).map_err(|e| anyhow::anyhow!("Send error: {}", e))?;
        }

        log::info!("📨 [MOCK] Simulated incoming: {}", message.topic);
        Ok(())
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parse le dernier message d'un topic en JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last_msg) => Ok(Some(serde_json::from_slice(&last_msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().clear();
    }
}

impl Default for MockMqttClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BusPublish for MockMqttClient {
    fn publish<'a>(&'a self, channel: &'a str, message: Value) -> BoxFuture<'a, Result<(), PublishError>> {
        Box::pin(async move {
            let payload = serde_json::to_vec(&message)?;
            self.record(MockMessage {
                topic: channel.to_string(),
                payload,
                qos: QoS::AtLeastOnce,
                retain: false,
            });
            Ok(())
        })
    }
}

fn rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}

/// Payloads capteurs tels que publiés sur le bus (casse canonique ou legacy)
pub struct GasPayloadBuilder;

impl GasPayloadBuilder {
    pub fn telemetry(device_id: &str, device_name: &str) -> Value {
        json!({
            "deviceId": device_id,
            "deviceName": device_name,
            "temperature": 22.5,
            "humidity": 41.0,
            "co": 3.2,
            "timestamp": rfc3339(OffsetDateTime::now_utc()),
        })
    }

    pub fn alarm(device_id: &str, code: &str, device_name: &str) -> Value {
        Self::alarm_at(device_id, code, device_name, OffsetDateTime::now_utc())
    }

    pub fn alarm_at(device_id: &str, code: &str, device_name: &str, created: OffsetDateTime) -> Value {
        json!({
            "deviceId": device_id,
            "deviceName": device_name,
            "alarmCode": code,
            "alarmDescription": format!("{code} threshold exceeded"),
            "createdTimestamp": rfc3339(created),
        })
    }

    /// Variante PascalCase (anciens firmwares / documents historiques)
    pub fn alarm_legacy(device_id: &str, code: &str, device_name: &str) -> Value {
        json!({
            "DeviceId": device_id,
            "DeviceName": device_name,
            "AlarmCode": code,
            "AlarmDescription": format!("{code} threshold exceeded"),
            "CreatedTimestamp": rfc3339(OffsetDateTime::now_utc()),
            "IsActive": "true",
        })
    }

    pub fn notification(device_id: &str, title: &str, message: &str) -> Value {
        json!({
            "deviceId": device_id,
            "Type": "Device",
            "title": title,
            "message": message,
            "createdTimestamp": rfc3339(OffsetDateTime::now_utc()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_published_messages_filtered_by_topic() {
        let client = MockMqttClient::new();
        let bus: &dyn BusPublish = &client;
        bus.publish("alarms", json!({"alarmCode": "IO_ALR_108"})).await.unwrap();
        bus.publish("kernel/health", json!({"busStatus": "connected"})).await.unwrap();

        assert_eq!(client.get_published_messages().len(), 2);
        let alarms = client.find_messages_by_topic("alarms");
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].qos, QoS::AtLeastOnce);
        assert!(!alarms[0].retain);

        client.clear();
        assert!(client.get_published_messages().is_empty());
        assert!(client.get_last_json_message::<Value>("alarms").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bus_publish_is_recorded_as_json() {
        let client = MockMqttClient::new();
        let bus: &dyn BusPublish = &client;
        bus.publish("alarms", json!({"alarmCode": "IO_ALR_108"})).await.unwrap();

        let parsed: Option<Value> = client.get_last_json_message("alarms").unwrap();
        assert_eq!(parsed.unwrap()["alarmCode"], "IO_ALR_108");
    }

    #[tokio::test]
    async fn test_simulated_incoming_reaches_receiver() {
        let client = MockMqttClient::new();
        let mut rx = client.setup_receiver();
        client.simulate_incoming("telemetry", b"{}".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().topic, "telemetry");
    }

    #[test]
    fn test_payload_builders() {
        let alarm = GasPayloadBuilder::alarm("esp32_04", "IO_ALR_108", "Plant C - esp32_04");
        assert_eq!(alarm["alarmCode"], "IO_ALR_108");
        assert!(alarm["createdTimestamp"].as_str().unwrap().contains('T'));

        let legacy = GasPayloadBuilder::alarm_legacy("esp32_04", "IO_ALR_108", "x");
        assert_eq!(legacy["DeviceId"], "esp32_04");
    }
}
