/*!
Test Harness GasMon

Facilite les tests de bout en bout côté kernel :
- Stub MQTT dont les messages simulés sont récupérés par le test
- Sink push enregistreur (à brancher sur le router testé)
- Expectations sur le nombre d'événements diffusés
*/

use crate::mqtt_stub::{GasPayloadBuilder, MockMessage, MockMqttClient};
use crate::push_stub::RecordingPushSink;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
    pub push_sink: Arc<RecordingPushSink>,
    incoming: mpsc::UnboundedReceiver<MockMessage>,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    event: String,
    expected_count: usize,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::builder().is_test(true).try_init().ok();

        let mqtt_client = MockMqttClient::new();
        let incoming = mqtt_client.setup_receiver();
        Self {
            mqtt_client,
            push_sink: Arc::new(RecordingPushSink::new()),
            incoming,
            expectations: Vec::new(),
        }
    }

    /// On s'attend à exactement `count` frames `event` (toutes cibles confondues)
    pub fn expect_events(&mut self, event: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation { event: event.to_string(), expected_count: count });
        self
    }

    pub async fn send_json(&self, topic: &str, payload: &Value) -> Result<()> {
        self.mqtt_client.simulate_incoming(topic, serde_json::to_vec(payload)?).await
    }

    pub async fn send_alarm(&self, device_id: &str, code: &str, device_name: &str) -> Result<()> {
        let payload = GasPayloadBuilder::alarm(device_id, code, device_name);
        self.send_json("alarms", &payload).await?;
        log::info!("🚨 Sent alarm {} for {}", code, device_id);
        Ok(())
    }

    pub async fn send_telemetry(&self, device_id: &str, device_name: &str) -> Result<()> {
        let payload = GasPayloadBuilder::telemetry(device_id, device_name);
        self.send_json("telemetry", &payload).await
    }

    /// Prochain message simulé, à passer au composant testé
    pub async fn next_incoming(&mut self) -> Option<MockMessage> {
        self.incoming.recv().await
    }

    pub fn verify_expectations(&self) -> Result<()> {
        log::info!("🔍 Verifying {} expectations...", self.expectations.len());

        for expectation in &self.expectations {
            let actual_count = self.push_sink.frames_named(&expectation.event).len();
            if actual_count != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for event '{}': expected {} frames, got {}",
                    expectation.event,
                    expectation.expected_count,
                    actual_count
                );
            }
        }
        Ok(())
    }

    /// Vérifie qu'un champ a la valeur attendue dans le dernier frame `event`
    pub fn assert_field_equals(&self, event: &str, field_path: &str, expected: &Value) -> Result<()> {
        let frames = self.push_sink.frames_named(event);
        let Some((_, frame)) = frames.last() else {
            anyhow::bail!("No frame emitted for event '{}'", event);
        };
        match get_nested_field(&frame.data, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!("Field '{}' mismatch: expected {:?}, got {:?}", field_path, expected, actual),
            None => anyhow::bail!("Field '{}' not found in '{}' frame", field_path, event),
        }
    }

    pub fn get_stats(&self) -> TestStats {
        let mut event_counts = HashMap::new();
        let frames = self.push_sink.frames();
        for (_, frame) in &frames {
            *event_counts.entry(frame.event.clone()).or_insert(0) += 1;
        }
        TestStats {
            total_frames: frames.len(),
            event_counts,
            published: self.mqtt_client.get_published_messages().len(),
        }
    }

    pub fn reset(&mut self) {
        self.mqtt_client.clear();
        self.push_sink.clear();
        self.expectations.clear();
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| match current {
        Value::Object(obj) => obj.get(part),
        _ => None,
    })
}

#[derive(Debug)]
pub struct TestStats {
    pub total_frames: usize,
    pub event_counts: HashMap<String, usize>,
    pub published: usize,
}
