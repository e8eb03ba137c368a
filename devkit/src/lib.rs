/*!
# GasMon DevKit - Stubs et utilitaires de test

Bibliothèque de test partagée par le kernel et le client :
- Stub MQTT (publication enregistrée, réception simulée)
- Stubs du canal push (sink enregistreur, transport client pilotable)
- Constructeurs de payloads capteurs (casse canonique et legacy)
- Harness de test avec expectations sur les événements diffusés
*/

pub mod mqtt_stub;
pub mod push_stub;
pub mod test_utils;

pub use mqtt_stub::{GasPayloadBuilder, MockMessage, MockMqttClient};
pub use push_stub::{FailingPushSink, MockConnection, MockPushTransport, RecordingPushSink};
pub use test_utils::TestHarness;
