/*!
# GasMon Common - Modèles et protocole partagés kernel / client

- Modèles canoniques (télémétrie, alarmes, notifications)
- Normalisation des payloads hétérogènes (tables d'alias)
- Annuaire des usines (inférence plant depuis le nom de device)
- Noms de rooms, frames du canal push, coutures de transport
- Backoff de reconnexion (bus côté kernel, canal push côté client)
*/

pub mod backoff;
pub mod models;
pub mod normalize;
pub mod plants;
pub mod rooms;
pub mod signal;
pub mod transport;
pub mod wire;

pub use backoff::Backoff;
pub use models::{Alarm, CanonicalRecord, Notification, NotificationType, RecordKind, Telemetry};
pub use normalize::Normalizer;
pub use plants::{PlantDirectory, PlantEntry};
pub use rooms::{Room, Target};
pub use signal::stopped;
pub use transport::{BusPublish, PublishError, PushConnection, PushError, PushSink, PushTransport};
pub use wire::{ClientCommand, ServerFrame};
