/**
 * FAN-OUT ROUTER - Calcul des cibles et diffusion sur le canal push
 *
 * RÔLE :
 * Pour chaque enregistrement canonique, décide quelles rooms le reçoivent
 * (global, `device:<id>`, `plant:<id>`) et émet une fois par cible.
 *
 * FONCTIONNEMENT :
 * - route() : ensemble de cibles (BTreeSet, donc au plus un push par room)
 * - broadcast() : événement `telemetry` / `alarm` / `notification` sur chaque cible,
 *   plus l'alias historique `telemetry_<deviceId>` en global
 * - dispatch() : route + broadcast, et pour une alarme programme un
 *   `alarm_notification` différé, annulé par le signal d'arrêt
 *
 * UTILITÉ :
 * 🎯 Un push indisponible n'interrompt jamais le traitement : warn + compteur
 */

use crate::health::HealthTracker;
use gasmon_common::wire::{self, EVENT_ALARM, EVENT_ALARM_NOTIFICATION, EVENT_NOTIFICATION, EVENT_TELEMETRY};
use gasmon_common::{CanonicalRecord, Notification, PlantDirectory, PushSink, Room, ServerFrame, Target};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct FanoutRouter {
    sink: Arc<dyn PushSink>,
    plants: PlantDirectory,
    notification_delay: Duration,
    health: HealthTracker,
    shutdown: watch::Receiver<bool>,
}

impl FanoutRouter {
    pub fn new(
        sink: Arc<dyn PushSink>,
        plants: PlantDirectory,
        notification_delay: Duration,
        health: HealthTracker,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { sink, plants, notification_delay, health, shutdown }
    }

    pub fn route(&self, record: &CanonicalRecord) -> BTreeSet<Target> {
        let mut targets = BTreeSet::from([Target::Global]);

        let device_id = record.device_id().trim();
        if !device_id.is_empty() {
            targets.insert(Target::Room(Room::device(device_id)));
        }

        let plant_name = record.plant_name();
        if !plant_name.is_empty() {
            match self.plants.plant_id(plant_name) {
                Some(plant_id) => {
                    targets.insert(Target::Room(Room::plant(plant_id)));
                }
                None => tracing::debug!(plant = plant_name, "plant not in directory, no plant room"),
            }
        }

        targets
    }

    pub fn broadcast(&self, targets: &BTreeSet<Target>, record: &CanonicalRecord) {
        let data = match record.to_json() {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(kind = %record.kind(), error = %e, "record serialization failed, not broadcast");
                return;
            }
        };

        let event = match record {
            CanonicalRecord::Telemetry(_) => EVENT_TELEMETRY,
            CanonicalRecord::Alarm(_) => EVENT_ALARM,
            CanonicalRecord::Notification(_) => EVENT_NOTIFICATION,
        };

        for target in targets {
            emit_logged(self.sink.as_ref(), &self.health, target, ServerFrame::new(event, data.clone()));
        }

        if let CanonicalRecord::Telemetry(t) = record {
            if !t.device_id.is_empty() && targets.contains(&Target::Global) {
                let legacy = ServerFrame::new(wire::legacy_telemetry_event(&t.device_id), data);
                emit_logged(self.sink.as_ref(), &self.health, &Target::Global, legacy);
            }
        }
    }

    /// Route puis diffuse. Pour une alarme, retourne la tâche du
    /// `alarm_notification` différé.
    pub fn dispatch(&self, record: &CanonicalRecord) -> Option<JoinHandle<()>> {
        let targets = self.route(record);
        tracing::debug!(kind = %record.kind(), device = record.device_id(), targets = targets.len(), "dispatching record");
        self.broadcast(&targets, record);

        match record {
            CanonicalRecord::Alarm(alarm) => {
                let notification = Notification::from_alarm(alarm);
                Some(self.schedule_alarm_notification(targets, notification))
            }
            _ => None,
        }
    }

    fn schedule_alarm_notification(&self, targets: BTreeSet<Target>, notification: Notification) -> JoinHandle<()> {
        let sink = Arc::clone(&self.sink);
        let health = self.health.clone();
        let delay = self.notification_delay;
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            // sender fermé = processus en arrêt
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = gasmon_common::stopped(&mut shutdown) => {
                    tracing::debug!(id = %notification.id, "alarm notification cancelled by shutdown");
                    return;
                }
            }

            let data = match serde_json::to_value(&notification) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(id = %notification.id, error = %e, "notification serialization failed");
                    return;
                }
            };
            for target in &targets {
                emit_logged(
                    sink.as_ref(),
                    &health,
                    target,
                    ServerFrame::new(EVENT_ALARM_NOTIFICATION, data.clone()),
                );
            }
        })
    }
}

fn emit_logged(sink: &dyn PushSink, health: &HealthTracker, target: &Target, frame: ServerFrame) {
    match sink.emit(target, &frame) {
        Ok(delivered) => tracing::trace!(dest = %target, event = %frame.event, delivered, "frame emitted"),
        Err(e) => {
            health.record_push_failure();
            tracing::warn!(dest = %target, event = %frame.event, error = %e, "push emit failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gasmon_common::{Normalizer, PlantEntry, RecordKind};
    use gasmon_devkit::{FailingPushSink, GasPayloadBuilder, RecordingPushSink};

    fn plants() -> PlantDirectory {
        PlantDirectory::new(vec![PlantEntry {
            id: "plant-c".into(),
            name: "Plant C".into(),
            device_patterns: vec!["plant c".into()],
        }])
    }

    fn router(sink: Arc<dyn PushSink>, health: HealthTracker) -> (FanoutRouter, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let router = FanoutRouter::new(sink, plants(), Duration::from_millis(300), health, rx);
        (router, tx)
    }

    fn alarm_record() -> CanonicalRecord {
        let raw = GasPayloadBuilder::alarm("esp32_04", "IO_ALR_108", "Plant C - esp32_04");
        Normalizer::new(plants()).normalize(raw.as_object().unwrap(), RecordKind::Alarm)
    }

    #[test]
    fn test_route_resolves_device_and_plant_rooms() {
        let sink = Arc::new(RecordingPushSink::new());
        let (router, _tx) = router(sink, HealthTracker::new());

        let targets = router.route(&alarm_record());
        assert_eq!(
            targets,
            BTreeSet::from([
                Target::Global,
                Target::Room(Room::device("esp32_04")),
                Target::Room(Room::plant("plant-c")),
            ])
        );
    }

    #[test]
    fn test_unknown_plant_gets_no_plant_room() {
        let sink = Arc::new(RecordingPushSink::new());
        let (router, _tx) = router(sink, HealthTracker::new());
        let mut raw = GasPayloadBuilder::alarm("esp32_99", "IO_ALR_1", "sensor");
        raw["plantName"] = "Plant Z".into();
        let record = Normalizer::new(plants()).normalize(raw.as_object().unwrap(), RecordKind::Alarm);

        let targets = router.route(&record);
        assert_eq!(targets.len(), 2);
        assert!(!targets.iter().any(|t| matches!(t, Target::Room(Room::Plant(_)))));
    }

    #[test]
    fn test_telemetry_emits_legacy_alias_globally_only() {
        let sink = Arc::new(RecordingPushSink::new());
        let (router, _tx) = router(sink.clone(), HealthTracker::new());
        let raw = GasPayloadBuilder::telemetry("esp32_04", "Plant C - esp32_04");
        let record = Normalizer::new(plants()).normalize(raw.as_object().unwrap(), RecordKind::Telemetry);

        assert!(router.dispatch(&record).is_none());

        let legacy = sink.frames_named("telemetry_esp32_04");
        assert_eq!(legacy.len(), 1);
        assert_eq!(legacy[0].0, Target::Global);
        assert_eq!(sink.frames_named("telemetry").len(), 3);
        assert_eq!(legacy[0].1.data["deviceId"], "esp32_04");
    }

    #[tokio::test(start_paused = true)]
    async fn test_alarm_notification_follows_after_delay() {
        let sink = Arc::new(RecordingPushSink::new());
        let (router, _tx) = router(sink.clone(), HealthTracker::new());

        let handle = router.dispatch(&alarm_record()).unwrap();
        assert_eq!(sink.frames_named("alarm").len(), 3);
        assert!(sink.frames_named("alarm_notification").is_empty());

        handle.await.unwrap();
        let notifications = sink.frames_named("alarm_notification");
        assert_eq!(notifications.len(), 3);
        assert_eq!(notifications[0].1.data["type"], "alarm");
        assert_eq!(notifications[0].1.data["title"], "IO_ALR_108");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_notification() {
        let sink = Arc::new(RecordingPushSink::new());
        let (router, tx) = router(sink.clone(), HealthTracker::new());

        let handle = router.dispatch(&alarm_record()).unwrap();
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(sink.frames_named("alarm_notification").is_empty());
    }

    #[test]
    fn test_push_failure_is_counted_not_raised() {
        let health = HealthTracker::new();
        let (router, _tx) = router(Arc::new(FailingPushSink), health.clone());
        let raw = GasPayloadBuilder::telemetry("esp32_04", "Plant C - esp32_04");
        let record = Normalizer::new(plants()).normalize(raw.as_object().unwrap(), RecordKind::Telemetry);

        router.broadcast(&router.route(&record), &record);
        // 3 cibles + alias historique
        assert_eq!(health.get_health().push_failures, 4);
    }
}
