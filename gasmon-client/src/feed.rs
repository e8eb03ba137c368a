/**
 * FEED - Liste d'alarmes ou de notifications prête pour l'UI
 *
 * RÔLE :
 * Associe un `ReconciliationCache` au client HTTP (chargement initial) et au
 * gestionnaire d'abonnements (push temps réel).
 *
 * FONCTIONNEMENT :
 * - `refresh()` : ticket de fetch, requête HTTP hors verrou, application du ticket
 * - Échec backend : enregistrements courants conservés, `last_error` renseigné
 * - `attach()` : les callbacks push fusionnent dans le même cache
 *
 * UTILITÉ DANS GASMON :
 * 🎯 Une erreur transitoire n'interrompt jamais la livraison temps réel
 */
use crate::api::ApiClient;
use crate::cache::{CacheRecord, FilterContext, MergeOutcome, ReconciliationCache};
use crate::error::ClientError;
use crate::listeners::ListenerHandle;
use crate::manager::SubscriptionManager;
use gasmon_common::{Alarm, Notification};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Feed<R: CacheRecord> {
    api: ApiClient,
    cache: Arc<Mutex<ReconciliationCache<R>>>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl<R: CacheRecord> Clone for Feed<R> {
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
            cache: Arc::clone(&self.cache),
            last_error: Arc::clone(&self.last_error),
        }
    }
}

impl<R: CacheRecord> Feed<R> {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            cache: Arc::new(Mutex::new(ReconciliationCache::new())),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Change le filtre ; le cache est vidé si le contexte change
    pub fn set_context(&self, context: FilterContext) -> bool {
        self.cache.lock().set_context(context)
    }

    pub fn context(&self) -> FilterContext {
        self.cache.lock().context().clone()
    }

    /// Recharge le contexte courant. Un résultat arrivé après un changement
    /// de contexte est ignoré (`Ok(false)`).
    pub async fn refresh(&self) -> Result<bool, ClientError> {
        let (ticket, context) = {
            let mut cache = self.cache.lock();
            (cache.begin_fetch(), cache.context().clone())
        };

        match self.api.fetch::<R>(&context).await {
            Ok(records) => {
                let count = records.len();
                let applied = self.cache.lock().complete_fetch(ticket, records);
                if applied {
                    *self.last_error.lock() = None;
                    info!(kind = %R::KIND, count, "📋 Feed loaded");
                }
                Ok(applied)
            }
            Err(e) => {
                self.cache.lock().abort_fetch(ticket);
                warn!(kind = %R::KIND, error = %e, "❌ Feed load failed, keeping cached records");
                *self.last_error.lock() = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub fn merge(&self, record: R) -> MergeOutcome {
        self.cache.lock().merge_incoming(record)
    }

    pub async fn mark_read(&self, id: &str) -> Result<(), ClientError> {
        self.api.mark_read::<R>(id).await?;
        self.cache.lock().mark_read(id);
        Ok(())
    }

    pub async fn mark_all_read(&self) -> Result<usize, ClientError> {
        self.api.mark_all_read::<R>().await?;
        Ok(self.cache.lock().mark_all_read())
    }

    pub fn records(&self) -> Vec<R> {
        self.cache.lock().records().to_vec()
    }

    pub fn unread_count(&self) -> usize {
        self.cache.lock().unread_count()
    }

    pub fn loaded(&self) -> bool {
        self.cache.lock().loaded()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

impl Feed<Alarm> {
    pub fn attach(&self, manager: &SubscriptionManager) -> Vec<ListenerHandle> {
        let feed = self.clone();
        vec![manager.on_alarm(Arc::new(move |alarm: &Alarm| {
            feed.merge(alarm.clone());
        }))]
    }
}

impl Feed<Notification> {
    /// Notifications directes et notifications dérivées des alarmes
    pub fn attach(&self, manager: &SubscriptionManager) -> Vec<ListenerHandle> {
        let direct = self.clone();
        let derived = self.clone();
        vec![
            manager.on_notification(Arc::new(move |n: &Notification| {
                direct.merge(n.clone());
            })),
            manager.on_alarm_notification(Arc::new(move |n: &Notification| {
                derived.merge(n.clone());
            })),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::manager::ConnectionState;
    use gasmon_common::{Normalizer, PlantDirectory, PlantEntry};
    use gasmon_devkit::{GasPayloadBuilder, MockPushTransport};
    use serde_json::json;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn normalizer() -> Arc<Normalizer> {
        Arc::new(Normalizer::new(PlantDirectory::new(vec![PlantEntry {
            id: "plant-c".into(),
            name: "Plant C".into(),
            device_patterns: vec!["plant c".into()],
        }])))
    }

    fn unreachable_api() -> ApiClient {
        let mut config = ClientConfig::new("http://127.0.0.1:9");
        config.request_timeout = Duration::from_secs(2);
        ApiClient::new(&config, normalizer()).unwrap()
    }

    async fn eventually(check: impl Fn() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never met");
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_records_and_sets_error() {
        let feed: Feed<Alarm> = Feed::new(unreachable_api());
        let raw = GasPayloadBuilder::alarm("esp32_04", "IO_ALR_108", "Plant C - esp32_04");
        feed.merge(normalizer().alarm(raw.as_object().unwrap()));

        assert!(feed.refresh().await.is_err());
        assert_eq!(feed.records().len(), 1);
        assert!(feed.last_error().is_some());
        assert!(!feed.loaded());
    }

    #[tokio::test]
    async fn test_pushes_from_several_rooms_yield_one_record() {
        let transport = Arc::new(MockPushTransport::new());
        let config = ClientConfig { reconnect_base: Duration::from_millis(10), ..ClientConfig::default() };
        let manager = SubscriptionManager::new(transport.clone(), normalizer(), &config);
        let alarms: Feed<Alarm> = Feed::new(unreachable_api());
        let notifications: Feed<Notification> = Feed::new(unreachable_api());
        alarms.attach(&manager);
        notifications.attach(&manager);

        manager.subscribe_to_device("esp32_04");
        manager.connect();
        let conn = transport.accept(WAIT).await.unwrap();
        eventually(|| manager.state() == ConnectionState::Connected).await;

        // alarme sans id : chaque copie re-normalisée reçoit un id synthétique différent
        let raw = json!({"AlarmCode": "IO_ALR_108", "DeviceId": "esp32_04", "DeviceName": "Plant C - esp32_04"});
        conn.push("alarm", raw.clone());
        conn.push("alarm", raw);
        let derived = json!({
            "id": "notification-a1",
            "type": "alarm",
            "title": "IO_ALR_108",
            "deviceId": "esp32_04",
            "deviceName": "Plant C - esp32_04",
        });
        conn.push("alarm_notification", derived);

        eventually(|| notifications.records().len() == 1).await;
        let records = alarms.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].alarm_code, "IO_ALR_108");
        assert_eq!(records[0].plant_name, "Plant C");
        assert_eq!(alarms.unread_count(), 1);
        manager.disconnect();
    }

    #[tokio::test]
    async fn test_context_switch_clears_feed() {
        let feed: Feed<Alarm> = Feed::new(unreachable_api());
        feed.set_context(FilterContext::plant("Plant C"));
        let raw = GasPayloadBuilder::alarm("esp32_04", "IO_ALR_108", "Plant C - esp32_04");
        assert_eq!(feed.merge(normalizer().alarm(raw.as_object().unwrap())), MergeOutcome::Inserted);

        assert!(feed.set_context(FilterContext::plant("Plant D")));
        assert!(feed.records().is_empty());
        assert_eq!(feed.merge(normalizer().alarm(raw.as_object().unwrap())), MergeOutcome::Rejected);
    }
}
