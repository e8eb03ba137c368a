/**
 * DOCUMENT STORE - Persistance des alarmes et notifications
 *
 * RÔLE :
 * Contrat étroit `find / insert / update / update_many` sur des documents JSON,
 * plus un dépôt typé par enregistrement canonique (Alarm, Notification).
 *
 * FONCTIONNEMENT :
 * - JsonCollection = un fichier JSON par collection, cache mémoire sous Mutex,
 *   réécrit à chaque mutation
 * - Repository<T> relit chaque document à travers le Normalizer : les anciens
 *   documents (autre casse, champs manquants) sortent au format canonique
 * - Tri par horodatage décroissant, filtres usine/device insensibles à la casse
 *
 * UTILITÉ :
 * 🎯 Source du bulk-load client (GET /alarms, GET /notifications)
 * 🎯 Seule mutation autorisée : le flag lu/non lu
 */

use gasmon_common::{Alarm, CanonicalRecord, Normalizer, Notification, RecordKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("document already exists: {0}")]
    Conflict(String),
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Document = Map<String, Value>;

/// Filtre d'égalité champ par champ ; chaînes comparées sans casse
#[derive(Debug, Clone, Default)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|(field, expected)| match (doc.get(field), expected) {
            (Some(Value::String(actual)), Value::String(wanted)) => actual.eq_ignore_ascii_case(wanted),
            (Some(actual), wanted) => actual == wanted,
            (None, _) => false,
        })
    }
}

pub trait DocumentStore: Send + Sync {
    fn find(&self, filter: &Filter) -> Result<Vec<Document>, StoreError>;

    /// Insère un document ; un `id` est généré s'il manque
    fn insert(&self, doc: Document) -> Result<Document, StoreError>;

    /// Fusionne `patch` dans le document `id` et retourne le résultat
    fn update(&self, id: &str, patch: &Document) -> Result<Document, StoreError>;

    fn update_many(&self, filter: &Filter, patch: &Document) -> Result<usize, StoreError>;
}

/// Collection persistée dans un fichier JSON (tableau de documents)
pub struct JsonCollection {
    storage_path: PathBuf,
    cache: parking_lot::Mutex<Vec<Document>>,
}

impl JsonCollection {
    pub fn open<P: Into<PathBuf>>(storage_path: P) -> Result<Self, StoreError> {
        let collection = Self {
            storage_path: storage_path.into(),
            cache: parking_lot::Mutex::new(Vec::new()),
        };
        collection.load_from_disk()?;
        tracing::info!(path = %collection.storage_path.display(), "collection opened");
        Ok(collection)
    }

    fn load_from_disk(&self) -> Result<(), StoreError> {
        if !self.storage_path.exists() {
            if let Some(parent) = self.storage_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&self.storage_path, "[]")?;
        }

        let content = fs::read_to_string(&self.storage_path)?;
        let docs: Vec<Value> = serde_json::from_str(&content)?;
        let mut cache = self.cache.lock();
        cache.clear();
        for doc in docs {
            match doc {
                Value::Object(map) => cache.push(map),
                other => tracing::warn!(path = %self.storage_path.display(), value = %other, "non-object document skipped"),
            }
        }
        Ok(())
    }

    /// Appelé avec le cache verrouillé : écriture et mutation restent atomiques
    fn save_to_disk(&self, docs: &[Document]) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(docs)?;
        fs::write(&self.storage_path, json)?;
        Ok(())
    }
}

fn doc_id(doc: &Document) -> Option<&str> {
    doc.get("id").and_then(Value::as_str).filter(|id| !id.is_empty())
}

impl DocumentStore for JsonCollection {
    fn find(&self, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        let cache = self.cache.lock();
        Ok(cache.iter().filter(|doc| filter.matches(doc)).cloned().collect())
    }

    fn insert(&self, mut doc: Document) -> Result<Document, StoreError> {
        let id = match doc_id(&doc) {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                doc.insert("id".into(), Value::String(id.clone()));
                id
            }
        };

        let mut cache = self.cache.lock();
        if cache.iter().any(|existing| doc_id(existing) == Some(id.as_str())) {
            return Err(StoreError::Conflict(id));
        }
        cache.push(doc.clone());
        self.save_to_disk(&cache)?;
        tracing::debug!(id = %id, "document inserted");
        Ok(doc)
    }

    fn update(&self, id: &str, patch: &Document) -> Result<Document, StoreError> {
        let mut cache = self.cache.lock();
        let doc = cache
            .iter_mut()
            .find(|doc| doc_id(doc) == Some(id))
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        for (key, value) in patch {
            doc.insert(key.clone(), value.clone());
        }
        let updated = doc.clone();
        self.save_to_disk(&cache)?;
        Ok(updated)
    }

    fn update_many(&self, filter: &Filter, patch: &Document) -> Result<usize, StoreError> {
        let mut cache = self.cache.lock();
        let mut count = 0;
        for doc in cache.iter_mut().filter(|doc| filter.matches(doc)) {
            for (key, value) in patch {
                doc.insert(key.clone(), value.clone());
            }
            count += 1;
        }
        if count > 0 {
            self.save_to_disk(&cache)?;
        }
        Ok(count)
    }
}

/// Enregistrement canonique persistable
pub trait StoredRecord: Serialize + Clone + Send + Sync + 'static {
    const KIND: RecordKind;

    fn from_canonical(record: CanonicalRecord) -> Option<Self>;
    fn id(&self) -> &str;
    fn created(&self) -> OffsetDateTime;
    fn device_id(&self) -> &str;
    fn device_name(&self) -> &str;
    fn plant_name(&self) -> &str;
}

impl StoredRecord for Alarm {
    const KIND: RecordKind = RecordKind::Alarm;

    fn from_canonical(record: CanonicalRecord) -> Option<Self> {
        match record {
            CanonicalRecord::Alarm(alarm) => Some(alarm),
            _ => None,
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn created(&self) -> OffsetDateTime {
        self.created_timestamp
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn device_name(&self) -> &str {
        &self.device_name
    }

    fn plant_name(&self) -> &str {
        &self.plant_name
    }
}

impl StoredRecord for Notification {
    const KIND: RecordKind = RecordKind::Notification;

    fn from_canonical(record: CanonicalRecord) -> Option<Self> {
        match record {
            CanonicalRecord::Notification(notification) => Some(notification),
            _ => None,
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn created(&self) -> OffsetDateTime {
        self.created_timestamp
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn device_name(&self) -> &str {
        &self.device_name
    }

    fn plant_name(&self) -> &str {
        &self.plant_name
    }
}

/// Paramètres de liste (`?plantName=&deviceName=`)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordQuery {
    pub plant_name: Option<String>,
    pub device_name: Option<String>,
}

impl RecordQuery {
    fn admits<T: StoredRecord>(&self, record: &T) -> bool {
        let field_ok = |wanted: &Option<String>, actual: &str| match wanted.as_deref().map(str::trim) {
            Some(wanted) if !wanted.is_empty() => actual.eq_ignore_ascii_case(wanted),
            _ => true,
        };
        field_ok(&self.plant_name, record.plant_name()) && field_ok(&self.device_name, record.device_name())
    }
}

pub struct Repository<T> {
    store: Arc<dyn DocumentStore>,
    normalizer: Arc<Normalizer>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            normalizer: Arc::clone(&self.normalizer),
            _record: PhantomData,
        }
    }
}

impl<T: StoredRecord> Repository<T> {
    pub fn new(store: Arc<dyn DocumentStore>, normalizer: Arc<Normalizer>) -> Self {
        Self { store, normalizer, _record: PhantomData }
    }

    fn decode(&self, doc: &Document) -> Option<T> {
        T::from_canonical(self.normalizer.normalize(doc, T::KIND))
    }

    fn decode_all(&self, docs: &[Document]) -> Vec<T> {
        let mut records: Vec<T> = docs.iter().filter_map(|doc| self.decode(doc)).collect();
        records.sort_by(|a, b| b.created().cmp(&a.created()));
        records
    }

    pub fn list(&self, query: &RecordQuery) -> Result<Vec<T>, StoreError> {
        let docs = self.store.find(&Filter::all())?;
        let mut records = self.decode_all(&docs);
        records.retain(|record| query.admits(record));
        Ok(records)
    }

    pub fn by_device(&self, device_id: &str) -> Result<Vec<T>, StoreError> {
        // relecture normalisée : les documents legacy n'ont pas forcément `deviceId`
        let docs = self.store.find(&Filter::all())?;
        let mut records = self.decode_all(&docs);
        records.retain(|record| record.device_id().eq_ignore_ascii_case(device_id.trim()));
        Ok(records)
    }

    pub fn insert(&self, record: &T) -> Result<T, StoreError> {
        let doc = match serde_json::to_value(record)? {
            Value::Object(map) => map,
            _ => return Err(StoreError::InvalidDocument(record.id().to_string())),
        };
        let stored = self.store.insert(doc)?;
        self.decode(&stored)
            .ok_or_else(|| StoreError::InvalidDocument(record.id().to_string()))
    }

    pub fn mark_read(&self, id: &str) -> Result<T, StoreError> {
        let updated = self.store.update(id, &read_patch())?;
        self.decode(&updated).ok_or_else(|| StoreError::InvalidDocument(id.to_string()))
    }

    pub fn mark_all_read(&self) -> Result<usize, StoreError> {
        self.store.update_many(&Filter::all(), &read_patch())
    }
}

fn read_patch() -> Document {
    let mut patch = Document::new();
    patch.insert("isRead".into(), Value::Bool(true));
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;
    use time::macros::datetime;

    fn alarm(id: &str, device: &str, plant: &str, ts: OffsetDateTime) -> Alarm {
        Alarm {
            id: id.into(),
            alarm_code: "IO_ALR_108".into(),
            alarm_description: "CO level high".into(),
            device_id: device.into(),
            device_name: format!("{plant} - {device}"),
            plant_name: plant.into(),
            created_timestamp: ts,
            is_active: true,
            is_read: false,
        }
    }

    fn repo(dir: &Path) -> Repository<Alarm> {
        let store = JsonCollection::open(dir.join("alarms.json")).unwrap();
        Repository::new(Arc::new(store), Arc::new(Normalizer::default()))
    }

    #[test]
    fn test_insert_list_sorted_descending() {
        let dir = tempfile::tempdir().unwrap();
        let alarms = repo(dir.path());
        alarms.insert(&alarm("a1", "esp32_04", "Plant C", datetime!(2024-05-01 10:00 UTC))).unwrap();
        alarms.insert(&alarm("a2", "esp32_11", "Plant D", datetime!(2024-05-01 11:00 UTC))).unwrap();

        let all = alarms.list(&RecordQuery::default()).unwrap();
        assert_eq!(all.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(), vec!["a2", "a1"]);

        let plant_c = alarms
            .list(&RecordQuery { plant_name: Some("plant c".into()), device_name: None })
            .unwrap();
        assert_eq!(plant_c.len(), 1);
        assert_eq!(plant_c[0].id, "a1");
    }

    #[test]
    fn test_duplicate_id_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let alarms = repo(dir.path());
        let a = alarm("a1", "esp32_04", "Plant C", datetime!(2024-05-01 10:00 UTC));
        alarms.insert(&a).unwrap();
        assert!(matches!(alarms.insert(&a), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn test_mark_read_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let alarms = repo(dir.path());
            alarms.insert(&alarm("a1", "esp32_04", "Plant C", datetime!(2024-05-01 10:00 UTC))).unwrap();
            alarms.insert(&alarm("a2", "esp32_04", "Plant C", datetime!(2024-05-01 10:05 UTC))).unwrap();
            assert!(alarms.mark_read("a1").unwrap().is_read);
            assert!(matches!(alarms.mark_read("missing"), Err(StoreError::NotFound(_))));
        }

        let reopened = repo(dir.path());
        let by_device = reopened.by_device("ESP32_04").unwrap();
        assert_eq!(by_device.len(), 2);
        assert!(by_device.iter().find(|a| a.id == "a1").unwrap().is_read);
        assert!(!by_device.iter().find(|a| a.id == "a2").unwrap().is_read);

        assert_eq!(reopened.mark_all_read().unwrap(), 2);
        assert!(reopened.list(&RecordQuery::default()).unwrap().iter().all(|a| a.is_read));
    }

    #[test]
    fn test_legacy_documents_read_back_canonical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarms.json");
        fs::write(
            &path,
            json!([{
                "id": "legacy-1",
                "AlarmCode": "IO_ALR_7",
                "DeviceId": "esp32_02",
                "CreatedTimestamp": "2024-04-30T08:00:00Z"
            }])
            .to_string(),
        )
        .unwrap();

        let store = JsonCollection::open(&path).unwrap();
        let alarms: Repository<Alarm> = Repository::new(Arc::new(store), Arc::new(Normalizer::default()));
        let list = alarms.list(&RecordQuery::default()).unwrap();
        assert_eq!(list[0].alarm_code, "IO_ALR_7");
        assert_eq!(list[0].device_name, "Unknown Device");
        assert!(list[0].is_active);
    }

    #[test]
    fn test_filter_matching() {
        let doc = json!({"deviceId": "ESP32_04", "isRead": false}).as_object().unwrap().clone();
        assert!(Filter::all().matches(&doc));
        assert!(Filter::all().eq("deviceId", "esp32_04").matches(&doc));
        assert!(Filter::all().eq("isRead", false).matches(&doc));
        assert!(!Filter::all().eq("plantName", "Plant C").matches(&doc));
    }
}
