/**
 * CACHE DE RÉCONCILIATION - Fusion chargement initial / push temps réel
 *
 * RÔLE :
 * Source unique de vérité rendue par l'UI pour une liste d'alarmes ou de
 * notifications. Les résultats d'API et les événements push passent par le
 * même chemin de fusion.
 *
 * FONCTIONNEMENT :
 * - Ordre : toujours trié par `createdTimestamp` décroissant
 * - Dédup : même id, ou même libellé + même device à moins de 5 s d'écart
 * - Contexte : filtre device/plant courant, tout changement invalide le cache
 * - Course fetch/push : `begin_fetch()` délivre un ticket (époque + séquence).
 *   Les pushs reçus pendant le fetch sont gardés de côté puis re-fusionnés
 *   après le bulk load ; un ticket périmé est ignoré.
 *
 * UTILITÉ DANS GASMON :
 * 🎯 Exactement un enregistrement par événement logique malgré le fan-out multi-rooms
 * 🎯 Aucune fuite d'une usine à l'autre lors d'un changement de filtre
 */
use gasmon_common::{Alarm, Normalizer, Notification, RecordKind};
use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime};
use tracing::debug;

/// Fenêtre de dédup par défaut
pub const DEDUP_WINDOW: Duration = Duration::seconds(5);

/// Enregistrement gérable par le cache (alarme ou notification)
pub trait CacheRecord: Clone + Send + Sync + 'static {
    const KIND: RecordKind;
    /// Segment d'URL de la collection côté kernel
    const COLLECTION: &'static str;

    fn normalize(normalizer: &Normalizer, raw: &Map<String, Value>) -> Self;
    fn id(&self) -> &str;
    /// Code d'alarme ou titre de notification
    fn label(&self) -> &str;
    fn device_id(&self) -> &str;
    fn device_name(&self) -> &str;
    fn plant_name(&self) -> &str;
    fn created(&self) -> OffsetDateTime;
    fn is_read(&self) -> bool;
    fn set_read(&mut self, read: bool);
}

impl CacheRecord for Alarm {
    const KIND: RecordKind = RecordKind::Alarm;
    const COLLECTION: &'static str = "alarms";

    fn normalize(normalizer: &Normalizer, raw: &Map<String, Value>) -> Self {
        normalizer.alarm(raw)
    }
    fn id(&self) -> &str {
        &self.id
    }
    fn label(&self) -> &str {
        &self.alarm_code
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
    fn created(&self) -> OffsetDateTime {
        self.created_timestamp
    }
    fn is_read(&self) -> bool {
        self.is_read
    }
    fn set_read(&mut self, read: bool) {
        self.is_read = read;
    }
}

impl CacheRecord for Notification {
    const KIND: RecordKind = RecordKind::Notification;
    const COLLECTION: &'static str = "notifications";

    fn normalize(normalizer: &Normalizer, raw: &Map<String, Value>) -> Self {
        normalizer.notification(raw)
    }
    fn id(&self) -> &str {
        &self.id
    }
    fn label(&self) -> &str {
        &self.title
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
    fn created(&self) -> OffsetDateTime {
        self.created_timestamp
    }
    fn is_read(&self) -> bool {
        self.is_read
    }
    fn set_read(&mut self, read: bool) {
        self.is_read = read;
    }
}

/// Filtre courant de l'UI. Vide = tout admettre.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterContext {
    pub device: Option<String>,
    pub plant: Option<String>,
}

impl FilterContext {
    pub fn device(id: impl Into<String>) -> Self {
        Self { device: Some(id.into()), plant: None }
    }

    pub fn plant(name: impl Into<String>) -> Self {
        Self { device: None, plant: Some(name.into()) }
    }

    pub fn admits<R: CacheRecord>(&self, record: &R) -> bool {
        let device_ok = self.device.as_deref().is_none_or(|d| {
            let d = d.trim();
            record.device_id().eq_ignore_ascii_case(d) || record.device_name().eq_ignore_ascii_case(d)
        });
        let plant_ok = self
            .plant
            .as_deref()
            .is_none_or(|p| record.plant_name().eq_ignore_ascii_case(p.trim()));
        device_ok && plant_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Duplicate,
    /// Hors du contexte de filtre courant
    Rejected,
}

/// Ticket d'un fetch en cours ; seul le plus récent de l'époque courante s'applique
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    epoch: u64,
    seq: u64,
}

impl FetchTicket {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

pub struct ReconciliationCache<R: CacheRecord> {
    records: Vec<R>,
    loaded: bool,
    last_fetch_time: Option<OffsetDateTime>,
    context: FilterContext,
    epoch: u64,
    fetch_seq: u64,
    outstanding: Option<u64>,
    in_flight: Vec<R>,
    dedup_window: Duration,
}

impl<R: CacheRecord> Default for ReconciliationCache<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CacheRecord> ReconciliationCache<R> {
    pub fn new() -> Self {
        Self::with_window(DEDUP_WINDOW)
    }

    pub fn with_window(dedup_window: Duration) -> Self {
        Self {
            records: Vec::new(),
            loaded: false,
            last_fetch_time: None,
            context: FilterContext::default(),
            epoch: 0,
            fetch_seq: 0,
            outstanding: None,
            in_flight: Vec::new(),
            dedup_window,
        }
    }

    pub fn records(&self) -> &[R] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn loaded(&self) -> bool {
        self.loaded
    }

    pub fn last_fetch_time(&self) -> Option<OffsetDateTime> {
        self.last_fetch_time
    }

    pub fn context(&self) -> &FilterContext {
        &self.context
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn unread_count(&self) -> usize {
        self.records.iter().filter(|r| !r.is_read()).count()
    }

    /// Remplace tout le contenu (dédupliqué par id, trié)
    pub fn bulk_load(&mut self, records: Vec<R>) {
        let mut unique: Vec<R> = Vec::with_capacity(records.len());
        for record in records {
            if !unique.iter().any(|r| r.id() == record.id()) {
                unique.push(record);
            }
        }
        self.records = unique;
        self.sort();
        self.loaded = true;
        self.last_fetch_time = Some(OffsetDateTime::now_utc());
        debug!(kind = %R::KIND, count = self.records.len(), "Cache bulk loaded");
    }

    pub fn merge_incoming(&mut self, record: R) -> MergeOutcome {
        if !self.context.admits(&record) {
            debug!(kind = %R::KIND, id = record.id(), "Push outside current context rejected");
            return MergeOutcome::Rejected;
        }
        if self.outstanding.is_some() && !self.in_flight.iter().any(|r| r.id() == record.id()) {
            self.in_flight.push(record.clone());
        }
        self.insert_unique(record)
    }

    fn insert_unique(&mut self, record: R) -> MergeOutcome {
        if self.records.iter().any(|existing| self.is_duplicate(existing, &record)) {
            return MergeOutcome::Duplicate;
        }
        self.records.insert(0, record);
        self.sort();
        MergeOutcome::Inserted
    }

    fn is_duplicate(&self, existing: &R, incoming: &R) -> bool {
        if existing.id() == incoming.id() {
            return true;
        }
        existing.label() == incoming.label()
            && existing.device_name() == incoming.device_name()
            && (existing.created() - incoming.created()).abs() <= self.dedup_window
    }

    fn sort(&mut self) {
        self.records.sort_by_key(|r| std::cmp::Reverse(r.created()));
    }

    /// Les copies gardées pour un fetch en cours suivent aussi, sinon
    /// `complete_fetch` réinsérerait une version non lue
    pub fn mark_read(&mut self, id: &str) -> bool {
        for pushed in self.in_flight.iter_mut().filter(|r| r.id() == id) {
            pushed.set_read(true);
        }
        match self.records.iter_mut().find(|r| r.id() == id) {
            Some(record) => {
                record.set_read(true);
                true
            }
            None => false,
        }
    }

    /// Retourne le nombre d'enregistrements passés à lu
    pub fn mark_all_read(&mut self) -> usize {
        for pushed in self.in_flight.iter_mut() {
            pushed.set_read(true);
        }
        let mut changed = 0;
        for record in self.records.iter_mut().filter(|r| !r.is_read()) {
            record.set_read(true);
            changed += 1;
        }
        changed
    }

    /// Vide le cache et périme tous les tickets en cours
    pub fn invalidate(&mut self) {
        self.records.clear();
        self.in_flight.clear();
        self.outstanding = None;
        self.loaded = false;
        self.epoch += 1;
        debug!(kind = %R::KIND, epoch = self.epoch, "Cache invalidated");
    }

    /// Change le filtre ; invalide seulement si le contexte change réellement
    pub fn set_context(&mut self, context: FilterContext) -> bool {
        if context == self.context {
            return false;
        }
        self.context = context;
        self.invalidate();
        true
    }

    pub fn begin_fetch(&mut self) -> FetchTicket {
        self.fetch_seq += 1;
        self.outstanding = Some(self.fetch_seq);
        self.in_flight.clear();
        FetchTicket { epoch: self.epoch, seq: self.fetch_seq }
    }

    fn is_current(&self, ticket: FetchTicket) -> bool {
        ticket.epoch == self.epoch && self.outstanding == Some(ticket.seq)
    }

    /// Applique le résultat d'un fetch. `false` si le ticket est périmé.
    pub fn complete_fetch(&mut self, ticket: FetchTicket, records: Vec<R>) -> bool {
        if !self.is_current(ticket) {
            debug!(kind = %R::KIND, epoch = ticket.epoch, "Stale fetch result discarded");
            return false;
        }
        self.outstanding = None;
        let pushed = std::mem::take(&mut self.in_flight);
        self.bulk_load(records);
        for record in pushed {
            self.insert_unique(record);
        }
        true
    }

    /// Abandon d'un fetch en échec : le contenu courant est conservé
    pub fn abort_fetch(&mut self, ticket: FetchTicket) {
        if self.is_current(ticket) {
            self.outstanding = None;
            self.in_flight.clear();
        }
    }
}
