//! Registres typés des callbacks du canal push.
//!
//! Un même callback (`Arc`) enregistré deux fois pour un même événement ne
//! produit qu'une entrée. Chaque enregistrement retourne un [`ListenerHandle`]
//! dont `dispose()` retire exactement ce callback ; lâcher le handle ne retire rien.
//! Les callbacks sont invoqués hors verrou.

use gasmon_common::{Alarm, Notification, Telemetry};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    Telemetry,
    Alarm,
    AlarmNotification,
    Notification,
}

struct Entry<T> {
    id: u64,
    callback: Callback<T>,
    device_filter: Option<String>,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: Arc::clone(&self.callback),
            device_filter: self.device_filter.clone(),
        }
    }
}

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    telemetry: Vec<Entry<Telemetry>>,
    alarm: Vec<Entry<Alarm>>,
    alarm_notification: Vec<Entry<Notification>>,
    notification: Vec<Entry<Notification>>,
}

impl ListenerTable {
    fn remove(&mut self, kind: ListenerKind, id: u64) -> bool {
        fn drop_id<T>(entries: &mut Vec<Entry<T>>, id: u64) -> bool {
            let before = entries.len();
            entries.retain(|e| e.id != id);
            entries.len() != before
        }
        match kind {
            ListenerKind::Telemetry => drop_id(&mut self.telemetry, id),
            ListenerKind::Alarm => drop_id(&mut self.alarm, id),
            ListenerKind::AlarmNotification => drop_id(&mut self.alarm_notification, id),
            ListenerKind::Notification => drop_id(&mut self.notification, id),
        }
    }
}

/// Ajoute `callback` sauf s'il est déjà présent (même `Arc`) ; retourne l'id de l'entrée
fn upsert<T>(next_id: &mut u64, entries: &mut Vec<Entry<T>>, callback: Callback<T>, device_filter: Option<String>) -> u64 {
    if let Some(existing) = entries.iter_mut().find(|e| Arc::ptr_eq(&e.callback, &callback)) {
        existing.device_filter = device_filter;
        return existing.id;
    }
    *next_id += 1;
    let id = *next_id;
    entries.push(Entry { id, callback, device_filter });
    id
}

/// Correspondance tolérante : égalité ou inclusion dans un sens ou l'autre, sans casse
pub fn device_matches(filter: &str, telemetry: &Telemetry) -> bool {
    let wanted = filter.trim().to_lowercase();
    if wanted.is_empty() {
        return true;
    }
    [&telemetry.device_id, &telemetry.device_name].into_iter().any(|candidate| {
        let candidate = candidate.trim().to_lowercase();
        !candidate.is_empty() && (candidate == wanted || candidate.contains(&wanted) || wanted.contains(&candidate))
    })
}

#[derive(Clone, Default)]
pub struct Listeners {
    table: Arc<Mutex<ListenerTable>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, kind: ListenerKind, id: u64) -> ListenerHandle {
        ListenerHandle { table: Arc::downgrade(&self.table), kind, id }
    }

    pub fn add_telemetry(&self, callback: Callback<Telemetry>, device_filter: Option<String>) -> ListenerHandle {
        let id = {
            let mut table = self.table.lock();
            let ListenerTable { next_id, telemetry, .. } = &mut *table;
            upsert(next_id, telemetry, callback, device_filter)
        };
        self.handle(ListenerKind::Telemetry, id)
    }

    pub fn add_alarm(&self, callback: Callback<Alarm>) -> ListenerHandle {
        let id = {
            let mut table = self.table.lock();
            let ListenerTable { next_id, alarm, .. } = &mut *table;
            upsert(next_id, alarm, callback, None)
        };
        self.handle(ListenerKind::Alarm, id)
    }

    pub fn add_alarm_notification(&self, callback: Callback<Notification>) -> ListenerHandle {
        let id = {
            let mut table = self.table.lock();
            let ListenerTable { next_id, alarm_notification, .. } = &mut *table;
            upsert(next_id, alarm_notification, callback, None)
        };
        self.handle(ListenerKind::AlarmNotification, id)
    }

    pub fn add_notification(&self, callback: Callback<Notification>) -> ListenerHandle {
        let id = {
            let mut table = self.table.lock();
            let ListenerTable { next_id, notification, .. } = &mut *table;
            upsert(next_id, notification, callback, None)
        };
        self.handle(ListenerKind::Notification, id)
    }

    pub fn count(&self, kind: ListenerKind) -> usize {
        let table = self.table.lock();
        match kind {
            ListenerKind::Telemetry => table.telemetry.len(),
            ListenerKind::Alarm => table.alarm.len(),
            ListenerKind::AlarmNotification => table.alarm_notification.len(),
            ListenerKind::Notification => table.notification.len(),
        }
    }

    pub fn emit_telemetry(&self, telemetry: &Telemetry) {
        let entries = self.table.lock().telemetry.clone();
        for entry in entries {
            let passes = entry.device_filter.as_deref().is_none_or(|f| device_matches(f, telemetry));
            if passes {
                (entry.callback)(telemetry);
            }
        }
    }

    pub fn emit_alarm(&self, alarm: &Alarm) {
        let entries = self.table.lock().alarm.clone();
        for entry in entries {
            (entry.callback)(alarm);
        }
    }

    pub fn emit_alarm_notification(&self, notification: &Notification) {
        let entries = self.table.lock().alarm_notification.clone();
        for entry in entries {
            (entry.callback)(notification);
        }
    }

    pub fn emit_notification(&self, notification: &Notification) {
        let entries = self.table.lock().notification.clone();
        for entry in entries {
            (entry.callback)(notification);
        }
    }
}

/// Jeton de désinscription d'un callback
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    table: Weak<Mutex<ListenerTable>>,
    kind: ListenerKind,
    id: u64,
}

impl ListenerHandle {
    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    /// Retire ce callback ; sans effet s'il l'a déjà été
    pub fn dispose(&self) -> bool {
        match self.table.upgrade() {
            Some(table) => table.lock().remove(self.kind, self.id),
            None => false,
        }
    }
}
