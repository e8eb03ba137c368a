use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

/// Compteurs par canal du bus
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub received: u64,
    pub dropped: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub bus_status: BusStatus,
    pub bus_reconnects: u32,
    pub channels: BTreeMap<String, ChannelStats>,
    pub push_clients: usize,
    pub push_rooms: usize,
    pub push_failures: u64,
}

/// Compteurs et états du kernel, possédés par une instance (pas d'état global).
/// Clonable : toutes les copies partagent les mêmes compteurs.
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    bus_reconnects: Arc<AtomicU32>,
    bus_status: Arc<Mutex<BusStatus>>,
    channels: Arc<Mutex<BTreeMap<String, ChannelStats>>>,
    push_clients: Arc<AtomicUsize>,
    push_rooms: Arc<AtomicUsize>,
    push_failures: Arc<AtomicU64>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            bus_reconnects: Arc::new(AtomicU32::new(0)),
            bus_status: Arc::new(Mutex::new(BusStatus::Connecting)),
            channels: Arc::new(Mutex::new(BTreeMap::new())),
            push_clients: Arc::new(AtomicUsize::new(0)),
            push_rooms: Arc::new(AtomicUsize::new(0)),
            push_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_bus_status(&self, status: BusStatus) {
        *self.bus_status.lock() = status;
    }

    pub fn bus_status(&self) -> BusStatus {
        *self.bus_status.lock()
    }

    pub fn increment_reconnects(&self) {
        self.bus_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.bus_status.lock() = BusStatus::Reconnecting;
    }

    pub fn record_received(&self, channel: &str) {
        self.channels.lock().entry(channel.to_string()).or_default().received += 1;
    }

    pub fn record_dropped(&self, channel: &str) {
        self.channels.lock().entry(channel.to_string()).or_default().dropped += 1;
    }

    pub fn record_push_failure(&self) {
        self.push_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_push_gauges(&self, clients: usize, rooms: usize) {
        self.push_clients.store(clients, Ordering::Relaxed);
        self.push_rooms.store(rooms, Ordering::Relaxed);
    }

    pub fn channel_stats(&self, channel: &str) -> ChannelStats {
        self.channels.lock().get(channel).cloned().unwrap_or_default()
    }

    pub fn get_health(&self) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
            bus_status: self.bus_status(),
            bus_reconnects: self.bus_reconnects.load(Ordering::Relaxed),
            channels: self.channels.lock().clone(),
            push_clients: self.push_clients.load(Ordering::Relaxed),
            push_rooms: self.push_rooms.load(Ordering::Relaxed),
            push_failures: self.push_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }

    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_shared_between_clones() {
        let health = HealthTracker::new();
        let clone = health.clone();
        clone.record_received("alarms");
        clone.record_received("alarms");
        clone.record_dropped("alarms");
        clone.increment_reconnects();
        clone.record_push_failure();

        let snapshot = health.get_health();
        assert_eq!(snapshot.channels["alarms"], ChannelStats { received: 2, dropped: 1 });
        assert_eq!(snapshot.bus_reconnects, 1);
        assert_eq!(snapshot.bus_status, BusStatus::Reconnecting);
        assert_eq!(snapshot.push_failures, 1);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let health = HealthTracker::new();
        health.set_bus_status(BusStatus::Connected);
        let json = serde_json::to_value(health.get_health()).unwrap();
        assert_eq!(json["bus_status"], "connected");
    }
}
