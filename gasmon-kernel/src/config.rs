use gasmon_common::{PlantDirectory, PlantEntry};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttConf,
    pub http: HttpConf,
    pub channels: ChannelsConf,
    pub timing: TimingConf,
    pub plants: Vec<PlantEntry>,
    pub data_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConf {
    pub bind: String, // ex: "0.0.0.0:8080"
}

/// Noms des topics du bus
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ChannelsConf {
    pub telemetry: String,
    pub alarms: String,
    pub health: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TimingConf {
    /// Délai entre le broadcast `alarm` et le broadcast `alarm_notification`
    pub notification_delay_ms: u64,
    /// Période de la sonde de vie du bus
    pub probe_interval_secs: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

fn default_client_id() -> String {
    "gasmon-kernel".into()
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConf::default(),
            http: HttpConf { bind: "0.0.0.0:8080".into() },
            channels: ChannelsConf::default(),
            timing: TimingConf::default(),
            plants: Vec::new(),
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self { host: "localhost".into(), port: 1883, client_id: default_client_id() }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl Default for ChannelsConf {
    fn default() -> Self {
        Self {
            telemetry: "telemetry".into(),
            alarms: "alarms".into(),
            health: "gasmon/kernel/health".into(),
        }
    }
}

impl Default for TimingConf {
    fn default() -> Self {
        Self {
            notification_delay_ms: 300,
            probe_interval_secs: 30,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
        }
    }
}

impl TimingConf {
    pub fn notification_delay(&self) -> Duration {
        Duration::from_millis(self.notification_delay_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }
}

impl KernelConfig {
    pub fn plant_directory(&self) -> PlantDirectory {
        PlantDirectory::new(self.plants.clone())
    }

    pub fn parse(txt: &str) -> Result<Self, serde_yaml::Error> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(txt)
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("GASMON_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    load_config_from(Path::new(&path)).await
}

pub async fn load_config_from(path: &Path) -> KernelConfig {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "no kernel config file, using defaults");
        return KernelConfig::default();
    }
    let txt = fs::read_to_string(path).await.unwrap_or_default();
    KernelConfig::parse(&txt).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), error = %e, "invalid kernel config, using defaults");
        KernelConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = KernelConfig::parse(
            r#"
mqtt:
  host: broker.local
  port: 1884
timing:
  notification_delay_ms: 50
plants:
  - id: plant-c
    name: Plant C
    device_patterns: ["esp32_0"]
"#,
        )
        .unwrap();
        assert_eq!(cfg.mqtt.host, "broker.local");
        assert_eq!(cfg.mqtt.client_id, "gasmon-kernel");
        assert_eq!(cfg.timing.notification_delay(), Duration::from_millis(50));
        assert_eq!(cfg.timing.reconnect_max_ms, 30_000);
        assert_eq!(cfg.channels.alarms, "alarms");
        assert_eq!(cfg.plant_directory().plant_id("Plant C"), Some("plant-c"));
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let cfg = KernelConfig::parse("  \n").unwrap();
        assert_eq!(cfg.http.bind, "0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_invalid_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.yaml");
        std::fs::write(&path, "mqtt: [not, a, map]").unwrap();
        let cfg = load_config_from(&path).await;
        assert_eq!(cfg.mqtt.port, 1883);
    }
}
