use std::time::Duration;

/// Paramètres du client : API HTTP, canal push, reconnexion
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub ws_url: String,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            ws_url: "ws://localhost:8080/ws".into(),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        let ws_url = format!("{}/ws", ws_origin(&base_url));
        Self { base_url, ws_url, ..Self::default() }
    }
}

/// Seul le schéma change ; un hôte sans schéma est supposé en clair
fn ws_origin(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base_url.starts_with("ws://") || base_url.starts_with("wss://") {
        base_url.to_string()
    } else {
        format!("ws://{base_url}")
    }
}
