//! Coutures (seams) entre le cœur et les transports du canal push.
//!
//! Côté serveur, le router n'émet qu'à travers [`PushSink`].
//! Côté client, le gestionnaire d'abonnements n'ouvre de connexion qu'à travers
//! [`PushTransport`]. Les implémentations réelles (WebSocket) et les mocks de
//! tests vivent dans leurs crates respectifs.

use crate::rooms::Target;
use crate::wire::{ClientCommand, ServerFrame};
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push channel unavailable: {0}")]
    Unavailable(String),
    #[error("push connection failed: {0}")]
    Connect(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("bus rejected publish: {0}")]
    Rejected(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Émission côté serveur vers une cible (global ou room).
/// Retourne le nombre de clients atteints.
pub trait PushSink: Send + Sync {
    fn emit(&self, target: &Target, frame: &ServerFrame) -> Result<usize, PushError>;
}

/// Connexion client ouverte : deux canaux, un par sens.
/// La fermeture de `inbound` signale la perte de connexion.
pub struct PushConnection {
    pub outbound: mpsc::UnboundedSender<ClientCommand>,
    pub inbound: mpsc::UnboundedReceiver<ServerFrame>,
}

/// Ouverture d'une connexion push côté client
pub trait PushTransport: Send + Sync {
    fn open(&self) -> BoxFuture<'_, Result<PushConnection, PushError>>;
}

/// Publication sur le bus : `publish(channel, message)`.
/// Le bus MQTT ne connaît pas ses abonnés : `Ok(())` signifie "accepté par le broker".
pub trait BusPublish: Send + Sync {
    fn publish<'a>(&'a self, channel: &'a str, message: Value) -> BoxFuture<'a, Result<(), PublishError>>;
}
