/*!
# GasMon Client - Abonnements temps réel et cache de réconciliation

- `SubscriptionManager` : connexion push partagée, rooms rejouées à chaque reconnexion,
  callbacks typés avec handles de désinscription
- `ReconciliationCache` : dédup, ordre décroissant, lu/non lu, isolation de contexte
- `Feed` : cache + chargement HTTP + fusion des pushs
- `WsTransport` : transport WebSocket vers `GET /ws` du kernel
*/

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod feed;
pub mod listeners;
pub mod manager;
pub mod ws_transport;

pub use api::ApiClient;
pub use cache::{CacheRecord, FetchTicket, FilterContext, MergeOutcome, ReconciliationCache};
pub use config::ClientConfig;
pub use error::ClientError;
pub use feed::Feed;
pub use listeners::{Callback, ListenerHandle, ListenerKind};
pub use manager::{ConnectionState, SubscriptionManager};
pub use ws_transport::WsTransport;
