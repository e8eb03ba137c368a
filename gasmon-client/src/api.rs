//! Client HTTP du kernel : chargement initial et marquage lu/non lu.

use crate::cache::{CacheRecord, FilterContext};
use crate::config::ClientConfig;
use crate::error::ClientError;
use gasmon_common::Normalizer;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base: Url,
    normalizer: Arc<Normalizer>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig, normalizer: Arc<Normalizer>) -> Result<Self, ClientError> {
        let http = Client::builder().timeout(config.request_timeout).build()?;
        let base = Url::parse(&config.base_url).map_err(|e| ClientError::InvalidUrl(format!("{}: {e}", config.base_url)))?;
        if base.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(config.base_url.clone()));
        }
        Ok(Self { http, base, normalizer })
    }

    /// Chaque segment est percent-encodé ; un id contenant `/` reste un seul segment
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// `/{collection}/device/{id}` si un device est sélectionné, sinon `?plantName=`
    fn list_request<R: CacheRecord>(&self, context: &FilterContext) -> Result<RequestBuilder, ClientError> {
        let request = match context.device.as_deref() {
            Some(device) => self.http.get(self.endpoint(&[R::COLLECTION, "device", device.trim()])?),
            None => {
                let request = self.http.get(self.endpoint(&[R::COLLECTION])?);
                match context.plant.as_deref() {
                    Some(plant) => request.query(&[("plantName", plant.trim())]),
                    None => request,
                }
            }
        };
        Ok(request)
    }

    fn mark_read_request<R: CacheRecord>(&self, id: &str) -> Result<RequestBuilder, ClientError> {
        Ok(self.http.put(self.endpoint(&[R::COLLECTION, id, "read"])?))
    }

    /// Récupère les enregistrements du contexte, re-normalisés
    pub async fn fetch<R: CacheRecord>(&self, context: &FilterContext) -> Result<Vec<R>, ClientError> {
        let response = check(self.list_request::<R>(context)?.send().await?).await?;
        let raw: Vec<Value> = serde_json::from_slice(&response.bytes().await?)?;

        let total = raw.len();
        let records: Vec<R> = raw
            .iter()
            .filter_map(|value| value.as_object().map(|obj| R::normalize(&self.normalizer, obj)))
            .collect();
        if records.len() != total {
            warn!(kind = %R::KIND, skipped = total - records.len(), "Non-object records skipped");
        }
        debug!(kind = %R::KIND, count = records.len(), "Fetched records");
        Ok(records)
    }

    pub async fn mark_read<R: CacheRecord>(&self, id: &str) -> Result<(), ClientError> {
        check(self.mark_read_request::<R>(id)?.send().await?).await?;
        Ok(())
    }

    /// Retourne le nombre de documents modifiés côté kernel
    pub async fn mark_all_read<R: CacheRecord>(&self) -> Result<u64, ClientError> {
        let url = self.endpoint(&[R::COLLECTION, "read", "all"])?;
        let response = check(self.http.put(url).send().await?).await?;
        let body: Value = response.json().await?;
        Ok(body.get("updated").and_then(Value::as_u64).unwrap_or(0))
    }
}

async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ClientError::Backend { status: status.as_u16(), message })
}
