use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::params::{QueryParams, PAGE, PAGE_SIZE, SEARCH};
use crate::cache::cache_key;
use crate::error::{GatewayError, Result};
use crate::gateway::GatewayCore;
use crate::http::{ApiRequest, HttpResponse, Method, RequestCoalescer};
use crate::normalize::{extract_entity, extract_items, extract_pagination, normalize_page, PaginatedResult};

/// Query parameter carrying the "changed since" timestamp.
const SINCE_PARAM: &str = "since";

/// Result of a write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The server accepted the write; carries its (unwrapped) response.
    Applied(Value),
    /// Offline: the write was queued and will be replayed on reconnect.
    /// `payload` is the optimistic value the caller sent.
    Queued { id: u64, payload: Option<Value> },
}

impl WriteOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, WriteOutcome::Queued { .. })
    }

    /// Server value when applied, optimistic payload when queued.
    pub fn value(&self) -> Option<&Value> {
        match self {
            WriteOutcome::Applied(value) => Some(value),
            WriteOutcome::Queued { payload, .. } => payload.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub resource: String,
    pub total_count: Option<u64>,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

/// One page of "changed since" records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// The lower bound that was requested; reuse it to fetch later pages.
    pub since: Option<DateTime<Utc>>,
    pub items: Vec<Value>,
    pub page: u64,
    pub page_size: u64,
    pub total: u64,
    pub has_more: bool,
}

/// Cache validators attached to a conditional request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    /// Fresh body from the server.
    Network,
    /// Server answered 304; data is the cached payload.
    NotModified,
    /// Server unreachable; data is a (possibly stale) cached payload.
    OfflineCache,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalFetch {
    pub data: Value,
    pub source: FetchSource,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// CRUD façade for one named resource (`animals`, `fields`, ...).
///
/// Cheap to clone; every client of a gateway shares its cache, queue,
/// coalescer and auth state.
#[derive(Clone)]
pub struct ResourceClient {
    core: Arc<GatewayCore>,
    endpoint: String,
    cancel: Option<CancellationToken>,
}

impl ResourceClient {
    pub(crate) fn new(core: Arc<GatewayCore>, endpoint: &str) -> Self {
        Self {
            core,
            endpoint: endpoint.trim_matches('/').to_string(),
            cancel: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// A copy whose requests are cancelled with `token`. Cancellable reads
    /// are never shared with other callers.
    pub fn with_cancel(&self, token: CancellationToken) -> Self {
        Self {
            cancel: Some(token),
            ..self.clone()
        }
    }

    fn item_path(&self, id: impl Display) -> String {
        format!("{}/{}", self.endpoint, id)
    }

    fn request(&self, method: Method, path: String) -> ApiRequest {
        let request = ApiRequest::new(method, path);
        match &self.cancel {
            Some(token) => request.with_cancel(token.clone()),
            None => request,
        }
    }

    fn normalize(&self, raw: &BTreeMap<String, Value>, paginated: bool) -> QueryParams {
        QueryParams::normalize(raw, paginated, self.core.config.default_page_size())
    }

    // ===== Reads =====

    /// Unpaginated list.
    pub async fn get(&self, params: &BTreeMap<String, Value>) -> Result<Vec<Value>> {
        let params = self.normalize(params, false);
        let body = self.read(&self.endpoint, params.into_map()).await?;
        Ok(extract_items(&body).items)
    }

    pub async fn get_paginated(
        &self,
        params: &BTreeMap<String, Value>,
    ) -> Result<PaginatedResult<Value>> {
        self.read_page(self.normalize(params, true)).await
    }

    async fn read_page(&self, params: QueryParams) -> Result<PaginatedResult<Value>> {
        let page = params.page();
        let page_size = params
            .page_size()
            .unwrap_or_else(|| self.core.config.default_page_size());
        let body = self.read(&self.endpoint, params.into_map()).await?;
        Ok(normalize_page(&body, page, page_size))
    }

    pub async fn get_by_id(&self, id: impl Display) -> Result<Value> {
        let body = self.read(&self.item_path(id), BTreeMap::new()).await?;
        Ok(extract_entity(&body))
    }

    pub async fn get_by_id_as<T: DeserializeOwned>(&self, id: impl Display) -> Result<T> {
        Ok(serde_json::from_value(self.get_by_id(id).await?)?)
    }

    pub async fn search(
        &self,
        query: &str,
        params: &BTreeMap<String, Value>,
    ) -> Result<PaginatedResult<Value>> {
        let mut params = self.normalize(params, true);
        params.set(SEARCH, Value::from(query.trim()));
        self.read_page(params).await
    }

    /// Cache, then network (coalesced), then stale cache if unreachable.
    async fn read(&self, path: &str, params: BTreeMap<String, Value>) -> Result<Value> {
        let key = cache_key(path, &params);
        if let Some(entry) = self.core.cache.get(&key).await {
            debug!(key = %key, "Cache hit");
            return Ok(entry.data);
        }

        if !self.core.connectivity.is_online() {
            return self
                .offline_fallback(&key, GatewayError::Connectivity("Offline".to_string()))
                .await;
        }

        // Reads that started before a write to this resource must neither be
        // joined nor cached once the write lands.
        let generation = self.core.cache.generation(&self.endpoint);
        match self.fetch(path, params, generation).await {
            Ok(body) => {
                self.core
                    .cache
                    .set_if_current(&self.endpoint, generation, &key, body.clone())
                    .await;
                Ok(body)
            }
            Err(e) if e.is_connectivity() => self.offline_fallback(&key, e).await,
            Err(e) => Err(e),
        }
    }

    async fn offline_fallback(&self, key: &str, error: GatewayError) -> Result<Value> {
        match self.core.cache.get_stale(key).await {
            Some(entry) => {
                warn!(key, error = %error, "Serving cached copy while unreachable");
                Ok(entry.data)
            }
            None => Err(error),
        }
    }

    async fn fetch(
        &self,
        path: &str,
        params: BTreeMap<String, Value>,
        generation: u64,
    ) -> Result<Value> {
        let url = self.core.pipeline.resolve_url(path, &params)?;
        let key = format!(
            "{} #{}",
            RequestCoalescer::key(Method::Get, &url, &params),
            generation
        );
        let request = self
            .request(Method::Get, path.to_string())
            .with_params(params);
        let core = Arc::clone(&self.core);

        self.core
            .coalescer
            .run(key, self.cancel.is_some(), move || {
                async move { core.pipeline.send(&request).await?.json() }.boxed()
            })
            .await
    }

    // ===== Writes =====

    pub async fn create(&self, body: Value) -> Result<WriteOutcome> {
        self.write(Method::Post, self.endpoint.clone(), Some(body)).await
    }

    pub async fn update(&self, id: impl Display, body: Value) -> Result<WriteOutcome> {
        self.write(Method::Put, self.item_path(id), Some(body)).await
    }

    pub async fn patch(&self, id: impl Display, body: Value) -> Result<WriteOutcome> {
        self.write(Method::Patch, self.item_path(id), Some(body)).await
    }

    pub async fn delete(&self, id: impl Display) -> Result<WriteOutcome> {
        self.write(Method::Delete, self.item_path(id), None).await
    }

    async fn write(&self, method: Method, path: String, body: Option<Value>) -> Result<WriteOutcome> {
        let url = self.core.pipeline.resolve_url(&path, &BTreeMap::new())?;
        if !self.core.connectivity.is_online() {
            return self.enqueue(method, url, body).await;
        }

        let mut request = self.request(method, path);
        request.body = body.clone();
        match self.core.pipeline.send(&request).await {
            Ok(response) => {
                self.invalidate().await;
                Ok(WriteOutcome::Applied(extract_entity(&response.json()?)))
            }
            // Never reached the server, so queueing cannot duplicate it.
            // A timeout might have been applied and is surfaced instead.
            Err(GatewayError::Connectivity(reason)) => {
                info!(%method, url = %url, reason = %reason, "Server unreachable, queueing write");
                self.enqueue(method, url, body).await
            }
            Err(e) => Err(e),
        }
    }

    async fn enqueue(&self, method: Method, url: String, body: Option<Value>) -> Result<WriteOutcome> {
        let item = self
            .core
            .queue
            .enqueue(method, url, body.clone(), BTreeMap::new())
            .await?;
        self.invalidate().await;
        Ok(WriteOutcome::Queued {
            id: item.id,
            payload: body,
        })
    }

    async fn invalidate(&self) {
        if let Err(e) = self.core.cache.invalidate_endpoint(&self.endpoint).await {
            warn!(endpoint = %self.endpoint, error = %e, "Failed to invalidate cache");
        }
    }

    /// Drop every cached entry for this resource.
    pub async fn clear_cache(&self) -> Result<()> {
        self.core.cache.invalidate_endpoint(&self.endpoint).await
    }

    // ===== Sync support =====

    /// Count and validators without the payload: HEAD, or a one-item GET
    /// when the server does not allow HEAD.
    pub async fn get_metadata(&self) -> Result<ResourceMetadata> {
        let fallback = self.request(Method::Head, self.endpoint.clone());
        match self.core.pipeline.send(&fallback).await {
            Ok(response) => Ok(self.metadata_from(&response, None)),
            Err(e) if matches!(e.status(), Some(405) | Some(501)) => {
                debug!(endpoint = %self.endpoint, "HEAD not allowed, falling back to a one-item GET");
                let mut params = BTreeMap::new();
                params.insert(PAGE.to_string(), Value::from(1));
                params.insert(PAGE_SIZE.to_string(), Value::from(1));
                let fallback = self
                    .request(Method::Get, self.endpoint.clone())
                    .with_params(params);
                let response = self.core.pipeline.send(&fallback).await?;
                let total = extract_pagination(&response.json()?).total;
                Ok(self.metadata_from(&response, total))
            }
            Err(e) => Err(e),
        }
    }

    fn metadata_from(&self, response: &HttpResponse, total: Option<u64>) -> ResourceMetadata {
        let header_total = response
            .header("x-total-count")
            .and_then(|v| v.trim().parse().ok());
        ResourceMetadata {
            resource: self.endpoint.clone(),
            total_count: header_total.or(total),
            last_modified: response.header("last-modified").map(str::to_string),
            etag: response.header("etag").map(str::to_string),
        }
    }

    /// One page of records changed after `since` (every record when `None`).
    /// Never served from or written to the cache.
    pub async fn get_since(
        &self,
        since: Option<DateTime<Utc>>,
        params: &BTreeMap<String, Value>,
    ) -> Result<ChangeSet> {
        let mut params = self.normalize(params, true);
        if let Some(since) = since {
            params.set(
                SINCE_PARAM,
                Value::from(since.to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        }
        let page = params.page();
        let page_size = params
            .page_size()
            .unwrap_or_else(|| self.core.config.default_page_size());

        let request = self
            .request(Method::Get, self.endpoint.clone())
            .with_params(params.into_map());
        let body = self.core.pipeline.send(&request).await?.json()?;

        let explicit_more = extract_pagination(&body).has_more;
        let result = normalize_page(&body, page, page_size);
        let has_more = explicit_more.unwrap_or_else(|| result.has_more());
        Ok(ChangeSet {
            since,
            page: result.page,
            page_size: result.page_size,
            total: result.total,
            has_more,
            items: result.items,
        })
    }

    /// GET with `If-None-Match`/`If-Modified-Since`. Validators are only
    /// sent when there is a cached payload a 304 could stand for.
    pub async fn get_with_conditional_headers(
        &self,
        params: &BTreeMap<String, Value>,
        validators: &Validators,
    ) -> Result<ConditionalFetch> {
        let params = self.normalize(params, false).into_map();
        let key = cache_key(&self.endpoint, &params);
        let cached = self.core.cache.get_any(&key).await.is_some();
        let generation = self.core.cache.generation(&self.endpoint);

        if !self.core.connectivity.is_online() {
            let data = self
                .offline_fallback(&key, GatewayError::Connectivity("Offline".to_string()))
                .await?;
            return Ok(ConditionalFetch {
                data,
                source: FetchSource::OfflineCache,
                etag: validators.etag.clone(),
                last_modified: validators.last_modified.clone(),
            });
        }

        let mut request = self
            .request(Method::Get, self.endpoint.clone())
            .with_params(params);
        if cached {
            if let Some(etag) = &validators.etag {
                request = request.with_header("If-None-Match", etag);
            }
            if let Some(modified) = &validators.last_modified {
                request = request.with_header("If-Modified-Since", modified);
            }
        }

        let response = match self.core.pipeline.send(&request).await {
            Ok(response) => response,
            Err(e) if e.is_connectivity() => {
                let data = self.offline_fallback(&key, e).await?;
                return Ok(ConditionalFetch {
                    data,
                    source: FetchSource::OfflineCache,
                    etag: validators.etag.clone(),
                    last_modified: validators.last_modified.clone(),
                });
            }
            Err(e) => return Err(e),
        };

        let etag = response.header("etag").map(str::to_string);
        let last_modified = response.header("last-modified").map(str::to_string);

        if response.is_not_modified() {
            let entry = self.core.cache.touch(&key).await.ok_or_else(|| {
                GatewayError::InvalidResponse("304 Not Modified without a cached payload".to_string())
            })?;
            debug!(endpoint = %self.endpoint, "Not modified, serving cached payload");
            return Ok(ConditionalFetch {
                data: entry.data,
                source: FetchSource::NotModified,
                etag: etag.or_else(|| validators.etag.clone()),
                last_modified: last_modified.or_else(|| validators.last_modified.clone()),
            });
        }

        let data = response.json()?;
        self.core
            .cache
            .set_if_current(&self.endpoint, generation, &key, data.clone())
            .await;
        Ok(ConditionalFetch {
            data,
            source: FetchSource::Network,
            etag,
            last_modified,
        })
    }
}
