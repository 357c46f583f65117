//! Conditional and incremental sync on top of `ResourceClient`.
//!
//! Validators (ETag / Last-Modified) and the last sync time are kept per
//! resource under `sync:<endpoint>`. They are written only after a
//! successful network response, never optimistically.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::resource::params::{PAGE, PAGE_SIZE};
use crate::resource::{ChangeSet, ConditionalFetch, FetchSource, ResourceClient, Validators};
use crate::storage::KeyValueStore;

const SYNC_PREFIX: &str = "sync:";

/// Upper bound on pages walked by `full_sync`, against servers that
/// always report another page.
const MAX_SYNC_PAGES: u64 = 1000;

/// Page size used by `full_sync`.
const FULL_SYNC_PAGE_SIZE: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSyncState {
    pub resource_key: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
}

impl ResourceSyncState {
    fn empty(resource_key: &str) -> Self {
        Self {
            resource_key: resource_key.to_string(),
            etag: None,
            last_modified: None,
            last_sync: None,
        }
    }

    fn validators(&self) -> Validators {
        Validators {
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
        }
    }
}

/// How a screen should treat a resource's cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Reference data that rarely changes.
    CacheFirst,
    /// Account and other data that must be current.
    NetworkFirst,
    /// Day-to-day records: show the cache, refresh behind it.
    StaleWhileRevalidate,
}

const STRATEGIES: &[(&str, SyncStrategy)] = &[
    ("breeds", SyncStrategy::CacheFirst),
    ("species", SyncStrategy::CacheFirst),
    ("vaccines", SyncStrategy::CacheFirst),
    ("medications", SyncStrategy::CacheFirst),
    ("categories", SyncStrategy::CacheFirst),
    ("units", SyncStrategy::CacheFirst),
    ("users", SyncStrategy::NetworkFirst),
    ("accounts", SyncStrategy::NetworkFirst),
    ("profile", SyncStrategy::NetworkFirst),
    ("settings", SyncStrategy::NetworkFirst),
    ("subscriptions", SyncStrategy::NetworkFirst),
    ("animals", SyncStrategy::StaleWhileRevalidate),
    ("fields", SyncStrategy::StaleWhileRevalidate),
    ("treatments", SyncStrategy::StaleWhileRevalidate),
    ("vaccinations", SyncStrategy::StaleWhileRevalidate),
    ("weights", SyncStrategy::StaleWhileRevalidate),
    ("events", SyncStrategy::StaleWhileRevalidate),
    ("sales", SyncStrategy::StaleWhileRevalidate),
];

/// Strategy for a resource; unknown resources are treated as critical.
pub fn strategy_for(resource: &str) -> SyncStrategy {
    let name = resource.trim_matches('/').rsplit('/').next().unwrap_or_default();
    STRATEGIES
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(name))
        .map(|(_, strategy)| *strategy)
        .unwrap_or(SyncStrategy::NetworkFirst)
}

pub struct ConditionalSyncClient {
    resource: ResourceClient,
    store: Arc<dyn KeyValueStore>,
}

impl ConditionalSyncClient {
    pub fn new(resource: ResourceClient, store: Arc<dyn KeyValueStore>) -> Self {
        Self { resource, store }
    }

    pub fn resource(&self) -> &ResourceClient {
        &self.resource
    }

    pub fn strategy(&self) -> SyncStrategy {
        strategy_for(self.resource.endpoint())
    }

    fn state_key(&self) -> String {
        format!("{}{}", SYNC_PREFIX, self.resource.endpoint())
    }

    pub async fn state(&self) -> Result<Option<ResourceSyncState>> {
        match self.store.get(&self.state_key()).await? {
            Some(value) => match serde_json::from_value(value) {
                Ok(state) => Ok(Some(state)),
                Err(e) => {
                    warn!(resource = %self.resource.endpoint(), error = %e, "Ignoring unreadable sync state");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn save_state(&self, state: &ResourceSyncState) -> Result<()> {
        self.store
            .set(&self.state_key(), serde_json::to_value(state)?)
            .await
    }

    async fn state_or_empty(&self) -> Result<ResourceSyncState> {
        Ok(self
            .state()
            .await?
            .unwrap_or_else(|| ResourceSyncState::empty(self.resource.endpoint())))
    }

    /// Conditional GET with the stored validators; updates them when the
    /// server answered.
    pub async fn fetch(&self, params: &BTreeMap<String, Value>) -> Result<ConditionalFetch> {
        let started = Utc::now();
        let mut state = self.state_or_empty().await?;
        let fetched = self
            .resource
            .get_with_conditional_headers(params, &state.validators())
            .await?;

        if fetched.source != FetchSource::OfflineCache {
            state.etag = fetched.etag.clone();
            state.last_modified = fetched.last_modified.clone();
            state.last_sync = Some(started);
            self.save_state(&state).await?;
        }
        Ok(fetched)
    }

    /// Whether the server's validators differ from the stored ones.
    /// Without anything to compare, assume there are changes.
    pub async fn has_changes(&self) -> Result<bool> {
        let Some(state) = self.state().await? else {
            return Ok(true);
        };
        let metadata = self.resource.get_metadata().await?;

        let changed = match (&metadata.etag, &state.etag) {
            (Some(remote), Some(local)) => remote != local,
            _ => match (&metadata.last_modified, &state.last_modified) {
                (Some(remote), Some(local)) => remote != local,
                _ => true,
            },
        };
        debug!(resource = %self.resource.endpoint(), changed, "Compared validators");
        Ok(changed)
    }

    /// One page of records changed since `since`, or since the last recorded
    /// sync when `None`. The sync time is recorded after the server answers.
    pub async fn sync_since(&self, since: Option<DateTime<Utc>>) -> Result<ChangeSet> {
        let started = Utc::now();
        let mut state = self.state_or_empty().await?;
        let since = since.or(state.last_sync);

        let changes = self.resource.get_since(since, &BTreeMap::new()).await?;

        state.last_sync = Some(started);
        self.save_state(&state).await?;
        info!(
            resource = %self.resource.endpoint(),
            changed = changes.items.len(),
            has_more = changes.has_more,
            "Incremental sync"
        );
        Ok(changes)
    }

    /// Drop the cache and walk every page from the server.
    pub async fn full_sync(&self) -> Result<Vec<Value>> {
        let started = Utc::now();
        self.resource.clear_cache().await?;

        let mut items = Vec::new();
        let mut page = 1;
        loop {
            let mut params = BTreeMap::new();
            params.insert(PAGE.to_string(), Value::from(page));
            params.insert(PAGE_SIZE.to_string(), Value::from(FULL_SYNC_PAGE_SIZE));
            let result = self.resource.get_paginated(&params).await?;

            let done = result.is_empty() || !result.has_more();
            items.extend(result.items);
            if done {
                break;
            }
            if page >= MAX_SYNC_PAGES {
                warn!(resource = %self.resource.endpoint(), page, "Stopping full sync at page limit");
                break;
            }
            page += 1;
        }

        let mut state = self.state_or_empty().await?;
        state.last_sync = Some(started);
        self.save_state(&state).await?;
        info!(resource = %self.resource.endpoint(), records = items.len(), "Full sync");
        Ok(items)
    }

    /// Forget the cache and every stored validator for this resource.
    pub async fn invalidate(&self) -> Result<()> {
        self.resource.clear_cache().await?;
        self.store.remove(&self.state_key()).await
    }
}
