//! Composition root.
//!
//! A `Gateway` owns exactly one of each coordination object (auth gate,
//! refresh coordinator, coalescer, cache, offline queue) and hands out
//! `ResourceClient`s that share them. Cloning a gateway is cheap.

use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

use crate::auth::{
    AuthGate, AuthGateState, Credential, KeychainTokens, RefreshCoordinator, RequestSigner,
    StoredTokens, TokenStore,
};
use crate::cache::CacheManager;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::http::{
    ApiRequest, CookieSource, JarCookies, Method, RequestCoalescer, RequestPipeline,
    ReqwestTransport, Transport,
};
use crate::offline::{Connectivity, OfflineQueue, OfflineQueueItem, ReplayReport};
use crate::resource::ResourceClient;
use crate::storage::{FileStore, KeyValueStore};
use crate::sync::ConditionalSyncClient;

pub(crate) struct GatewayCore {
    pub(crate) config: GatewayConfig,
    pub(crate) store: Arc<dyn KeyValueStore>,
    pub(crate) signer: Arc<RequestSigner>,
    pub(crate) gate: Arc<AuthGate>,
    pub(crate) pipeline: RequestPipeline,
    pub(crate) coalescer: RequestCoalescer,
    pub(crate) cache: CacheManager,
    pub(crate) queue: OfflineQueue,
    pub(crate) connectivity: Connectivity,
}

/// Collaborators a gateway is assembled from.
pub struct GatewayBuilder {
    config: GatewayConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn KeyValueStore>,
    cookies: Arc<dyn CookieSource>,
    tokens: Option<Arc<dyn TokenStore>>,
    online: bool,
}

impl GatewayBuilder {
    pub fn new(
        config: GatewayConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn KeyValueStore>,
        cookies: Arc<dyn CookieSource>,
    ) -> Self {
        Self {
            config,
            transport,
            store,
            cookies,
            tokens: None,
            online: true,
        }
    }

    /// Credential storage; defaults to the gateway's key-value store.
    pub fn tokens(mut self, tokens: Arc<dyn TokenStore>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Initial connectivity flag.
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    pub async fn build(self) -> Result<Gateway> {
        let config = self.config;
        let api_root = config.api_root();
        let tokens: Arc<dyn TokenStore> = match self.tokens {
            Some(tokens) => tokens,
            None => Arc::new(StoredTokens::new(Arc::clone(&self.store))),
        };

        let signer = Arc::new(RequestSigner::new(&config, tokens, self.cookies));
        let refresher = Arc::new(RefreshCoordinator::new(
            Arc::clone(&self.transport),
            Arc::clone(&signer),
            format!("{}{}", api_root, config.refresh_path),
            config.refresh_timeout(),
        ));
        let gate = Arc::new(AuthGate::new(
            Arc::clone(&self.transport),
            Arc::clone(&signer),
            Arc::clone(&refresher),
            format!("{}{}", api_root, config.whoami_path),
            config.request_timeout(),
        ));
        let pipeline = RequestPipeline::new(
            &config,
            self.transport,
            Arc::clone(&signer),
            Arc::clone(&gate),
            refresher,
        );
        let cache = CacheManager::new(
            Arc::clone(&self.store),
            config.cache_ttl(),
            config.stale_grace(),
        );
        let queue = OfflineQueue::open(Arc::clone(&self.store)).await?;

        Ok(Gateway {
            core: Arc::new(GatewayCore {
                config,
                store: self.store,
                signer,
                gate,
                pipeline,
                coalescer: RequestCoalescer::new(),
                cache,
                queue,
                connectivity: Connectivity::new(self.online),
            }),
        })
    }
}

#[derive(Clone)]
pub struct Gateway {
    core: Arc<GatewayCore>,
}

impl Gateway {
    pub fn builder(
        config: GatewayConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn KeyValueStore>,
        cookies: Arc<dyn CookieSource>,
    ) -> GatewayBuilder {
        GatewayBuilder::new(config, transport, store, cookies)
    }

    /// Production wiring: reqwest with a cookie jar, the file store under the
    /// cache directory, and the keychain when configured.
    pub async fn from_config(config: GatewayConfig) -> Result<Self> {
        let transport = ReqwestTransport::new()?;
        let origin = Url::parse(&config.base_url)
            .map_err(|e| GatewayError::InvalidRequest(format!("Invalid base URL: {}", e)))?;
        let cookies = Arc::new(JarCookies::new(transport.cookie_jar(), origin));

        let dir = config
            .cache_dir()
            .map_err(|e| GatewayError::Storage(e.to_string()))?;
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(dir).await?);

        let mut builder = GatewayBuilder::new(config.clone(), Arc::new(transport), store, cookies);
        if config.use_keychain {
            builder = builder.tokens(Arc::new(KeychainTokens::new(config.base_url.clone())));
        }
        builder.build().await
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.core.config
    }

    pub fn resource(&self, name: &str) -> ResourceClient {
        ResourceClient::new(Arc::clone(&self.core), name)
    }

    pub fn sync_client(&self, name: &str) -> ConditionalSyncClient {
        ConditionalSyncClient::new(self.resource(name), Arc::clone(&self.core.store))
    }

    // ===== Auth =====

    pub fn auth_state(&self) -> AuthGateState {
        self.core.gate.state()
    }

    pub async fn ensure_ready(&self) {
        self.core.gate.ensure_ready().await
    }

    /// POST credentials to the login route, keep any returned token, and
    /// open the gate.
    pub async fn login(&self, credentials: Value) -> Result<Value> {
        let request =
            ApiRequest::new(Method::Post, self.core.config.login_path.clone()).with_body(credentials);
        let body = self.core.pipeline.send(&request).await?.json()?;
        if let Some(credential) = Credential::from_response(&body) {
            self.core.signer.tokens().save(&credential).await?;
        }
        self.core.gate.mark_authenticated();
        info!("Logged in");
        Ok(body)
    }

    /// Forget the credential and every cached response; the next protected
    /// request checks the session again.
    pub async fn logout(&self) -> Result<()> {
        self.core.signer.tokens().clear().await?;
        self.core.cache.clear().await?;
        self.core.gate.reset();
        info!("Logged out");
        Ok(())
    }

    // ===== Cache =====

    pub async fn clear_cache(&self) -> Result<()> {
        self.core.cache.clear().await
    }

    // ===== Offline =====

    pub fn is_online(&self) -> bool {
        self.core.connectivity.is_online()
    }

    /// Returns true when this call brought the gateway back online.
    pub fn set_online(&self, online: bool) -> bool {
        self.core.connectivity.set_online(online)
    }

    pub async fn queued_writes(&self) -> Result<Vec<OfflineQueueItem>> {
        self.core.queue.items().await
    }

    pub async fn discard_queued(&self, id: u64) -> Result<bool> {
        self.core.queue.discard(id).await
    }

    /// Replay queued writes in order, halting on the first failure. Any
    /// applied write clears the cache, since the server state moved.
    pub async fn replay_offline_queue(&self) -> Result<ReplayReport> {
        replay(&self.core).await
    }

    /// Replay the queue on every offline -> online transition. The task ends
    /// when the gateway is dropped.
    ///
    /// Transitions are tracked by the reconnect counter, so a flip that
    /// happens before the task gets to run is still replayed.
    pub fn spawn_reconnect_replay(&self) -> JoinHandle<()> {
        let core: Weak<GatewayCore> = Arc::downgrade(&self.core);
        let mut state = self.core.connectivity.subscribe();
        let mut seen = state.borrow_and_update().reconnects;

        tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let now = *state.borrow_and_update();
                if now.reconnects == seen {
                    continue;
                }
                seen = now.reconnects;
                if !now.online {
                    // Offline again already; the next reconnect bumps the counter.
                    continue;
                }
                let Some(core) = core.upgrade() else {
                    break;
                };
                match replay(&core).await {
                    Ok(report) if report.halted.is_some() => {
                        warn!(remaining = report.remaining, "Reconnect replay left writes queued");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Reconnect replay failed"),
                }
            }
        })
    }
}

async fn replay(core: &GatewayCore) -> Result<ReplayReport> {
    let report = core
        .queue
        .replay(|item| async move {
            core.pipeline
                .execute_resolved(item.method, &item.url, item.payload.as_ref(), &item.headers)
                .await
                .map(|_| ())
        })
        .await?;
    if report.replayed > 0 {
        if let Err(e) = core.cache.clear().await {
            warn!(error = %e, replayed = report.replayed, "Failed to clear cache after replay");
        }
    }
    Ok(report)
}
