//! Scripted transport and a pre-wired harness for unit tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::auth::{AuthGate, Credential, RefreshCoordinator, RequestSigner, StoredTokens, TokenStore};
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::gateway::{Gateway, GatewayBuilder};
use crate::http::{HttpRequest, HttpResponse, RequestPipeline, StaticCookies, Transport};
use crate::storage::MemoryStore;

type Handler = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync>;
type Hook = Box<dyn Fn(&HttpRequest) + Send + Sync>;

/// Transport that answers from a closure and records every request.
pub(crate) struct ScriptedTransport {
    handler: Handler,
    hook: Mutex<Option<Hook>>,
    delay: Mutex<Duration>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            hook: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every response is held back this long before it is returned.
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Runs after the handler on every call.
    pub(crate) fn on_call<F>(&self, hook: F)
    where
        F: Fn(&HttpRequest) + Send + Sync + 'static,
    {
        *self.hook.lock() = Some(Box::new(hook));
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.url.clone()).collect()
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// Requests whose path (query excluded) ends with `suffix`.
    pub(crate) fn calls_to(&self, suffix: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.split('?').next().unwrap_or_default().ends_with(suffix))
            .count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().push(request.clone());
        let outcome = (self.handler)(&request);
        if let Some(hook) = self.hook.lock().as_ref() {
            hook(&request);
        }
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}

/// Auth and pipeline pieces wired over one scripted transport and an
/// in-memory store, as a gateway would wire them.
pub(crate) struct Harness {
    pub(crate) config: GatewayConfig,
    pub(crate) transport: Arc<ScriptedTransport>,
    pub(crate) cookies: Arc<StaticCookies>,
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) tokens: Arc<StoredTokens>,
    signer: Arc<RequestSigner>,
    refresher: Arc<RefreshCoordinator>,
    gate: Arc<AuthGate>,
}

impl Harness {
    pub(crate) fn new<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
    {
        let config = GatewayConfig {
            base_url: "https://farm.example".to_string(),
            api_prefix: "/api".to_string(),
            ..GatewayConfig::default()
        };
        let transport = Arc::new(ScriptedTransport::new(handler));
        let cookies = Arc::new(StaticCookies::new());
        let store = Arc::new(MemoryStore::new());
        let tokens = Arc::new(StoredTokens::new(store.clone()));

        let signer = Arc::new(RequestSigner::new(&config, tokens.clone(), cookies.clone()));
        let refresher = Arc::new(RefreshCoordinator::new(
            transport.clone(),
            signer.clone(),
            "https://farm.example/api/auth/refresh".to_string(),
            config.refresh_timeout(),
        ));
        let gate = Arc::new(AuthGate::new(
            transport.clone(),
            signer.clone(),
            refresher.clone(),
            "https://farm.example/api/auth/me".to_string(),
            config.request_timeout(),
        ));

        Self {
            config,
            transport,
            cookies,
            store,
            tokens,
            signer,
            refresher,
            gate,
        }
    }

    pub(crate) fn signer(&self) -> Arc<RequestSigner> {
        self.signer.clone()
    }

    pub(crate) fn refresher(&self) -> Arc<RefreshCoordinator> {
        self.refresher.clone()
    }

    pub(crate) fn gate(&self) -> Arc<AuthGate> {
        self.gate.clone()
    }

    pub(crate) fn pipeline(&self) -> RequestPipeline {
        RequestPipeline::new(
            &self.config,
            self.transport.clone(),
            self.signer(),
            self.gate(),
            self.refresher(),
        )
    }

    /// A full gateway over the same transport, store and cookies.
    pub(crate) async fn gateway(&self) -> Gateway {
        GatewayBuilder::new(
            self.config.clone(),
            self.transport.clone(),
            self.store.clone(),
            self.cookies.clone(),
        )
        .tokens(self.tokens.clone())
        .build()
        .await
        .unwrap()
    }

    pub(crate) async fn stored_token(&self) -> Option<String> {
        self.tokens.load().await.unwrap().map(|c| c.token)
    }

    pub(crate) async fn store_token(&self, token: &str) {
        self.tokens.save(&Credential::new(token)).await.unwrap();
    }
}
