//! Request pipeline: URL resolution, gating, signing, timeouts,
//! cancellation and the single refresh-and-replay on 401.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::transport::{HttpRequest, HttpResponse, Method, Transport};
use crate::auth::{AuthGate, RefreshCoordinator, RequestSigner};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};

/// A request as issued by the resource layer, before resolution.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path under the API root, or an absolute URL.
    pub path: String,
    pub params: BTreeMap<String, Value>,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
    pub skip_auth_gate: bool,
    pub cancel: Option<CancellationToken>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: BTreeMap::new(),
            body: None,
            headers: BTreeMap::new(),
            skip_auth_gate: false,
            cancel: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn with_params(mut self, params: BTreeMap<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn skip_auth_gate(mut self) -> Self {
        self.skip_auth_gate = true;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Query-string form of a parameter value; `null` means "omit".
fn param_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(param_value)
                .collect::<Vec<_>>()
                .join(","),
        ),
        other => Some(other.to_string()),
    }
}

fn is_absolute(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

pub struct RequestPipeline {
    api_root: String,
    timeout: Duration,
    transport: Arc<dyn Transport>,
    signer: Arc<RequestSigner>,
    gate: Arc<AuthGate>,
    refresher: Arc<RefreshCoordinator>,
}

impl RequestPipeline {
    pub fn new(
        config: &GatewayConfig,
        transport: Arc<dyn Transport>,
        signer: Arc<RequestSigner>,
        gate: Arc<AuthGate>,
        refresher: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            api_root: config.api_root(),
            timeout: config.request_timeout(),
            transport,
            signer,
            gate,
            refresher,
        }
    }

    /// Absolute URL for a path and its query parameters.
    pub fn resolve_url(&self, path: &str, params: &BTreeMap<String, Value>) -> Result<String> {
        let base = if is_absolute(path) {
            path.to_string()
        } else {
            format!("{}/{}", self.api_root, path.trim_start_matches('/'))
        };

        let pairs: Vec<(&String, String)> = params
            .iter()
            .filter_map(|(k, v)| param_value(v).map(|v| (k, v)))
            .collect();
        if pairs.is_empty() {
            return Ok(base);
        }

        let mut url = Url::parse(&base)
            .map_err(|e| GatewayError::InvalidRequest(format!("Invalid URL {}: {}", base, e)))?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in pairs {
                query.append_pair(key, &value);
            }
        }
        Ok(url.to_string())
    }

    pub async fn send(&self, request: &ApiRequest) -> Result<HttpResponse> {
        let url = self.resolve_url(&request.path, &request.params)?;
        self.dispatch(
            request.method,
            &url,
            request.body.as_ref(),
            &request.headers,
            request.skip_auth_gate,
            request.cancel.as_ref(),
        )
        .await
    }

    /// Replay of an already-resolved request (offline queue items).
    pub async fn execute_resolved(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        headers: &BTreeMap<String, String>,
    ) -> Result<HttpResponse> {
        self.dispatch(method, url, body, headers, false, None).await
    }

    async fn dispatch(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        headers: &BTreeMap<String, String>,
        skip_auth_gate: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<HttpResponse> {
        let policy = self.signer.policy();
        if !skip_auth_gate && policy.is_protected(method, url) {
            self.gate.ensure_ready().await;
        }

        let mut replayed = false;
        loop {
            let mut request = HttpRequest {
                method,
                url: url.to_string(),
                headers: headers.clone(),
                body: body.cloned(),
                timeout: self.timeout,
            };
            self.signer.sign(&mut request).await;

            let response = self.execute(request, cancel).await?;
            if response.status != 401 {
                return Self::check(response);
            }

            if policy.is_auth_route(url) {
                self.clear_credential().await;
                return Err(GatewayError::Authentication(GatewayError::server_message(
                    &response.body,
                )));
            }

            let error = GatewayError::from_status(response.status, &response.body);
            if replayed {
                warn!(%method, url, error = %error, "Still unauthorized after refresh");
                return Err(error);
            }

            debug!(%method, url, error = %error, "Unauthorized, refreshing credential");
            if let Err(refresh_error) = self.refresher.refresh().await {
                if refresh_error.is_connectivity() {
                    return Err(refresh_error);
                }
                self.clear_credential().await;
                return Err(GatewayError::Authentication(format!(
                    "Session refresh failed: {}",
                    refresh_error
                )));
            }
            replayed = true;
        }
    }

    async fn execute(
        &self,
        request: HttpRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<HttpResponse> {
        let timeout = request.timeout;
        let call = tokio::time::timeout(timeout, self.transport.execute(request));
        let outcome = match cancel {
            Some(token) => {
                if token.is_cancelled() {
                    return Err(GatewayError::Cancelled);
                }
                tokio::select! {
                    _ = token.cancelled() => return Err(GatewayError::Cancelled),
                    outcome = call => outcome,
                }
            }
            None => call.await,
        };
        outcome.map_err(|_| GatewayError::Timeout(timeout))?
    }

    /// 2xx and 304 pass through; everything else becomes an error.
    fn check(response: HttpResponse) -> Result<HttpResponse> {
        if response.is_success() || response.is_not_modified() {
            Ok(response)
        } else {
            Err(GatewayError::from_status(response.status, &response.body))
        }
    }

    async fn clear_credential(&self) {
        if let Err(e) = self.signer.tokens().clear().await {
            warn!(error = %e, "Failed to clear stored credential");
        }
    }
}
