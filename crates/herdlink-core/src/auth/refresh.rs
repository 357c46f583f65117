//! Single-flight credential refresh.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::session::Credential;
use super::signer::RequestSigner;
use crate::error::{GatewayError, Result};
use crate::http::{HttpRequest, Method, Transport};

/// One initial attempt plus one retry after re-reading the CSRF cookie.
const MAX_REFRESH_ATTEMPTS: usize = 2;

type SharedRefresh = Shared<BoxFuture<'static, Result<()>>>;

struct RefreshWorker {
    transport: Arc<dyn Transport>,
    signer: Arc<RequestSigner>,
    url: String,
    timeout: Duration,
}

impl RefreshWorker {
    async fn run(&self) -> Result<()> {
        for attempt in 1..=MAX_REFRESH_ATTEMPTS {
            let mut request = HttpRequest {
                method: Method::Post,
                url: self.url.clone(),
                headers: BTreeMap::new(),
                body: None,
                timeout: self.timeout,
            };
            // Signing re-reads the refresh CSRF cookie on every attempt.
            self.signer.sign(&mut request).await;

            let response = self.transport.execute(request).await?;
            if response.is_success() {
                let body = response.json().unwrap_or(Value::Null);
                if let Some(credential) = Credential::from_response(&body) {
                    self.signer.tokens().save(&credential).await?;
                }
                info!("Credential refreshed");
                return Ok(());
            }

            let error = GatewayError::from_status(response.status, &response.body);
            if error == GatewayError::AntiForgery && attempt < MAX_REFRESH_ATTEMPTS {
                warn!("Refresh rejected anti-forgery token, re-reading cookie");
                continue;
            }
            return Err(error);
        }
        Err(GatewayError::AntiForgery)
    }
}

/// Serializes refresh: however many callers hit a 401 at once, one refresh
/// request goes out and every caller sees its outcome.
///
/// Performs only the network call and the credential write; surfacing a
/// failure (logging out, redirecting to login) is the caller's job.
pub struct RefreshCoordinator {
    worker: Arc<RefreshWorker>,
    inflight: Arc<Mutex<Option<SharedRefresh>>>,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        signer: Arc<RequestSigner>,
        url: String,
        timeout: Duration,
    ) -> Self {
        Self {
            worker: Arc::new(RefreshWorker {
                transport,
                signer,
                url,
                timeout,
            }),
            inflight: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn refresh(&self) -> Result<()> {
        let pending = {
            let mut slot = self.inflight.lock();
            match slot.as_ref() {
                Some(existing) => {
                    debug!("Joining in-flight refresh");
                    existing.clone()
                }
                None => {
                    let worker = Arc::clone(&self.worker);
                    let release = Arc::clone(&self.inflight);
                    let shared = async move {
                        let outcome = worker.run().await;
                        *release.lock() = None;
                        outcome
                    }
                    .boxed()
                    .shared();
                    *slot = Some(shared.clone());
                    shared
                }
            }
        };
        pending.await
    }

    pub fn is_refreshing(&self) -> bool {
        self.inflight.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use crate::http::HttpResponse;

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_call() {
        let harness = Harness::new(|req| {
            if req.url.ends_with("/auth/refresh") {
                Ok(HttpResponse::new(200, r#"{"access_token":"fresh"}"#))
            } else {
                Ok(HttpResponse::new(404, ""))
            }
        });
        harness.transport.set_delay(Duration::from_millis(20));
        let refresher = harness.refresher();

        let results =
            futures::future::join_all((0..4).map(|_| refresher.refresh())).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(harness.transport.calls_to("/auth/refresh"), 1);
        assert_eq!(harness.stored_token().await.as_deref(), Some("fresh"));
        assert!(!refresher.is_refreshing());
    }

    #[tokio::test]
    async fn test_csrf_mismatch_rereads_cookie_and_retries_once() {
        let harness = Harness::new(|req| {
            if req.header("x-csrf-token") == Some("new-csrf") {
                Ok(HttpResponse::new(200, "{}"))
            } else {
                Ok(HttpResponse::new(401, r#"{"msg":"CSRF token missing"}"#))
            }
        });
        harness.cookies.set("csrf_refresh_token", "old-csrf");
        let cookies = harness.cookies.clone();
        harness.transport.on_call(move |_| cookies.set("csrf_refresh_token", "new-csrf"));

        harness.refresher().refresh().await.unwrap();
        assert_eq!(harness.transport.calls_to("/auth/refresh"), 2);
    }

    #[tokio::test]
    async fn test_second_csrf_mismatch_fails() {
        let harness = Harness::new(|_| Ok(HttpResponse::new(401, r#"{"msg":"CSRF failed"}"#)));

        let err = harness.refresher().refresh().await.unwrap_err();
        assert_eq!(err, GatewayError::AntiForgery);
        assert_eq!(harness.transport.calls_to("/auth/refresh"), 2);
    }

    #[tokio::test]
    async fn test_other_failures_propagate_without_retry() {
        let harness = Harness::new(|_| Ok(HttpResponse::new(401, r#"{"msg":"Token revoked"}"#)));

        let err = harness.refresher().refresh().await.unwrap_err();
        assert!(matches!(err, GatewayError::Authentication(_)));
        assert_eq!(harness.transport.calls_to("/auth/refresh"), 1);
        assert!(harness.stored_token().await.is_none());
    }
}
