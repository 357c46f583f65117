//! Startup auth gate.
//!
//! Protected requests issued before the session state is known wait here
//! while one check against the "who am I" route settles it. The check talks
//! to the transport directly, so it never waits on the gate itself.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::refresh::RefreshCoordinator;
use super::signer::RequestSigner;
use crate::error::Result;
use crate::http::{HttpRequest, HttpResponse, Method, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthGateState {
    Unknown,
    Checking,
    Ready,
    Unauthenticated,
}

type SharedCheck = Shared<BoxFuture<'static, AuthGateState>>;

enum Slot {
    Settled(AuthGateState),
    Checking(SharedCheck),
}

struct GateInner {
    slot: Slot,
    /// Bumped by every explicit transition so a check that settles after a
    /// `reset`/`mark_*` does not overwrite the newer state.
    generation: u64,
}

struct SessionChecker {
    transport: Arc<dyn Transport>,
    signer: Arc<RequestSigner>,
    refresher: Arc<RefreshCoordinator>,
    url: String,
    timeout: Duration,
}

impl SessionChecker {
    async fn whoami_once(&self) -> Result<HttpResponse> {
        let mut request = HttpRequest {
            method: Method::Get,
            url: self.url.clone(),
            headers: BTreeMap::new(),
            body: None,
            timeout: self.timeout,
        };
        self.signer.sign(&mut request).await;
        self.transport.execute(request).await
    }

    /// Never fails: ambiguous outcomes (network errors, 429, 5xx) open the
    /// gate rather than blocking the UI.
    async fn run(&self) -> AuthGateState {
        match self.whoami_once().await {
            Ok(response) if response.is_success() => AuthGateState::Ready,
            Ok(response) if response.status == 401 => self.refresh_and_retry().await,
            Ok(response) => {
                warn!(status = response.status, "Session check inconclusive, opening gate");
                AuthGateState::Ready
            }
            Err(e) => {
                warn!(error = %e, "Session check failed, opening gate");
                AuthGateState::Ready
            }
        }
    }

    async fn refresh_and_retry(&self) -> AuthGateState {
        if let Err(e) = self.refresher.refresh().await {
            if e.is_connectivity() {
                warn!(error = %e, "Refresh unreachable during session check, opening gate");
                return AuthGateState::Ready;
            }
            info!(error = %e, "Session refresh failed, not authenticated");
            return AuthGateState::Unauthenticated;
        }
        match self.whoami_once().await {
            Ok(response) if response.status == 401 => AuthGateState::Unauthenticated,
            Ok(response) if !response.is_success() => {
                warn!(status = response.status, "Session re-check inconclusive, opening gate");
                AuthGateState::Ready
            }
            Ok(_) => AuthGateState::Ready,
            Err(e) => {
                warn!(error = %e, "Session re-check failed, opening gate");
                AuthGateState::Ready
            }
        }
    }
}

pub struct AuthGate {
    inner: Arc<Mutex<GateInner>>,
    checker: Arc<SessionChecker>,
}

impl AuthGate {
    pub fn new(
        transport: Arc<dyn Transport>,
        signer: Arc<RequestSigner>,
        refresher: Arc<RefreshCoordinator>,
        whoami_url: String,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GateInner {
                slot: Slot::Settled(AuthGateState::Unknown),
                generation: 0,
            })),
            checker: Arc::new(SessionChecker {
                transport,
                signer,
                refresher,
                url: whoami_url,
                timeout,
            }),
        }
    }

    pub fn state(&self) -> AuthGateState {
        match self.inner.lock().slot {
            Slot::Settled(state) => state,
            Slot::Checking(_) => AuthGateState::Checking,
        }
    }

    /// Wait until the session state is known. Returns immediately once
    /// settled; concurrent callers share the one in-flight check.
    pub async fn ensure_ready(&self) {
        let pending = {
            let mut inner = self.inner.lock();
            match &inner.slot {
                Slot::Settled(AuthGateState::Ready | AuthGateState::Unauthenticated) => return,
                Slot::Checking(check) => check.clone(),
                Slot::Settled(_) => {
                    debug!("Probing session state");
                    let check = self.start_check(inner.generation);
                    inner.slot = Slot::Checking(check.clone());
                    check
                }
            }
        };
        pending.await;
    }

    fn start_check(&self, generation: u64) -> SharedCheck {
        let checker = Arc::clone(&self.checker);
        let inner = Arc::clone(&self.inner);
        async move {
            let state = checker.run().await;
            let mut inner = inner.lock();
            if inner.generation == generation {
                inner.slot = Slot::Settled(state);
            }
            debug!(?state, "Session check settled");
            state
        }
        .boxed()
        .shared()
    }

    fn transition(&self, state: AuthGateState) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.slot = Slot::Settled(state);
    }

    /// After an explicit login.
    pub fn mark_authenticated(&self) {
        self.transition(AuthGateState::Ready);
    }

    pub fn mark_unauthenticated(&self) {
        self.transition(AuthGateState::Unauthenticated);
    }

    /// Back to `Unknown` (after logout): the next protected request checks again.
    pub fn reset(&self) {
        self.transition(AuthGateState::Unknown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::test_support::Harness;

    fn build_gate(harness: &Harness) -> AuthGate {
        AuthGate::new(
            harness.transport.clone(),
            harness.signer(),
            harness.refresher(),
            "https://farm.example/api/auth/me".to_string(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_concurrent_waiters_share_one_check() {
        let harness = Harness::new(|_| Ok(HttpResponse::new(200, r#"{"id":1}"#)));
        harness.transport.set_delay(Duration::from_millis(20));
        let gate = build_gate(&harness);

        futures::future::join_all((0..8).map(|_| gate.ensure_ready())).await;

        assert_eq!(harness.transport.calls_to("/auth/me"), 1);
        assert_eq!(gate.state(), AuthGateState::Ready);

        gate.ensure_ready().await;
        assert_eq!(harness.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_401_refreshes_then_rechecks() {
        let harness = Harness::new(|req| {
            if req.url.ends_with("/auth/refresh") {
                return Ok(HttpResponse::new(200, r#"{"access_token":"renewed"}"#));
            }
            if req.header("authorization") == Some("Bearer renewed") {
                Ok(HttpResponse::new(200, "{}"))
            } else {
                Ok(HttpResponse::new(401, r#"{"msg":"Token has expired"}"#))
            }
        });
        let gate = build_gate(&harness);

        gate.ensure_ready().await;
        assert_eq!(gate.state(), AuthGateState::Ready);
        assert_eq!(harness.transport.calls_to("/auth/me"), 2);
        assert_eq!(harness.transport.calls_to("/auth/refresh"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_wait_through_refresh_cycle() {
        let harness = Harness::new(|req| {
            if req.url.ends_with("/auth/refresh") {
                return Ok(HttpResponse::new(200, r#"{"access_token":"renewed"}"#));
            }
            if req.header("authorization") == Some("Bearer renewed") {
                Ok(HttpResponse::new(200, "{}"))
            } else {
                Ok(HttpResponse::new(401, r#"{"msg":"Token has expired"}"#))
            }
        });
        harness.transport.set_delay(Duration::from_millis(20));
        harness.store_token("stale").await;
        let gate = build_gate(&harness);

        let seen = futures::future::join_all((0..8).map(|_| async {
            gate.ensure_ready().await;
            gate.state()
        }))
        .await;

        assert!(seen.iter().all(|state| *state == AuthGateState::Ready));
        assert_eq!(harness.transport.calls_to("/auth/me"), 2);
        assert_eq!(harness.transport.calls_to("/auth/refresh"), 1);
        assert_eq!(harness.stored_token().await.as_deref(), Some("renewed"));
    }

    #[tokio::test]
    async fn test_failed_refresh_settles_unauthenticated() {
        let harness = Harness::new(|_| Ok(HttpResponse::new(401, r#"{"msg":"no session"}"#)));
        let gate = build_gate(&harness);

        gate.ensure_ready().await;
        assert_eq!(gate.state(), AuthGateState::Unauthenticated);
        assert_eq!(harness.transport.calls_to("/auth/me"), 1);
    }

    #[tokio::test]
    async fn test_ambiguous_failures_fail_open() {
        let harness = Harness::new(|_| Ok(HttpResponse::new(429, "")));
        let gate = build_gate(&harness);
        gate.ensure_ready().await;
        assert_eq!(gate.state(), AuthGateState::Ready);

        let offline = Harness::new(|_| Err(GatewayError::Connectivity("refused".to_string())));
        let gate = build_gate(&offline);
        gate.ensure_ready().await;
        assert_eq!(gate.state(), AuthGateState::Ready);
    }

    #[tokio::test]
    async fn test_reset_forces_a_new_check() {
        let harness = Harness::new(|_| Ok(HttpResponse::new(200, "{}")));
        let gate = build_gate(&harness);

        gate.ensure_ready().await;
        gate.reset();
        assert_eq!(gate.state(), AuthGateState::Unknown);
        gate.ensure_ready().await;
        assert_eq!(harness.transport.calls_to("/auth/me"), 2);
    }
}
