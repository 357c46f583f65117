use std::sync::Arc;

use tracing::warn;

use super::credentials::TokenStore;
use super::endpoints::{CsrfScope, EndpointPolicy};
use crate::config::GatewayConfig;
use crate::http::{CookieSource, HttpRequest};

/// Attaches content negotiation, bearer and anti-forgery headers.
///
/// Shared by the pipeline, the auth gate session check and the refresh call, so
/// every path that talks to the API signs requests the same way.
pub struct RequestSigner {
    policy: EndpointPolicy,
    tokens: Arc<dyn TokenStore>,
    cookies: Arc<dyn CookieSource>,
    access_csrf: (String, String),
    refresh_csrf: (String, String),
}

impl RequestSigner {
    pub fn new(
        config: &GatewayConfig,
        tokens: Arc<dyn TokenStore>,
        cookies: Arc<dyn CookieSource>,
    ) -> Self {
        Self {
            policy: EndpointPolicy::from_config(config),
            tokens,
            cookies,
            access_csrf: (
                config.access_csrf_cookie.clone(),
                config.access_csrf_header.clone(),
            ),
            refresh_csrf: (
                config.refresh_csrf_cookie.clone(),
                config.refresh_csrf_header.clone(),
            ),
        }
    }

    pub fn policy(&self) -> &EndpointPolicy {
        &self.policy
    }

    pub fn tokens(&self) -> &Arc<dyn TokenStore> {
        &self.tokens
    }

    /// Current anti-forgery token for a scope, read fresh from the cookie.
    pub fn csrf_token(&self, scope: CsrfScope) -> Option<String> {
        let (cookie, _) = match scope {
            CsrfScope::Access => &self.access_csrf,
            CsrfScope::Refresh => &self.refresh_csrf,
        };
        self.cookies.cookie(cookie)
    }

    pub async fn sign(&self, request: &mut HttpRequest) {
        request
            .headers
            .entry("Accept".to_string())
            .or_insert_with(|| "application/json".to_string());
        if request.body.is_some() {
            request
                .headers
                .entry("Content-Type".to_string())
                .or_insert_with(|| "application/json".to_string());
        }

        // Credentials never leave for other origins.
        if self.policy.is_external(&request.url) {
            return;
        }

        if !self.policy.is_auth_route(&request.url) {
            match self.tokens.load().await {
                Ok(Some(credential)) => {
                    request.headers.insert(
                        "Authorization".to_string(),
                        format!("Bearer {}", credential.token),
                    );
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to load stored credential"),
            }
        }

        let scope = self.policy.csrf_scope(&request.url);
        let (_, header) = match scope {
            CsrfScope::Access => &self.access_csrf,
            CsrfScope::Refresh => &self.refresh_csrf,
        };
        if let Some(token) = self.csrf_token(scope) {
            request.headers.insert(header.clone(), token);
        }
    }
}
