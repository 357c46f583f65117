//! Public/protected endpoint classification.

use url::{Origin, Url};

use crate::config::GatewayConfig;
use crate::http::Method;

/// Which anti-forgery token a request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfScope {
    Access,
    Refresh,
}

#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    /// `None` when the base URL does not parse; every absolute URL is then
    /// external.
    origin: Option<Origin>,
    /// Path component of the base URL, lowercased, without trailing slash.
    base_path: String,
    api_prefix: String,
    login: String,
    refresh: String,
    whoami: String,
    public: Vec<String>,
}

/// Lowercase, leading slash, no trailing slash (except for the root).
fn canonical(path: &str) -> String {
    let lower = path.trim().to_lowercase();
    let trimmed = lower.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn is_absolute(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

impl EndpointPolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let prefix = canonical(&config.api_prefix);
        let base = Url::parse(&config.base_url).ok();
        let base_path = base
            .as_ref()
            .map(|url| url.path().trim_end_matches('/').to_lowercase())
            .unwrap_or_default();
        Self {
            origin: base.map(|url| url.origin()),
            base_path,
            api_prefix: if prefix == "/" { String::new() } else { prefix },
            login: canonical(&config.login_path),
            refresh: canonical(&config.refresh_path),
            whoami: canonical(&config.whoami_path),
            public: config.public_paths.iter().map(|p| canonical(p)).collect(),
        }
    }

    /// Absolute URL pointing somewhere other than the configured API.
    /// Same scheme, host and port as the base URL; a shared string prefix
    /// (`farm.example.attacker.net`) is not enough.
    pub fn is_external(&self, url: &str) -> bool {
        if !is_absolute(url) {
            return false;
        }
        match (Url::parse(url), &self.origin) {
            (Ok(parsed), Some(origin)) => parsed.origin() != *origin,
            _ => true,
        }
    }

    /// Strip query, hash, origin and API prefix; lowercase.
    pub fn normalize_path(&self, url: &str) -> String {
        let path = if is_absolute(url) {
            match Url::parse(url) {
                Ok(parsed) => {
                    let path = parsed.path().to_lowercase();
                    let internal = self.origin.as_ref() == Some(&parsed.origin());
                    match path.strip_prefix(&self.base_path) {
                        Some(rest) if internal && (rest.is_empty() || rest.starts_with('/')) => {
                            rest.to_string()
                        }
                        _ => path,
                    }
                }
                Err(_) => String::new(),
            }
        } else {
            let end = url.find(['?', '#']).unwrap_or(url.len());
            url[..end].to_lowercase()
        };

        let mut path = canonical(&path);
        if !self.api_prefix.is_empty() {
            if path == self.api_prefix {
                path = "/".to_string();
            } else if let Some(rest) = path.strip_prefix(&format!("{}/", self.api_prefix)) {
                path = format!("/{}", rest);
            }
        }
        path
    }

    fn matches(path: &str, route: &str) -> bool {
        path == route || path.starts_with(&format!("{}/", route))
    }

    pub fn is_login(&self, url: &str) -> bool {
        !self.is_external(url) && self.normalize_path(url) == self.login
    }

    pub fn is_refresh(&self, url: &str) -> bool {
        !self.is_external(url) && self.normalize_path(url) == self.refresh
    }

    /// Login or refresh: never retried on 401, never carry a bearer.
    pub fn is_auth_route(&self, url: &str) -> bool {
        self.is_login(url) || self.is_refresh(url)
    }

    pub fn is_whoami(&self, url: &str) -> bool {
        !self.is_external(url) && self.normalize_path(url) == self.whoami
    }

    pub fn is_public(&self, method: Method, url: &str) -> bool {
        if matches!(method, Method::Options | Method::Head) || self.is_external(url) {
            return true;
        }
        let path = self.normalize_path(url);
        self.public.iter().any(|route| Self::matches(&path, route))
    }

    /// Protected requests wait on the auth gate.
    pub fn is_protected(&self, method: Method, url: &str) -> bool {
        !self.is_public(method, url)
    }

    pub fn csrf_scope(&self, url: &str) -> CsrfScope {
        if self.is_refresh(url) {
            CsrfScope::Refresh
        } else {
            CsrfScope::Access
        }
    }
}
