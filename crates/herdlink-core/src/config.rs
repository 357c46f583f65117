//! Gateway configuration management.
//!
//! This module handles loading and saving the gateway configuration: the
//! API location, auth routes, anti-forgery cookie/header names, timeouts,
//! cache lifetimes and the device class used to pick default page sizes.
//!
//! Configuration is stored at `~/.config/herdlink/config.json`. Every field
//! has a default, so a partial file (or no file at all) is valid.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "herdlink";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Device class, used only to choose a default page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Mobile,
    Tablet,
    #[default]
    Desktop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Scheme and host of the API, e.g. `https://api.example.com`.
    pub base_url: String,
    /// Path prefix shared by every API route, e.g. `/api/v1`.
    pub api_prefix: String,

    pub login_path: String,
    pub refresh_path: String,
    /// "Who am I" route checked once at startup by the auth gate.
    pub whoami_path: String,
    /// Routes that never wait on the auth gate (matched after normalization).
    pub public_paths: Vec<String>,

    pub access_csrf_cookie: String,
    pub access_csrf_header: String,
    pub refresh_csrf_cookie: String,
    pub refresh_csrf_header: String,

    pub request_timeout_secs: u64,
    /// Kept shorter than `request_timeout_secs` so a hung refresh cannot
    /// hold the gate for long.
    pub refresh_timeout_secs: u64,

    pub cache_ttl_secs: u64,
    /// How far past its TTL an entry may still be served while offline.
    pub stale_grace_secs: u64,

    pub device: DeviceClass,
    pub mobile_page_size: u64,
    pub tablet_page_size: u64,
    pub desktop_page_size: u64,

    /// Durable store location; defaults to the platform cache directory.
    pub cache_dir: Option<PathBuf>,
    /// Keep the bearer credential in the OS keychain instead of the store.
    pub use_keychain: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_prefix: "/api".to_string(),
            login_path: "/auth/login".to_string(),
            refresh_path: "/auth/refresh".to_string(),
            whoami_path: "/auth/me".to_string(),
            public_paths: vec![
                "/auth/login".to_string(),
                "/auth/refresh".to_string(),
                "/auth/register".to_string(),
                "/auth/logout".to_string(),
                "/auth/forgot-password".to_string(),
                "/auth/reset-password".to_string(),
                "/health".to_string(),
                "/healthz".to_string(),
                "/status".to_string(),
            ],
            access_csrf_cookie: "csrf_access_token".to_string(),
            access_csrf_header: "X-CSRF-TOKEN".to_string(),
            refresh_csrf_cookie: "csrf_refresh_token".to_string(),
            refresh_csrf_header: "X-CSRF-TOKEN".to_string(),
            request_timeout_secs: 30,
            refresh_timeout_secs: 10,
            cache_ttl_secs: 5 * 60,
            stale_grace_secs: 24 * 60 * 60,
            device: DeviceClass::Desktop,
            mobile_page_size: 10,
            tablet_page_size: 20,
            desktop_page_size: 25,
            cache_dir: None,
            use_keychain: false,
        }
    }
}

impl GatewayConfig {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs.min(self.request_timeout_secs))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn stale_grace(&self) -> Duration {
        Duration::from_secs(self.stale_grace_secs)
    }

    pub fn default_page_size(&self) -> u64 {
        match self.device {
            DeviceClass::Mobile => self.mobile_page_size,
            DeviceClass::Tablet => self.tablet_page_size,
            DeviceClass::Desktop => self.desktop_page_size,
        }
    }

    /// `base_url` + `api_prefix`, without a trailing slash.
    pub fn api_root(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.api_prefix.trim_end_matches('/')
        )
    }
}
