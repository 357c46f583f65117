//! Read access to non-HttpOnly cookies (anti-forgery tokens).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::cookie::{CookieStore, Jar};
use url::Url;

pub trait CookieSource: Send + Sync {
    fn cookie(&self, name: &str) -> Option<String>;
}

/// Cookies held by the reqwest jar for the API origin.
pub struct JarCookies {
    jar: Arc<Jar>,
    url: Url,
}

impl JarCookies {
    pub fn new(jar: Arc<Jar>, url: Url) -> Self {
        Self { jar, url }
    }
}

impl CookieSource for JarCookies {
    fn cookie(&self, name: &str) -> Option<String> {
        let header = self.jar.cookies(&self.url)?;
        let header = header.to_str().ok()?;
        parse_cookie_header(header, name)
    }
}

/// Cookies supplied by the host (or a test).
#[derive(Debug, Default)]
pub struct StaticCookies {
    values: Mutex<HashMap<String, String>>,
}

impl StaticCookies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, value: &str) {
        self.values.lock().insert(name.to_string(), value.to_string());
    }

    pub fn remove(&self, name: &str) {
        self.values.lock().remove(name);
    }
}

impl CookieSource for StaticCookies {
    fn cookie(&self, name: &str) -> Option<String> {
        self.values.lock().get(name).cloned()
    }
}

/// Find `name` in a `Cookie:` header value (`a=1; b=2`).
pub fn parse_cookie_header(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}
