//! Query parameter normalization.
//!
//! Callers pass whatever naming their screen grew up with (`perPage`,
//! `itemsPerPage`, `q`, ...). Everything is folded onto three canonical
//! keys before the cache key or the URL is built, so equivalent queries
//! share cache entries and in-flight reads.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{GatewayError, Result};

pub const PAGE: &str = "page";
pub const PAGE_SIZE: &str = "page_size";
pub const SEARCH: &str = "search";

/// Canonical key first, then aliases in preference order.
const ALIASES: &[(&str, &[&str])] = &[
    (
        PAGE_SIZE,
        &["page_size", "pageSize", "itemsPerPage", "items_per_page", "perPage", "per_page", "limit"],
    ),
    (SEARCH, &["search", "query", "q", "searchTerm"]),
    (PAGE, &["page", "currentPage", "pageNumber"]),
];

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn as_positive(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|n| *n > 0)
}

/// Normalized parameters for one read.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParams {
    params: BTreeMap<String, Value>,
}

impl QueryParams {
    /// Fold aliases and drop nulls. A paginated read gets `default_page_size`
    /// when the caller gave none; an unpaginated read carries pagination
    /// keys only if the caller asked for them.
    pub fn normalize(raw: &BTreeMap<String, Value>, paginated: bool, default_page_size: u64) -> Self {
        let mut params: BTreeMap<String, Value> = raw
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (canonical, names) in ALIASES {
            let chosen = names
                .iter()
                .find_map(|name| params.get(*name).filter(|v| !is_blank(v)).cloned());
            for name in names.iter() {
                params.remove(*name);
            }
            if let Some(value) = chosen {
                params.insert(canonical.to_string(), value);
            }
        }

        if paginated && !params.contains_key(PAGE_SIZE) && default_page_size > 0 {
            params.insert(PAGE_SIZE.to_string(), Value::from(default_page_size));
        }

        Self { params }
    }

    pub fn page(&self) -> u64 {
        self.params.get(PAGE).and_then(as_positive).unwrap_or(1)
    }

    pub fn page_size(&self) -> Option<u64> {
        self.params.get(PAGE_SIZE).and_then(as_positive)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        if value.is_null() {
            self.params.remove(key);
        } else {
            self.params.insert(key.to_string(), value);
        }
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.params
    }
}

/// Parse `key=value` pairs into raw parameters. Values that read as JSON
/// (numbers, booleans) keep that type; anything else is a string.
pub fn parse_pairs<'a>(
    pairs: impl IntoIterator<Item = &'a str>,
) -> Result<BTreeMap<String, Value>> {
    let mut params = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            GatewayError::InvalidRequest(format!("Expected key=value, got '{}'", pair))
        })?;
        let value: Value = serde_json::from_str(value).unwrap_or_else(|_| Value::from(value));
        params.insert(key.trim().to_string(), value);
    }
    Ok(params)
}
