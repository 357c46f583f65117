//! Canonical list/pagination shape from heterogeneous response envelopes.
//!
//! Servers wrap collections in many ways: a bare array, `{data: [...]}`,
//! `{data: {items: [...]}}`, `{results: [...], meta: {pagination: {...}}}`
//! and so on. Extraction tries an ordered list of strategies and reports
//! which one matched as an `EnvelopeShape`.

use std::collections::VecDeque;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys that usually hold the collection, in preference order.
const CANDIDATE_KEYS: &[&str] = &[
    "data", "items", "results", "records", "rows", "list", "content", "docs", "entries",
];

/// Keys that usually wrap a nested envelope.
const WRAPPER_KEYS: &[&str] = &["data", "result", "payload", "response", "body"];

/// Depth limit for the fallback breadth-first search.
const MAX_SEARCH_DEPTH: usize = 2;

const TOTAL_FIELDS: &[&str] = &[
    "total", "totalCount", "total_count", "totalItems", "total_items", "totalRecords",
    "total_records", "count",
];
const PAGE_FIELDS: &[&str] = &["page", "currentPage", "current_page", "pageNumber", "page_number"];
const PAGE_SIZE_FIELDS: &[&str] = &[
    "pageSize", "page_size", "perPage", "per_page", "limit", "itemsPerPage", "items_per_page",
];
const PAGE_COUNT_FIELDS: &[&str] = &[
    "pageCount", "page_count", "totalPages", "total_pages", "pages", "lastPage", "last_page",
];

/// How the collection was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeShape {
    /// The body itself is an array.
    Array,
    /// Found under a preferred key; the path is dotted (`data.items`).
    Keyed(String),
    /// Found by the bounded search; the path is dotted.
    Discovered(String),
    /// No array anywhere within reach.
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub items: Vec<Value>,
    pub shape: EnvelopeShape,
}

type Strategy = fn(&Value) -> Option<Extracted>;

/// Tried in order; the first hit wins.
const STRATEGIES: &[Strategy] = &[direct_array, candidate_keys, bounded_search];

fn direct_array(body: &Value) -> Option<Extracted> {
    body.as_array().map(|items| Extracted {
        items: items.clone(),
        shape: EnvelopeShape::Array,
    })
}

fn candidate_keys(body: &Value) -> Option<Extracted> {
    let object = body.as_object()?;

    for key in CANDIDATE_KEYS {
        if let Some(Value::Array(items)) = object.get(*key) {
            return Some(Extracted {
                items: items.clone(),
                shape: EnvelopeShape::Keyed(key.to_string()),
            });
        }
    }

    for wrapper in WRAPPER_KEYS.iter().chain(CANDIDATE_KEYS) {
        let Some(Value::Object(inner)) = object.get(*wrapper) else {
            continue;
        };
        for key in CANDIDATE_KEYS {
            if let Some(Value::Array(items)) = inner.get(*key) {
                return Some(Extracted {
                    items: items.clone(),
                    shape: EnvelopeShape::Keyed(format!("{}.{}", wrapper, key)),
                });
            }
        }
    }
    None
}

fn bounded_search(body: &Value) -> Option<Extracted> {
    let mut queue: VecDeque<(&Map<String, Value>, String, usize)> = VecDeque::new();
    queue.push_back((body.as_object()?, String::new(), 0));

    while let Some((object, path, depth)) = queue.pop_front() {
        for (key, value) in object {
            let child_path = if path.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", path, key)
            };
            match value {
                Value::Array(items) => {
                    return Some(Extracted {
                        items: items.clone(),
                        shape: EnvelopeShape::Discovered(child_path),
                    });
                }
                Value::Object(inner) if depth + 1 < MAX_SEARCH_DEPTH => {
                    queue.push_back((inner, child_path, depth + 1));
                }
                _ => {}
            }
        }
    }
    None
}

/// Pull the collection out of an envelope.
pub fn extract_items(body: &Value) -> Extracted {
    STRATEGIES
        .iter()
        .find_map(|strategy| strategy(body))
        .unwrap_or(Extracted {
            items: Vec::new(),
            shape: EnvelopeShape::Empty,
        })
}

/// Unwrap `{data: {...}}` around a single record.
pub fn extract_entity(body: &Value) -> Value {
    match body.get("data") {
        Some(inner @ Value::Object(_)) => inner.clone(),
        _ => body.clone(),
    }
}

/// Pagination fields as found, before defaults are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageMeta {
    pub total: Option<u64>,
    pub page: Option<u64>,
    pub page_size: Option<u64>,
    pub page_count: Option<u64>,
    pub has_more: Option<bool>,
}

fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn first_count(object: &Map<String, Value>, fields: &[&str]) -> Option<u64> {
    fields.iter().find_map(|f| object.get(*f).and_then(as_count))
}

impl PageMeta {
    fn from_object(object: &Map<String, Value>) -> Self {
        let has_more = ["hasMore", "has_more", "hasNextPage", "has_next"]
            .iter()
            .find_map(|f| object.get(*f).and_then(Value::as_bool));
        Self {
            total: first_count(object, TOTAL_FIELDS),
            page: first_count(object, PAGE_FIELDS),
            page_size: first_count(object, PAGE_SIZE_FIELDS),
            page_count: first_count(object, PAGE_COUNT_FIELDS),
            has_more,
        }
    }

    /// Fields present in `other` win.
    fn overlay(self, other: PageMeta) -> Self {
        Self {
            total: other.total.or(self.total),
            page: other.page.or(self.page),
            page_size: other.page_size.or(self.page_size),
            page_count: other.page_count.or(self.page_count),
            has_more: other.has_more.or(self.has_more),
        }
    }
}

/// Merge pagination from the top level, `meta`, `pagination` and
/// `meta.pagination` (most specific wins).
pub fn extract_pagination(body: &Value) -> PageMeta {
    let Some(object) = body.as_object() else {
        return PageMeta::default();
    };
    let nested = |v: Option<&Value>| {
        v.and_then(Value::as_object)
            .map(PageMeta::from_object)
            .unwrap_or_default()
    };
    let meta = object.get("meta");

    PageMeta::from_object(object)
        .overlay(nested(meta))
        .overlay(nested(object.get("pagination")))
        .overlay(nested(meta.and_then(|m| m.get("pagination"))))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
    pub page_count: u64,
}

impl<T> PaginatedResult<T> {
    pub fn has_more(&self) -> bool {
        self.page < self.page_count
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl PaginatedResult<Value> {
    /// Deserialize the items into a caller type.
    pub fn decode<T: DeserializeOwned>(self) -> serde_json::Result<PaginatedResult<T>> {
        let items = self
            .items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<serde_json::Result<Vec<T>>>()?;
        Ok(PaginatedResult {
            items,
            total: self.total,
            page: self.page,
            page_size: self.page_size,
            page_count: self.page_count,
        })
    }
}

/// Canonical page from an envelope. `requested_page`/`requested_size` fill
/// whatever the server left out.
pub fn normalize_page(
    body: &Value,
    requested_page: u64,
    requested_size: u64,
) -> PaginatedResult<Value> {
    let items = extract_items(body).items;
    let meta = extract_pagination(body);

    let page = meta.page.unwrap_or(requested_page).max(1);
    let page_size = meta
        .page_size
        .or((requested_size > 0).then_some(requested_size))
        .unwrap_or(items.len() as u64);
    let offset = (page - 1).saturating_mul(page_size);
    let seen = offset.saturating_add(items.len() as u64);

    // Never report fewer records than this page proves exist.
    let total = meta.total.unwrap_or(seen).max(seen);
    let page_count = match meta.page_count {
        Some(count) if count >= page || items.is_empty() => count,
        _ if page_size == 0 => u64::from(total > 0),
        _ => total.div_ceil(page_size),
    };

    PaginatedResult {
        items,
        total,
        page,
        page_size,
        page_count,
    }
}
