//! Single-flight sharing of concurrent identical reads.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use super::transport::Method;
use crate::error::Result;

type SharedRead = Shared<BoxFuture<'static, Result<Value>>>;

/// Concurrent callers with the same key await one shared future. The key is
/// dropped from the map as soon as that future settles, so later callers
/// start fresh.
#[derive(Default)]
pub struct RequestCoalescer {
    inflight: Arc<Mutex<HashMap<String, SharedRead>>>,
}

impl RequestCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Order-independent key: `BTreeMap` serializes its keys sorted.
    pub fn key(method: Method, url: &str, params: &BTreeMap<String, Value>) -> String {
        let params = serde_json::to_string(params).unwrap_or_default();
        format!("{} {} {}", method, url, params)
    }

    /// Run `start` unless an identical read is already in flight.
    ///
    /// Callers holding a cancellation token pass `bypass = true`.
    pub async fn run<F>(&self, key: String, bypass: bool, start: F) -> Result<Value>
    where
        F: FnOnce() -> BoxFuture<'static, Result<Value>>,
    {
        if bypass {
            debug!(key = %key, "Cancellable read, bypassing coalescer");
            return start().await;
        }

        let shared = {
            let mut inflight = self.inflight.lock();
            if let Some(existing) = inflight.get(&key) {
                debug!(key = %key, "Joining in-flight read");
                existing.clone()
            } else {
                let map = Arc::clone(&self.inflight);
                let settled_key = key.clone();
                let request = start();
                let shared = async move {
                    let outcome = request.await;
                    map.lock().remove(&settled_key);
                    outcome
                }
                .boxed()
                .shared();
                inflight.insert(key, shared.clone());
                shared
            }
        };

        shared.await
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn slow_read(
        calls: Arc<AtomicUsize>,
        outcome: Result<Value>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<Value>> {
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                outcome
            }
            .boxed()
        }
    }

    #[test]
    fn test_key_ignores_parameter_order() {
        let mut a = BTreeMap::new();
        a.insert("page".to_string(), json!(1));
        a.insert("search".to_string(), json!("cow"));
        let mut b = BTreeMap::new();
        b.insert("search".to_string(), json!("cow"));
        b.insert("page".to_string(), json!(1));

        assert_eq!(
            RequestCoalescer::key(Method::Get, "/animals", &a),
            RequestCoalescer::key(Method::Get, "/animals", &b)
        );
    }

    #[tokio::test]
    async fn test_concurrent_identical_reads_share_one_call() {
        let coalescer = RequestCoalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let reads = (0..5).map(|_| {
            coalescer.run(
                "GET /animals {}".to_string(),
                false,
                slow_read(calls.clone(), Ok(json!([{"id": 1}]))),
            )
        });
        let results = futures::future::join_all(reads).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_ref().ok() == Some(&json!([{"id": 1}]))));
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_key_released() {
        let coalescer = RequestCoalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let failure = Err(GatewayError::Server {
            status: 500,
            message: "boom".to_string(),
        });

        let (a, b) = tokio::join!(
            coalescer.run("k".to_string(), false, slow_read(calls.clone(), failure.clone())),
            coalescer.run("k".to_string(), false, slow_read(calls.clone(), failure.clone())),
        );
        assert_eq!(a, failure);
        assert_eq!(b, failure);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // settled, so the next read goes out again
        coalescer
            .run("k".to_string(), false, slow_read(calls.clone(), Ok(json!(1))))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellable_reads_are_not_shared() {
        let coalescer = RequestCoalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let (_, _) = tokio::join!(
            coalescer.run("k".to_string(), true, slow_read(calls.clone(), Ok(json!(1)))),
            coalescer.run("k".to_string(), true, slow_read(calls.clone(), Ok(json!(1)))),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
