//! End-to-end tests: the gateway over the real reqwest transport against a
//! local mock server.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use herdlink_core::auth::{StoredTokens, TokenStore};
use herdlink_core::http::{JarCookies, ReqwestTransport};
use herdlink_core::storage::{KeyValueStore, MemoryStore};
use herdlink_core::{Credential, Gateway, GatewayConfig, GatewayError, Method, WriteOutcome};
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(base_url: &str) -> GatewayConfig {
    GatewayConfig {
        base_url: base_url.to_string(),
        api_prefix: "/api".to_string(),
        ..GatewayConfig::default()
    }
}

async fn gateway_with(config: GatewayConfig) -> (Gateway, Arc<MemoryStore>) {
    let transport = ReqwestTransport::new().expect("http client");
    let origin = Url::parse(&config.base_url).expect("base url");
    let cookies = Arc::new(JarCookies::new(transport.cookie_jar(), origin));
    let store = Arc::new(MemoryStore::new());
    let gateway = Gateway::builder(config, Arc::new(transport), store.clone(), cookies)
        .build()
        .await
        .expect("gateway");
    (gateway, store)
}

async fn mount_session_check(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/auth/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_login_then_write_carries_bearer_and_csrf() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "csrf_access_token=c1; Path=/")
                .set_body_json(json!({"access_token": "t1"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/animals"))
        .and(header("authorization", "Bearer t1"))
        .and(header("x-csrf-token", "c1"))
        .and(body_json(json!({"name": "Bessie"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"data": {"id": 5, "name": "Bessie"}})))
        .expect(1)
        .mount(&server)
        .await;

    let (gateway, _) = gateway_with(config_for(&server.uri())).await;
    gateway
        .login(json!({"email": "farmer@example.com", "password": "hunter2"}))
        .await
        .expect("login");

    let outcome = gateway
        .resource("animals")
        .create(json!({"name": "Bessie"}))
        .await
        .expect("create");
    assert_eq!(outcome, WriteOutcome::Applied(json!({"id": 5, "name": "Bessie"})));
}

#[tokio::test]
async fn test_expired_credential_is_refreshed_once() {
    let server = MockServer::start().await;
    mount_session_check(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/animals"))
        .and(header("authorization", "Bearer old"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"msg": "Token has expired"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/animals"))
        .and(header("authorization", "Bearer new"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "new"})))
        .expect(1)
        .mount(&server)
        .await;

    let (gateway, store) = gateway_with(config_for(&server.uri())).await;
    StoredTokens::new(store.clone())
        .save(&Credential::new("old"))
        .await
        .expect("seed credential");

    let animals = gateway.resource("animals").get(&BTreeMap::new()).await.expect("list");
    assert_eq!(animals, vec![json!({"id": 1})]);
}

#[tokio::test]
async fn test_concurrent_reads_hit_the_server_once() {
    let server = MockServer::start().await;
    mount_session_check(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/fields"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"results": [{"id": "north"}]}))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (gateway, _) = gateway_with(config_for(&server.uri())).await;
    let fields = gateway.resource("fields");
    let params = BTreeMap::new();

    let results = futures::future::join_all((0..5).map(|_| fields.get(&params))).await;
    for result in results {
        assert_eq!(result.expect("list"), vec![json!({"id": "north"})]);
    }
}

#[tokio::test]
async fn test_not_modified_serves_cached_payload() {
    let server = MockServer::start().await;
    mount_session_check(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/breeds"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/breeds"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"v1\"")
                .set_body_json(json!([{"id": "angus"}])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (gateway, store) = gateway_with(config_for(&server.uri())).await;
    let sync = gateway.sync_client("breeds");

    let first = sync.fetch(&BTreeMap::new()).await.expect("first fetch");
    let second = sync.fetch(&BTreeMap::new()).await.expect("second fetch");
    assert_eq!(first.data, second.data);
    assert_eq!(second.data, json!([{"id": "angus"}]));
    assert!(store.get("sync:breeds").await.expect("store").is_some());
}

#[tokio::test]
async fn test_unreachable_server_queues_write_and_replay_halts() {
    // Reserve a port nothing listens on.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let dead = format!("http://{}", listener.local_addr().expect("addr"));
    drop(listener);

    let (gateway, _) = gateway_with(config_for(&dead)).await;
    let outcome = gateway
        .resource("animals")
        .patch(3, json!({"weight": 612}))
        .await
        .expect("patch");
    assert!(outcome.is_queued());

    let queued = gateway.queued_writes().await.expect("queue");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].method, Method::Patch);
    assert_eq!(queued[0].url, format!("{}/api/animals/3", dead));

    let report = gateway.replay_offline_queue().await.expect("replay");
    assert_eq!(report.replayed, 0);
    assert!(matches!(report.halted, Some((_, GatewayError::Connectivity(_)))));
    assert_eq!(gateway.queued_writes().await.expect("queue").len(), 1);
}

#[tokio::test]
async fn test_hung_server_times_out() {
    let server = MockServer::start().await;
    mount_session_check(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/animals"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let config = GatewayConfig {
        request_timeout_secs: 1,
        ..config_for(&server.uri())
    };
    let (gateway, _) = gateway_with(config).await;

    let err = gateway
        .resource("animals")
        .get(&BTreeMap::new())
        .await
        .expect_err("should time out");
    assert_eq!(err, GatewayError::Timeout(Duration::from_secs(1)));
}
