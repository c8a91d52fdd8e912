use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use download_sync::common::client::models::RequestOptions;
use download_sync::common::runtime::{NativeRuntime, RuntimeError};
use download_sync::downloader::models::LocalAgentRow;
use download_sync::{ApiError, BackendClient, ConnectivityResolver, MemoryStore, NoRuntime, SyncConfig};
use httpmock::prelude::*;
use serde_json::{Value, json};

fn config_for(bases: &[&MockServer]) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.api_bases = bases.iter().map(|s| s.base_url()).collect();
    config.platform_bases = Vec::new();
    config
}

fn client_for(config: SyncConfig) -> BackendClient {
    let resolver =
        ConnectivityResolver::new(config.clone(), Arc::new(MemoryStore::new()), Arc::new(NoRuntime))
            .unwrap();
    BackendClient::new(config, Arc::new(resolver)).unwrap()
}

#[tokio::test]
async fn resolver_skips_unhealthy_candidate_and_keeps_choice() {
    let a = MockServer::start_async().await;
    let b = MockServer::start_async().await;
    let a_health = a
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(503);
        })
        .await;
    let b_health = b
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(200).json_body(json!({"status": "ok", "max_page_size": 500}));
        })
        .await;

    let client = client_for(config_for(&[&a, &b]));
    let resolver = client.resolver();

    assert_eq!(resolver.resolve().await, Some(b.base_url()));
    let candidates = resolver.last_candidates();
    assert!(!candidates[0].healthy);
    assert!(candidates[1].usable());
    assert_eq!(candidates[1].observed_limit, Some(500));

    // 首选仍然可用时不再探测其他候选
    assert_eq!(resolver.resolve().await, Some(b.base_url()));
    assert_eq!(a_health.hits_async().await, 1);
    assert_eq!(b_health.hits_async().await, 2);
}

#[tokio::test]
async fn compatibility_limit_is_read_from_validation_error() {
    let old = MockServer::start_async().await;
    let new = MockServer::start_async().await;
    old.mock_async(|when, then| {
        when.method(GET).path("/health");
        then.status(200).json_body(json!({"status": "ok"}));
    })
    .await;
    old.mock_async(|when, then| {
        when.method(GET).path("/games").query_param("limit", "100000");
        then.status(422).json_body(json!({
            "detail": [{"loc": ["query", "limit"], "msg": "Input should be less than or equal to 100"}]
        }));
    })
    .await;
    new.mock_async(|when, then| {
        when.method(GET).path("/health");
        then.status(200).json_body(json!({"status": "ok"}));
    })
    .await;
    new.mock_async(|when, then| {
        when.method(GET).path("/games").query_param("limit", "100000");
        then.status(422).json_body(json!({
            "detail": [{"loc": ["query", "limit"], "ctx": {"le": 1000}}]
        }));
    })
    .await;

    let client = client_for(config_for(&[&old, &new]));
    let resolver = client.resolver();

    assert_eq!(resolver.resolve().await, Some(new.base_url()));
    let candidates = resolver.last_candidates();
    assert!(candidates[0].healthy && !candidates[0].compatible);
    assert_eq!(candidates[0].observed_limit, Some(100));
    assert_eq!(candidates[1].observed_limit, Some(1000));
}

#[tokio::test]
async fn merely_healthy_candidate_is_used_when_none_compatible() {
    let only = MockServer::start_async().await;
    only.mock_async(|when, then| {
        when.method(GET).path("/health");
        then.status(200).json_body(json!({"max_page_size": 50}));
    })
    .await;

    let client = client_for(config_for(&[&only]));
    assert_eq!(client.resolver().resolve().await, Some(only.base_url()));
}

#[tokio::test]
async fn no_healthy_candidate_keeps_previous_base() {
    let dead = MockServer::start_async().await;
    dead.mock_async(|when, then| {
        when.method(GET).path("/health");
        then.status(500);
    })
    .await;

    let client = client_for(config_for(&[&dead]));
    assert_eq!(client.resolver().resolve().await, None);
    assert!(client.resolver().preferred_base().is_none());
}

// A 健康且兼容，解析后成为首选
async fn healthy_primary(a: &MockServer) {
    a.mock_async(|when, then| {
        when.method(GET).path("/health");
        then.status(200).json_body(json!({"max_page_size": 500}));
    })
    .await;
}

#[tokio::test]
async fn get_on_retry_eligible_path_falls_back_on_503() {
    let a = MockServer::start_async().await;
    let b = MockServer::start_async().await;
    healthy_primary(&a).await;
    let a_list = a
        .mock_async(|when, then| {
            when.method(GET).path("/downloads");
            then.status(503).json_body(json!({"detail": "restarting"}));
        })
        .await;
    let b_list = b
        .mock_async(|when, then| {
            when.method(GET)
                .path("/downloads")
                .header("authorization", "Bearer t0k");
            then.status(200).json_body(json!([{"id": "dl-1", "game_id": "g1"}]));
        })
        .await;

    let client = client_for(config_for(&[&a, &b]));
    let items: Vec<Value> = client.get("/downloads", Some("t0k")).await.unwrap();

    assert_eq!(items.len(), 1);
    a_list.assert_async().await;
    b_list.assert_async().await;
    // 成功的地址成为新的首选
    assert_eq!(client.resolver().preferred_base(), Some(b.base_url()));
}

#[tokio::test]
async fn post_never_falls_back_even_on_503() {
    let a = MockServer::start_async().await;
    let b = MockServer::start_async().await;
    healthy_primary(&a).await;
    let a_pause = a
        .mock_async(|when, then| {
            when.method(POST).path("/downloads/dl-1/pause");
            then.status(503).json_body(json!({"message": "busy"}));
        })
        .await;
    let b_pause = b
        .mock_async(|when, then| {
            when.method(POST).path("/downloads/dl-1/pause");
            then.status(200).json_body(json!({}));
        })
        .await;

    let client = client_for(config_for(&[&a, &b]));
    let err = client
        .request::<Value>("/downloads/dl-1/pause", RequestOptions::post(None), Some("t0k"))
        .await
        .unwrap_err();

    match err {
        ApiError::Http { status, message, retryable, .. } => {
            assert_eq!(status, 503);
            assert_eq!(message, "busy");
            assert!(retryable);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(a_pause.hits_async().await, 1);
    assert_eq!(b_pause.hits_async().await, 0);
}

#[tokio::test]
async fn get_outside_allow_list_does_not_fall_back() {
    let a = MockServer::start_async().await;
    let b = MockServer::start_async().await;
    healthy_primary(&a).await;
    a.mock_async(|when, then| {
        when.method(GET).path("/account/profile");
        then.status(502);
    })
    .await;
    let b_profile = b
        .mock_async(|when, then| {
            when.method(GET).path("/account/profile");
            then.status(200).json_body(json!({}));
        })
        .await;

    let client = client_for(config_for(&[&a, &b]));
    let err = client.get::<Value>("/account/profile", None).await.unwrap_err();
    assert_eq!(err.status(), Some(502));
    assert_eq!(b_profile.hits_async().await, 0);
}

#[tokio::test]
async fn auth_failures_surface_without_retry() {
    let a = MockServer::start_async().await;
    let b = MockServer::start_async().await;
    healthy_primary(&a).await;
    a.mock_async(|when, then| {
        when.method(GET).path("/downloads");
        then.status(401).json_body(json!({"detail": "Not authenticated"}));
    })
    .await;
    let b_list = b
        .mock_async(|when, then| {
            when.method(GET).path("/downloads");
            then.status(200).json_body(json!([]));
        })
        .await;

    let client = client_for(config_for(&[&a, &b]));
    let err = client.get::<Value>("/downloads", Some("expired")).await.unwrap_err();
    assert_eq!(err, ApiError::AuthRequired("Not authenticated".to_string()));
    assert_eq!(b_list.hits_async().await, 0);
}

// 宿主已经解析出后端地址
struct HostRuntime {
    base: String,
}

#[async_trait]
impl NativeRuntime for HostRuntime {
    fn is_available(&self) -> bool {
        true
    }

    async fn resolved_api_base(&self) -> Result<Option<String>, RuntimeError> {
        Ok(Some(self.base.clone()))
    }

    async fn list_local_tasks(&self) -> Result<Vec<LocalAgentRow>, RuntimeError> {
        Ok(Vec::new())
    }

    async fn pause(&self, _id: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn resume(&self, _id: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn cancel(&self, _id: &str) -> Result<(), RuntimeError> {
        Ok(())
    }
}

fn hosted_client(server: &MockServer, tweak: impl FnOnce(&mut SyncConfig)) -> BackendClient {
    let mut config = config_for(&[]);
    tweak(&mut config);
    let runtime = Arc::new(HostRuntime {
        base: format!("{}/", server.base_url()),
    });
    let resolver =
        ConnectivityResolver::new(config.clone(), Arc::new(MemoryStore::new()), runtime).unwrap();
    BackendClient::new(config, Arc::new(resolver)).unwrap()
}

async fn empty_downloads(server: &MockServer) -> httpmock::Mock<'_> {
    server
        .mock_async(|when, then| {
            when.method(GET).path("/downloads");
            then.status(200).json_body(json!([]));
        })
        .await
}

async fn readiness(server: &MockServer, ready: bool) -> httpmock::Mock<'_> {
    server
        .mock_async(|when, then| {
            when.method(GET).path("/health/ready");
            then.status(200).json_body(json!({ "ready": ready }));
        })
        .await
}

#[tokio::test]
async fn runtime_base_is_used_without_probing_and_readiness_is_cached() {
    let server = MockServer::start_async().await;
    let health = server
        .mock_async(|when, then| {
            when.method(GET).path("/health");
            then.status(200).json_body(json!({"max_page_size": 500}));
        })
        .await;
    let ready = readiness(&server, true).await;
    let list = empty_downloads(&server).await;

    let client = hosted_client(&server, |_| {});

    // 健康检查路径本身不经过就绪门
    let _: Value = client.get("/health", None).await.unwrap();
    assert_eq!(client.resolver().preferred_base(), Some(server.base_url()));
    assert_eq!(ready.hits_async().await, 0);
    assert_eq!(health.hits_async().await, 1);

    let _: Value = client.get("/downloads", None).await.unwrap();
    let _: Value = client.get("/downloads", None).await.unwrap();
    assert_eq!(ready.hits_async().await, 1);
    assert_eq!(list.hits_async().await, 2);
    // 宿主地址被直接信任，没有额外的健康探测
    assert_eq!(health.hits_async().await, 1);
    assert_eq!(client.resolver().resolve().await, Some(server.base_url()));
    assert_eq!(health.hits_async().await, 1);
}

#[tokio::test]
async fn readiness_gate_gives_up_after_attempt_limit() {
    let server = MockServer::start_async().await;
    let not_ready = readiness(&server, false).await;
    let list = empty_downloads(&server).await;

    let client = hosted_client(&server, |config| {
        config.readiness_attempts = 3;
        config.readiness_delay = Duration::from_millis(20);
    });

    // 耗尽次数后照常发出请求
    let items: Vec<Value> = client.get("/downloads", None).await.unwrap();
    assert!(items.is_empty());
    assert_eq!(not_ready.hits_async().await, 3);
    assert_eq!(list.hits_async().await, 1);

    // 失败结果不缓存
    let _: Value = client.get("/downloads", None).await.unwrap();
    assert_eq!(not_ready.hits_async().await, 6);
}

#[tokio::test]
async fn readiness_is_checked_again_after_ttl() {
    let server = MockServer::start_async().await;
    let ready = readiness(&server, true).await;
    empty_downloads(&server).await;

    let client = hosted_client(&server, |config| {
        config.readiness_ttl = Duration::from_millis(100);
    });

    let _: Value = client.get("/downloads", None).await.unwrap();
    let _: Value = client.get("/downloads", None).await.unwrap();
    assert_eq!(ready.hits_async().await, 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let _: Value = client.get("/downloads", None).await.unwrap();
    assert_eq!(ready.hits_async().await, 2);
}

#[tokio::test]
async fn request_waits_until_runtime_base_reports_ready() {
    let server = MockServer::start_async().await;
    let not_ready = readiness(&server, false).await;
    let list = empty_downloads(&server).await;

    let client = hosted_client(&server, |config| {
        config.readiness_delay = Duration::from_millis(100);
    });
    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.get::<Value>("/downloads", None).await }
    });

    while not_ready.hits_async().await == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(list.hits_async().await, 0);
    not_ready.delete_async().await;
    let ready = readiness(&server, true).await;

    pending.await.unwrap().unwrap();
    assert_eq!(ready.hits_async().await, 1);
    assert_eq!(list.hits_async().await, 1);
}
