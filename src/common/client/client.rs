use std::sync::Arc;

use reqwest::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::common::config::SyncConfig;

use super::error::ApiError;
use super::models::{Method, RequestOptions};
use super::resolver::{ConnectivityResolver, join_url};

/// 经由连接解析器访问后端的客户端
///
/// 只有 GET/HEAD 且路径在白名单内的请求才会在失败后换地址重试，
/// 写操作最多只发往当前首选地址。
#[derive(Clone)]
pub struct BackendClient {
    inner: Client,
    resolver: Arc<ConnectivityResolver>,
    config: SyncConfig,
}

impl BackendClient {
    pub fn new(config: SyncConfig, resolver: Arc<ConnectivityResolver>) -> Result<Self, ApiError> {
        let inner = Client::builder()
            .timeout(config.request_timeout)
            .default_headers(Self::get_default_headers())
            .build()?;
        Ok(Self {
            inner,
            resolver,
            config,
        })
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("dlsync/", env!("CARGO_PKG_VERSION"))),
        );
        headers
    }

    pub fn resolver(&self) -> &Arc<ConnectivityResolver> {
        &self.resolver
    }

    // 本次请求依次尝试的地址
    fn attempt_bases(&self, path: &str, method: Method) -> Vec<String> {
        let known = self.resolver.candidate_bases();
        let first = self
            .resolver
            .preferred_base()
            .or_else(|| known.first().cloned());
        let Some(first) = first else {
            return Vec::new();
        };

        if !(method.is_idempotent() && self.config.is_retry_eligible(path)) {
            return vec![first];
        }
        let mut bases = vec![first];
        for base in known {
            if !bases.contains(&base) {
                bases.push(base);
            }
        }
        bases
    }

    /// 通用请求
    pub async fn request<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
        token: Option<&str>,
    ) -> Result<T, ApiError> {
        if self.resolver.preferred_base().is_none() {
            self.resolver.resolve().await;
        }

        let bases = self.attempt_bases(path, options.method);
        let can_fallback = bases.len() > 1;
        let mut last_error = ApiError::Network("没有可用的后端地址".to_string());

        for (attempt, base) in bases.iter().enumerate() {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_backoff).await;
            }
            if !path.starts_with(&self.config.health_path) {
                self.resolver.ensure_ready(base).await;
            }

            match self.send_once(base, path, &options, token).await {
                Ok(data) => {
                    self.resolver.record_success(base);
                    return Ok(data);
                }
                Err(e) if can_fallback && e.retryable() => {
                    warn!("{}{} 请求失败，尝试下一个地址: {}", base, path, e);
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        base: &str,
        path: &str,
        options: &RequestOptions,
        token: Option<&str>,
    ) -> Result<T, ApiError> {
        let url = join_url(base, path)?;
        debug!("{:?} {}", options.method, url);

        let mut builder = self.inner.request(options.method.into(), url);
        if let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &options.body {
            builder = builder.json(body);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(ApiError::from_response(status.as_u16(), &text));
        }
        Self::handle_body(&text)
    }

    // 空响应体按 null 解析，方便 () 和 Option 类型
    fn handle_body<T: DeserializeOwned>(text: &str) -> Result<T, ApiError> {
        let value: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(text)
                .map_err(|e| ApiError::InvalidResponse(format!("{}: {}", e, text)))?
        };
        serde_json::from_value::<T>(value).map_err(|e| {
            ApiError::InvalidResponse(format!("解析响应失败: {}. 原始响应: {}", e, text))
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, token: Option<&str>) -> Result<T, ApiError> {
        self.request(path, RequestOptions::get(), token).await
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Result<T, ApiError> {
        self.request(path, RequestOptions::post(body), token).await
    }
}
