use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

lazy_static! {
    static ref LIMIT_IN_MESSAGE: Regex = Regex::new(r"(?i)less than or equal to\s*(\d+)").unwrap();
}

/// 健康检查返回，能力上限字段可选
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthPayload {
    #[serde(default, alias = "list_limit", alias = "limit")]
    pub max_page_size: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReadinessPayload {
    #[serde(default)]
    pub ready: bool,
}

/// 一次解析过程中的候选地址，不持久化
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityCandidate {
    pub base_url: String,
    pub healthy: bool,
    pub compatible: bool,
    pub observed_limit: Option<u64>,
}

impl ConnectivityCandidate {
    pub fn unhealthy(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            healthy: false,
            compatible: false,
            observed_limit: None,
        }
    }

    pub fn usable(&self) -> bool {
        self.healthy && self.compatible
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl Method {
    /// 幂等方法才允许跨地址重试
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Self::Get | Self::Head)
    }
}

impl From<Method> for reqwest::Method {
    fn from(m: Method) -> Self {
        match m {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub body: Option<Value>,
}

impl RequestOptions {
    pub fn get() -> Self {
        Self {
            method: Method::Get,
            body: None,
        }
    }

    pub fn post(body: Option<Value>) -> Self {
        Self {
            method: Method::Post,
            body,
        }
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::get()
    }
}

/// 从故意越界的探测请求的校验错误里读出上限
///
/// 支持 `detail[*].ctx.le` 以及消息里的 "less than or equal to N"。
pub fn limit_from_validation_error(body: &Value) -> Option<u64> {
    if let Some(items) = body.get("detail").and_then(Value::as_array) {
        for item in items {
            if let Some(le) = item.get("ctx").and_then(|ctx| ctx.get("le")) {
                if let Some(limit) = le.as_u64().or_else(|| le.as_f64().map(|f| f as u64)) {
                    return Some(limit);
                }
            }
            if let Some(limit) = item.get("msg").and_then(Value::as_str).and_then(limit_from_message) {
                return Some(limit);
            }
        }
    }

    ["detail", "message"]
        .iter()
        .filter_map(|key| body.get(*key).and_then(Value::as_str))
        .find_map(limit_from_message)
}

fn limit_from_message(message: &str) -> Option<u64> {
    LIMIT_IN_MESSAGE
        .captures(message)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
