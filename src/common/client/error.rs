use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ApiError {
    #[error("网络请求失败: {0}")]
    Network(String),

    #[error("请求超时")]
    Timeout,

    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        code: Option<String>,
        retryable: bool,
    },

    #[error("需要登录认证: {0}")]
    AuthRequired(String),

    #[error("响应解析失败: {0}")]
    InvalidResponse(String),

    #[error("无效的请求地址: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// 网络层失败和 5xx/429/408 可以换地址重试
    pub fn retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Http { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::AuthRequired(_) => Some(401),
            _ => None,
        }
    }

    /// 从错误响应体构造类型化错误
    pub fn from_response(status: u16, body: &str) -> Self {
        let (message, code) = parse_error_payload(body);
        let message = if message.is_empty() {
            format!("请求失败 (HTTP {})", status)
        } else {
            message
        };

        if status == 401 || looks_like_auth_error(&message, code.as_deref()) {
            return Self::AuthRequired(message);
        }

        Self::Http {
            status,
            retryable: status >= 500 || status == 429 || status == 408,
            message,
            code,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidResponse(e.to_string())
    }
}

impl From<url::ParseError> for ApiError {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidUrl(e.to_string())
    }
}

// 依次接受：字符串 detail、{message, code} 形式的 detail、顶层 message，否则原样返回响应体
fn parse_error_payload(body: &str) -> (String, Option<String>) {
    let raw = body.trim().to_string();
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return (raw, None);
    };

    let code = |v: &Value| match v.get("code") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    match value.get("detail") {
        Some(Value::String(detail)) => return (detail.clone(), code(&value)),
        Some(detail @ Value::Object(_)) => {
            if let Some(message) = detail.get("message").and_then(Value::as_str) {
                return (message.to_string(), code(detail).or_else(|| code(&value)));
            }
        }
        _ => {}
    }

    if let Some(message) = value.get("message").and_then(Value::as_str) {
        return (message.to_string(), code(&value));
    }

    (raw, None)
}

fn looks_like_auth_error(message: &str, code: Option<&str>) -> bool {
    const AUTH_CODES: [&str; 5] = [
        "auth_required",
        "unauthorized",
        "not_authenticated",
        "token_expired",
        "invalid_token",
    ];
    if code.is_some_and(|c| AUTH_CODES.contains(&c.to_ascii_lowercase().as_str())) {
        return true;
    }
    let message = message.to_ascii_lowercase();
    [
        "not authenticated",
        "authentication required",
        "login required",
        "could not validate credentials",
        "token expired",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}
