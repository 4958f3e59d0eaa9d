//! 只读外部数据源：代币余额与指标
//!
//! 只用于丰富分类器与审议的 prompt 上下文；任何失败都降级为「不附加该上下文」，不影响本轮消息处理。

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataSourceError {
    #[error("data source disabled")]
    Disabled,

    #[error("request failed: {0}")]
    Http(String),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("invalid response: {0}")]
    Decode(String),
}

/// 代币指标：名称 -> 数值（price / volume_24h / holders …）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenMetrics {
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

#[async_trait]
pub trait DataSource: Send + Sync {
    /// 余额以十进制字符串返回（链上数值可能超过 u64）
    async fn get_balance(&self, token: &str, address: &str) -> Result<String, DataSourceError>;

    async fn get_metrics(&self, token: &str) -> Result<TokenMetrics, DataSourceError>;

    fn enabled(&self) -> bool {
        true
    }
}

/// 未配置数据源时使用
#[derive(Debug, Clone, Default)]
pub struct NoopDataSource;

#[async_trait]
impl DataSource for NoopDataSource {
    async fn get_balance(&self, _token: &str, _address: &str) -> Result<String, DataSourceError> {
        Err(DataSourceError::Disabled)
    }

    async fn get_metrics(&self, _token: &str) -> Result<TokenMetrics, DataSourceError> {
        Err(DataSourceError::Disabled)
    }

    fn enabled(&self) -> bool {
        false
    }
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    #[serde(alias = "balance")]
    amount: serde_json::Value,
}

/// HTTP 数据源：GET {base}/token/{token}/balance/{address}、GET {base}/token/{token}/metrics，Bearer 鉴权
pub struct HttpDataSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpDataSource {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tessera/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, DataSourceError> {
        let mut req = self.client.get(url);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| DataSourceError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(DataSourceError::Status(resp.status().as_u16()));
        }
        resp.json::<T>()
            .await
            .map_err(|e| DataSourceError::Decode(e.to_string()))
    }
}

#[async_trait]
impl DataSource for HttpDataSource {
    async fn get_balance(&self, token: &str, address: &str) -> Result<String, DataSourceError> {
        tracing::debug!(token, address, "fetching token balance");
        let url = format!("{}/token/{}/balance/{}", self.base_url, token, address);
        let body: BalanceResponse = self.get_json(&url).await?;
        match body.amount {
            serde_json::Value::String(s) => Ok(s),
            serde_json::Value::Number(n) => Ok(n.to_string()),
            other => Err(DataSourceError::Decode(format!("unexpected amount {other}"))),
        }
    }

    async fn get_metrics(&self, token: &str) -> Result<TokenMetrics, DataSourceError> {
        tracing::debug!(token, "fetching token metrics");
        let url = format!("{}/token/{}/metrics", self.base_url, token);
        self.get_json(&url).await
    }
}

static ADDRESS_RE: OnceLock<Regex> = OnceLock::new();

/// 从消息中提取第一个 EVM 地址
pub fn extract_address(text: &str) -> Option<&str> {
    ADDRESS_RE
        .get_or_init(|| Regex::new(r"\b0x[a-fA-F0-9]{40}\b").expect("address regex"))
        .find(text)
        .map(|m| m.as_str())
}

/// 为消息拼接外部上下文：有地址时附加余额，另附代币指标；失败的部分直接省略
pub async fn message_context(source: &dyn DataSource, token: Option<&str>, text: &str) -> Option<String> {
    if !source.enabled() {
        return None;
    }
    let token = token.filter(|t| !t.is_empty())?;
    let mut lines = Vec::new();

    if let Some(address) = extract_address(text) {
        match source.get_balance(token, address).await {
            Ok(amount) => lines.push(format!("{token} balance of {address}: {amount}")),
            Err(e) => tracing::warn!(error = %e, token, address, "balance lookup failed, context omitted"),
        }
    }
    match source.get_metrics(token).await {
        Ok(metrics) if !metrics.values.is_empty() => {
            let rendered: Vec<String> = metrics
                .values
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            lines.push(format!("{token} metrics: {}", rendered.join(", ")));
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, token, "metrics lookup failed, context omitted"),
    }

    (!lines.is_empty()).then(|| lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource;

    #[async_trait]
    impl DataSource for FixedSource {
        async fn get_balance(&self, _token: &str, _address: &str) -> Result<String, DataSourceError> {
            Err(DataSourceError::Status(502))
        }

        async fn get_metrics(&self, _token: &str) -> Result<TokenMetrics, DataSourceError> {
            let mut values = BTreeMap::new();
            values.insert("holders".to_string(), 1200.0);
            Ok(TokenMetrics { values })
        }
    }

    #[test]
    fn test_extract_address() {
        let text = "check 0x52908400098527886E0F7030069857D2E4169EE7 please";
        assert_eq!(
            extract_address(text),
            Some("0x52908400098527886E0F7030069857D2E4169EE7")
        );
        assert!(extract_address("0x1234").is_none());
    }

    #[tokio::test]
    async fn test_failed_balance_is_omitted() {
        let text = "balance of 0x52908400098527886E0F7030069857D2E4169EE7?";
        let ctx = message_context(&FixedSource, Some("CARV"), text).await.unwrap();
        assert!(!ctx.contains("balance of"));
        assert!(ctx.contains("CARV metrics: holders=1200"));
    }

    #[tokio::test]
    async fn test_noop_source_adds_nothing() {
        assert!(message_context(&NoopDataSource, Some("CARV"), "hi").await.is_none());
        assert!(message_context(&FixedSource, None, "hi").await.is_none());
    }

    #[test]
    fn test_metrics_deserialize_flat() {
        let m: TokenMetrics = serde_json::from_str(r#"{"price": 0.5, "volume_24h": 1000}"#).unwrap();
        assert_eq!(m.values.get("price"), Some(&0.5));
    }
}
