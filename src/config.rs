use std::{env, fmt, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{anyhow, Context, Result};
use reqwest::Url;

use crate::{
    es_client::{EsAuth, EsConfig},
    policy::{
        SizePolicy, DEFAULT_MAX_FIELD_CHARS, DEFAULT_MAX_LIST_ITEMS, DEFAULT_MAX_RESPONSE_BYTES,
        DEFAULT_MAX_RESULT_SIZE, DEFAULT_RESULT_SIZE,
    },
};

#[derive(Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub es: EsConfig,
    pub policy: SizePolicy,
    pub mcp_api_key: Option<String>,
    pub mcp_dev_log_payloads: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().trim_matches('"').trim_matches('\'').to_string())
                .filter(|v| !v.is_empty())
        };

        let bind_raw = var("ES_MCP_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let bind_addr = bind_raw
            .parse::<SocketAddr>()
            .with_context(|| format!("ES_MCP_BIND_ADDR is not a socket address: {bind_raw}"))?;

        let url = var("ES_URL").unwrap_or_else(|| "http://localhost:9200".to_string());
        let parsed = Url::parse(&url).with_context(|| format!("ES_URL is not a valid URL: {url}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("ES_URL must use http or https: {url}"));
        }

        let auth = match (var("ES_API_KEY"), var("ES_USERNAME")) {
            (Some(key), _) => EsAuth::ApiKey(key),
            (None, Some(username)) => EsAuth::Basic {
                username,
                password: var("ES_PASSWORD"),
            },
            (None, None) => EsAuth::None,
        };

        let defaults = EsConfig::new(url);
        let es = EsConfig {
            auth,
            skip_tls_verify: flag(var("ES_SSL_SKIP_VERIFY")),
            request_timeout: number(var("ES_REQUEST_TIMEOUT_MS"))
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            connect_timeout: number(var("ES_CONNECT_TIMEOUT_MS"))
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            max_body_bytes: number(var("ES_MAX_UPSTREAM_BYTES")).unwrap_or(defaults.max_body_bytes),
            ..defaults
        };

        let max_response_bytes = number(var("MCP_MAX_RESPONSE_BYTES"))
            .or_else(|| number(var("MCP_MAX_RESPONSE_CHARS")))
            .unwrap_or(DEFAULT_MAX_RESPONSE_BYTES);

        let policy = SizePolicy::new(
            number(var("MCP_MAX_SEARCH_SIZE")).unwrap_or(DEFAULT_MAX_RESULT_SIZE),
            number(var("MCP_DEFAULT_SEARCH_SIZE")).unwrap_or(DEFAULT_RESULT_SIZE),
            max_response_bytes,
            number(var("MCP_MAX_FIELD_CHARS")).unwrap_or(DEFAULT_MAX_FIELD_CHARS),
            number(var("MCP_MAX_INDEX_LIST")).unwrap_or(DEFAULT_MAX_LIST_ITEMS),
        );

        Ok(Self {
            bind_addr,
            es,
            policy,
            mcp_api_key: var("MCP_API_KEY"),
            mcp_dev_log_payloads: flag(var("MCP_DEV_LOG_PAYLOADS")),
        })
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_addr", &self.bind_addr)
            .field("es", &self.es)
            .field("policy", &self.policy)
            .field("mcp_api_key", &self.mcp_api_key.as_ref().map(|_| "<redacted>"))
            .field("mcp_dev_log_payloads", &self.mcp_dev_log_payloads)
            .finish()
    }
}

fn number<T: FromStr>(raw: Option<String>) -> Option<T> {
    raw.and_then(|v| v.parse::<T>().ok())
}

fn flag(raw: Option<String>) -> bool {
    raw.map(|v| {
        matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
    .unwrap_or(false)
}
