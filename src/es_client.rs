use std::{fmt, time::Duration};

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    clamp::ClampedSearch,
    errors::{ErrorContext, NormalizedError},
    models::{ClusterHealthParams, EsqlQueryResponse, MappingResponse, SearchResult},
};

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_UPSTREAM_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone, PartialEq, Eq)]
pub enum EsAuth {
    None,
    ApiKey(String),
    Basic {
        username: String,
        password: Option<String>,
    },
}

impl fmt::Debug for EsAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EsConfig {
    pub url: String,
    pub auth: EsAuth,
    pub skip_tls_verify: bool,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_body_bytes: usize,
}

impl EsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth: EsAuth::None,
            skip_tls_verify: false,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            max_body_bytes: DEFAULT_MAX_UPSTREAM_BYTES,
        }
    }
}

/// Thin Elasticsearch HTTP client. Every failure comes back as a [`NormalizedError`].
#[derive(Clone)]
pub struct EsClient {
    http: Client,
    base_url: String,
    auth: EsAuth,
    max_body_bytes: usize,
}

impl fmt::Debug for EsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EsClient")
            .field("base_url", &self.base_url)
            .field("auth", &self.auth)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

impl EsClient {
    pub fn new(config: &EsConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.skip_tls_verify)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create Elasticsearch HTTP client: {e}"))?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            auth: config.auth.clone(),
            max_body_bytes: config.max_body_bytes,
        })
    }

    pub async fn search(
        &self,
        search: &ClampedSearch,
        context: &ErrorContext,
    ) -> Result<SearchResult, NormalizedError> {
        let request = self
            .http
            .post(self.url(&format!("{}/_search", search.index)))
            .json(&search.body);
        self.execute(request, context).await
    }

    pub async fn get_mapping(
        &self,
        index: &str,
        context: &ErrorContext,
    ) -> Result<MappingResponse, NormalizedError> {
        let request = self.http.get(self.url(&format!("{index}/_mapping")));
        self.execute(request, context).await
    }

    pub async fn cluster_health(
        &self,
        params: &ClusterHealthParams,
        context: &ErrorContext,
    ) -> Result<Value, NormalizedError> {
        let mut query = Vec::new();
        if let Some(status) = &params.wait_for_status {
            query.push(("wait_for_status", status.as_str()));
        }
        if let Some(timeout) = &params.timeout {
            query.push(("timeout", timeout.as_str()));
        }

        let request = self.http.get(self.url("_cluster/health")).query(&query);
        self.execute(request, context).await
    }

    /// `_cat/<endpoint>` in JSON form. `params` are passed through as query parameters.
    pub async fn cat(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
        context: &ErrorContext,
    ) -> Result<Vec<Value>, NormalizedError> {
        let request = self
            .http
            .get(self.url(&format!("_cat/{endpoint}")))
            .query(&[("format", "json")])
            .query(params);
        self.execute(request, context).await
    }

    pub async fn esql(
        &self,
        query: &str,
        context: &ErrorContext,
    ) -> Result<EsqlQueryResponse, NormalizedError> {
        let request = self
            .http
            .post(self.url("_query"))
            .json(&json!({ "query": query }));
        self.execute(request, context).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            EsAuth::None => request,
            EsAuth::ApiKey(key) => request.header("Authorization", format!("ApiKey {key}")),
            EsAuth::Basic { username, password } => request.basic_auth(username, password.as_ref()),
        }
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        context: &ErrorContext,
    ) -> Result<T, NormalizedError> {
        let mut response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| NormalizedError::from_transport(&e, context))?;

        let status = response.status();
        debug!(
            operation = %context.operation,
            status = status.as_u16(),
            url = %response.url(),
            "Elasticsearch responded"
        );

        let body = self.read_body(&mut response, context).await?;
        if !status.is_success() {
            return Err(NormalizedError::from_status(status, &body, context));
        }

        serde_json::from_slice(&body).map_err(|e| NormalizedError::from_parse(&e, context))
    }

    async fn read_body(
        &self,
        response: &mut Response,
        context: &ErrorContext,
    ) -> Result<Vec<u8>, NormalizedError> {
        let too_large = || {
            NormalizedError::malformed(
                format!(
                    "Elasticsearch response exceeded {} bytes",
                    self.max_body_bytes
                ),
                context,
            )
        };

        if response
            .content_length()
            .is_some_and(|len| len > self.max_body_bytes as u64)
        {
            return Err(too_large());
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| NormalizedError::from_transport(&e, context))?
        {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}
