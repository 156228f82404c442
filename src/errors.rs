use axum::http::StatusCode;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, warn};

const MAX_UPSTREAM_MESSAGE_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotFound,
    Timeout,
    Unreachable,
    MalformedUpstream,
    InvalidRequest,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::Timeout => "TIMEOUT",
            Self::Unreachable => "UNREACHABLE",
            Self::MalformedUpstream => "MALFORMED_UPSTREAM",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            Self::NotFound => -32004,
            Self::Timeout => -32008,
            Self::Unreachable => -32003,
            Self::MalformedUpstream => -32005,
            Self::InvalidRequest => -32602,
            Self::Internal => -32603,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Unreachable => StatusCode::BAD_GATEWAY,
            Self::MalformedUpstream => StatusCode::BAD_GATEWAY,
            Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unreachable | Self::Internal)
    }
}

/// Which operation (and index, when there is one) a failure belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            index: None,
        }
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizedError {
    #[error("{message}")]
    NotFound {
        message: String,
        context: ErrorContext,
    },
    #[error("{message}")]
    Timeout {
        message: String,
        context: ErrorContext,
    },
    #[error("{message}")]
    Unreachable {
        message: String,
        context: ErrorContext,
    },
    #[error("{message}")]
    MalformedUpstream {
        message: String,
        context: ErrorContext,
    },
    #[error("{message}")]
    InvalidRequest {
        message: String,
        context: ErrorContext,
    },
    /// `detail` is for the log only.
    #[error("{message}")]
    Internal {
        message: String,
        detail: String,
        context: ErrorContext,
    },
}

impl NormalizedError {
    pub fn not_found(message: impl Into<String>, context: &ErrorContext) -> Self {
        Self::NotFound {
            message: bounded(message.into()),
            context: context.clone(),
        }
    }

    pub fn timeout(message: impl Into<String>, context: &ErrorContext) -> Self {
        Self::Timeout {
            message: bounded(message.into()),
            context: context.clone(),
        }
    }

    pub fn unreachable(message: impl Into<String>, context: &ErrorContext) -> Self {
        Self::Unreachable {
            message: bounded(message.into()),
            context: context.clone(),
        }
    }

    pub fn malformed(message: impl Into<String>, context: &ErrorContext) -> Self {
        Self::MalformedUpstream {
            message: bounded(message.into()),
            context: context.clone(),
        }
    }

    pub fn invalid_request(message: impl Into<String>, context: &ErrorContext) -> Self {
        Self::InvalidRequest {
            message: bounded(message.into()),
            context: context.clone(),
        }
    }

    pub fn internal(detail: impl Into<String>, context: &ErrorContext) -> Self {
        Self::Internal {
            message: format!("Internal error while running {}", context.operation),
            detail: bounded(detail.into()),
            context: context.clone(),
        }
    }

    /// Maps a non-2xx Elasticsearch reply. `body` is the raw reply body, possibly empty or
    /// not JSON at all.
    pub fn from_status(status: StatusCode, body: &[u8], context: &ErrorContext) -> Self {
        let reason = upstream_reason(body);
        let describe = |fallback: &str| match &reason {
            Some(reason) => format!("{fallback}: {reason}"),
            None => fallback.to_string(),
        };

        if status == StatusCode::NOT_FOUND {
            let target = context
                .index
                .as_deref()
                .map(|index| format!("Index not found: {index}"))
                .unwrap_or_else(|| "Resource not found".to_string());
            return Self::not_found(describe(&target), context);
        }

        if status.is_client_error() {
            return Self::invalid_request(
                describe(&format!("Elasticsearch rejected the request ({status})")),
                context,
            );
        }

        Self::internal(
            describe(&format!("Elasticsearch returned {status}")),
            context,
        )
    }

    pub fn from_transport(err: &reqwest::Error, context: &ErrorContext) -> Self {
        if err.is_timeout() {
            Self::timeout("Elasticsearch did not answer before the deadline", context)
        } else if err.is_connect() {
            Self::unreachable(format!("Cannot connect to Elasticsearch: {err}"), context)
        } else if err.is_decode() {
            Self::malformed(
                format!("Elasticsearch response could not be decoded: {err}"),
                context,
            )
        } else if err.is_body() || err.is_request() {
            Self::unreachable(
                format!("Connection to Elasticsearch failed: {err}"),
                context,
            )
        } else {
            Self::internal(format!("HTTP client error: {err:#}"), context)
        }
    }

    pub fn from_parse(err: &serde_json::Error, context: &ErrorContext) -> Self {
        Self::malformed(
            format!("Elasticsearch returned an unexpected document: {err}"),
            context,
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Unreachable { .. } => ErrorKind::Unreachable,
            Self::MalformedUpstream { .. } => ErrorKind::MalformedUpstream,
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::NotFound { message, .. }
            | Self::Timeout { message, .. }
            | Self::Unreachable { message, .. }
            | Self::MalformedUpstream { message, .. }
            | Self::InvalidRequest { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::NotFound { context, .. }
            | Self::Timeout { context, .. }
            | Self::Unreachable { context, .. }
            | Self::MalformedUpstream { context, .. }
            | Self::InvalidRequest { context, .. }
            | Self::Internal { context, .. } => context,
        }
    }

    pub fn log(&self, trace_id: &str) {
        let context = self.context();
        let index = context.index.as_deref().unwrap_or("-");
        match self {
            Self::Internal { detail, .. } => error!(
                trace_id = %trace_id,
                operation = %context.operation,
                index = %index,
                detail = %detail,
                "Tool call failed with internal error"
            ),
            other => warn!(
                trace_id = %trace_id,
                operation = %context.operation,
                index = %index,
                kind = other.kind().as_str(),
                message = %other.message(),
                "Tool call failed"
            ),
        }
    }

    pub fn to_data(&self, trace_id: &str) -> Value {
        let kind = self.kind();
        let data = ErrorData {
            kind,
            trace_id,
            retryable: kind.retryable(),
            http_status: kind.http_status().as_u16(),
            context: self.context(),
        };
        serde_json::to_value(&data)
            .unwrap_or_else(|_| json!({"kind": kind.as_str(), "traceId": trace_id}))
    }
}

/// The JSON-RPC `data` member of a tool error.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorData<'a> {
    kind: ErrorKind,
    trace_id: &'a str,
    retryable: bool,
    http_status: u16,
    #[serde(flatten)]
    context: &'a ErrorContext,
}

fn upstream_reason(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }

    let Ok(parsed) = serde_json::from_slice::<Value>(body) else {
        let text = String::from_utf8_lossy(body);
        let trimmed = text.trim();
        return (!trimmed.is_empty()).then(|| trimmed.to_string());
    };

    match parsed.get("error") {
        Some(Value::String(reason)) => Some(reason.clone()),
        Some(Value::Object(error)) => error
            .get("reason")
            .and_then(Value::as_str)
            .or_else(|| error.get("type").and_then(Value::as_str))
            .map(ToString::to_string),
        _ => None,
    }
}

fn bounded(message: String) -> String {
    match message.char_indices().nth(MAX_UPSTREAM_MESSAGE_CHARS) {
        Some((cut, _)) => format!("{}...", &message[..cut]),
        None => message,
    }
}
