use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{auth::verify_bearer, dispatcher::Tool, AppState};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
const SERVER_NAME: &str = "es-mcp-governor";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const UNAUTHORIZED: i64 = -32001;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRpcRequest {
    jsonrpc: String,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonRpcSuccess {
    jsonrpc: &'static str,
    id: Value,
    result: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonRpcFailure {
    jsonrpc: &'static str,
    id: Value,
    error: JsonRpcError,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonRpcError {
    code: i64,
    message: String,
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

pub async fn mcp(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let request = match serde_json::from_slice::<JsonRpcRequest>(&body) {
        Ok(request) => request,
        Err(err) => {
            return jsonrpc_error(
                Value::Null,
                PARSE_ERROR,
                "Request body is not a JSON-RPC message",
                json!({"kind": "INVALID_REQUEST", "detail": err.to_string(), "retryable": false}),
                StatusCode::BAD_REQUEST,
            )
        }
    };
    let request_id = request.id.clone().unwrap_or(Value::Null);

    if request.jsonrpc != "2.0" {
        return jsonrpc_error(
            request_id,
            INVALID_REQUEST,
            "jsonrpc must be 2.0",
            json!({"kind": "INVALID_REQUEST", "retryable": false}),
            StatusCode::BAD_REQUEST,
        );
    }

    if let Err(message) = verify_bearer(&headers, state.config.mcp_api_key.as_deref()) {
        warn!(method = %request.method, "Rejected unauthenticated MCP request");
        return jsonrpc_error(
            request_id,
            UNAUTHORIZED,
            message,
            json!({"kind": "UNAUTHORIZED", "retryable": false}),
            StatusCode::UNAUTHORIZED,
        );
    }

    // Notifications carry no id and get no JSON-RPC answer.
    if request.id.is_none() {
        debug!(method = %request.method, "MCP notification received");
        return StatusCode::ACCEPTED.into_response();
    }

    let response = match request.method.as_str() {
        "initialize" => {
            let protocol_version = request
                .params
                .as_ref()
                .and_then(|p| p.get("protocolVersion"))
                .and_then(Value::as_str)
                .unwrap_or(PROTOCOL_VERSION)
                .to_string();
            jsonrpc_ok(
                request_id,
                json!({
                    "protocolVersion": protocol_version,
                    "capabilities": {
                        "tools": {"listChanged": false}
                    },
                    "serverInfo": {
                        "name": SERVER_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            )
        }
        "ping" => jsonrpc_ok(request_id, json!({})),
        "tools/list" => jsonrpc_ok(request_id, json!({ "tools": tool_definitions() })),
        "tools/call" => {
            let params = match request
                .params
                .clone()
                .and_then(|value| serde_json::from_value::<ToolCallParams>(value).ok())
            {
                Some(params) => params,
                None => {
                    return jsonrpc_error(
                        request_id,
                        INVALID_PARAMS,
                        "Invalid tool call parameters",
                        json!({"kind": "INVALID_REQUEST", "retryable": false}),
                        StatusCode::OK,
                    )
                }
            };

            call_tool(&state, request_id, params).await
        }
        _ => jsonrpc_error(
            request_id,
            METHOD_NOT_FOUND,
            format!("Method not found: {}", request.method),
            json!({"kind": "INVALID_REQUEST", "retryable": false}),
            StatusCode::OK,
        ),
    };

    if state.config.mcp_dev_log_payloads {
        debug!(method = %request.method, "MCP request handled");
    }

    response
}

async fn call_tool(state: &AppState, request_id: Value, params: ToolCallParams) -> Response<Body> {
    let trace_id = Uuid::new_v4().to_string();
    let start = Instant::now();

    match state
        .dispatcher
        .dispatch(&params.name, &params.arguments, &trace_id)
        .await
    {
        Ok(output) => {
            let payload = serde_json::to_string(&output.payload).unwrap_or_else(|_| "{}".to_string());
            if state.config.mcp_dev_log_payloads {
                debug!(
                    trace_id = %trace_id,
                    tool = %params.name,
                    response_bytes = payload.len(),
                    truncated = output.truncated,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "MCP tool response payload"
                );
            }

            jsonrpc_ok(
                request_id,
                json!({
                    "content": [
                        {"type": "text", "text": output.summary},
                        {"type": "text", "text": payload},
                    ],
                    "isError": false,
                    "_meta": {
                        "traceId": trace_id,
                        "truncated": output.truncated,
                        "timingMs": start.elapsed().as_millis() as u64,
                    }
                }),
            )
        }
        Err(err) => jsonrpc_error(
            request_id,
            err.kind().jsonrpc_code(),
            err.message(),
            err.to_data(&trace_id),
            StatusCode::OK,
        ),
    }
}

fn tool_definitions() -> Vec<Value> {
    Tool::ALL
        .iter()
        .map(|tool| match tool {
            Tool::Search => tool_def(
                tool.name(),
                "Search an index with the Elasticsearch query DSL. Result size is capped and long fields are truncated.",
                json!({"type":"object","required":["index"],"properties":{"index":{"type":"string","description":"Index name or pattern"},"query_body":{"type":"object","description":"Query DSL body (size, query, sort, aggs, ...)"},"size":{"type":"integer","minimum":0},"fields":{"type":"array","items":{"type":"string"}}}}),
            ),
            Tool::GetMappings => tool_def(
                tool.name(),
                "Get field mappings for an index",
                json!({"type":"object","required":["index"],"properties":{"index":{"type":"string"}}}),
            ),
            Tool::GetClusterHealth => tool_def(
                tool.name(),
                "Get cluster health",
                json!({"type":"object","properties":{"wait_for_status":{"type":"string","enum":["green","yellow","red"]},"timeout":{"type":"string"}}}),
            ),
            Tool::ListIndices => tool_def(
                tool.name(),
                "List indices matching a pattern",
                json!({"type":"object","required":["index_pattern"],"properties":{"index_pattern":{"type":"string"}}}),
            ),
            Tool::ListIndicesDetailed => tool_def(
                tool.name(),
                "List indices with health, shard counts and store size",
                json!({"type":"object","properties":{"index_pattern":{"type":"string","default":"*"},"health":{"type":"string","enum":["green","yellow","red"]},"sort_by":{"type":"string"}}}),
            ),
            Tool::GetShards => tool_def(
                tool.name(),
                "List shard allocation, optionally for one index",
                json!({"type":"object","properties":{"index":{"type":"string"}}}),
            ),
            Tool::GetNodesInfo => tool_def(
                tool.name(),
                "List cluster nodes with resource usage",
                json!({"type":"object","properties":{}}),
            ),
            Tool::Esql => tool_def(
                tool.name(),
                "Run an ES|QL query",
                json!({"type":"object","required":["query"],"properties":{"query":{"type":"string"}}}),
            ),
        })
        .collect()
}

fn tool_def(name: &str, description: &str, input_schema: Value) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": input_schema,
    })
}

fn jsonrpc_ok(id: Value, result: Value) -> Response<Body> {
    let payload = JsonRpcSuccess {
        jsonrpc: "2.0",
        id,
        result,
    };

    build_response(StatusCode::OK, serde_json::to_vec(&payload))
}

fn jsonrpc_error(
    id: Value,
    code: i64,
    message: impl Into<String>,
    data: Value,
    status: StatusCode,
) -> Response<Body> {
    let payload = JsonRpcFailure {
        jsonrpc: "2.0",
        id,
        error: JsonRpcError {
            code,
            message: message.into(),
            data,
        },
    };

    build_response(status, serde_json::to_vec(&payload))
}

fn build_response(status: StatusCode, body: serde_json::Result<Vec<u8>>) -> Response<Body> {
    let body = body.unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error":{"code":"RESPONSE_BUILD_FAILED","message":"Failed building MCP response"}})),
            )
                .into_response()
        })
}

#[cfg(test)]
mod tests {
    use axum::{body::to_bytes, http::Request};
    use tower::ServiceExt;
    use wiremock::{
        matchers::{body_partial_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{app_state, build_router, config::Config, policy::DEFAULT_MAX_RESPONSE_BYTES};

    fn state_for(server: &MockServer, api_key: Option<&str>) -> AppState {
        let uri = server.uri();
        let api_key = api_key.map(str::to_string);
        let config = Config::from_lookup(|key| match key {
            "ES_URL" => Some(uri.clone()),
            "ES_REQUEST_TIMEOUT_MS" => Some("500".to_string()),
            "MCP_API_KEY" => api_key.clone(),
            _ => None,
        })
        .unwrap();
        app_state(config).unwrap()
    }

    async fn rpc(state: AppState, body: Value, token: Option<&str>) -> (StatusCode, Value) {
        let (status, bytes) = rpc_raw(state, body, token).await;
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn rpc_raw(state: AppState, body: Value, token: Option<&str>) -> (StatusCode, Bytes) {
        let mut request = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("content-type", "application/json");
        if let Some(token) = token {
            request = request.header("authorization", format!("Bearer {token}"));
        }
        let response = build_router(state)
            .oneshot(request.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        (status, to_bytes(response.into_body(), usize::MAX).await.unwrap())
    }

    #[tokio::test]
    async fn initialize_and_list_tools() {
        let server = MockServer::start().await;
        let state = state_for(&server, None);

        let (status, body) = rpc(
            state.clone(),
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {"protocolVersion": "2025-03-26"}}),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["protocolVersion"], "2025-03-26");
        assert_eq!(body["result"]["serverInfo"]["name"], SERVER_NAME);

        let (_, body) = rpc(
            state,
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
            None,
        )
        .await;
        let names: Vec<&str> = body["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert_eq!(names.len(), Tool::ALL.len());
        assert!(names.contains(&"search"));
        assert!(names.contains(&"get_cluster_health"));
    }

    #[tokio::test]
    async fn notifications_are_accepted_without_body() {
        let server = MockServer::start().await;
        let (status, body) = rpc(
            state_for(&server, None),
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, Value::Null);
    }

    #[tokio::test]
    async fn tool_call_returns_summary_and_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/logs/_search"))
            .and(body_partial_json(json!({"size": 200})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": {"total": {"value": 1, "relation": "eq"}, "hits": [{"_id": "a", "_source": {"m": "hi"}}]}
            })))
            .mount(&server)
            .await;

        let (status, body) = rpc(
            state_for(&server, None),
            json!({
                "jsonrpc": "2.0", "id": "call-1", "method": "tools/call",
                "params": {"name": "search", "arguments": {"index": "logs", "size": 5000}}
            }),
            None,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "call-1");
        let content = body["result"]["content"].as_array().unwrap();
        assert_eq!(content[0]["text"], "Total results: 1, showing 1.");
        let payload: Value = serde_json::from_str(content[1]["text"].as_str().unwrap()).unwrap();
        assert_eq!(payload["effective_size"], 200);
        assert_eq!(payload["requested_size"], 5000);
        assert_eq!(body["result"]["isError"], false);
    }

    #[tokio::test]
    async fn transported_body_stays_within_response_budget() {
        let server = MockServer::start().await;
        let hits: Vec<Value> = (0..200)
            .map(|i| json!({"_id": i.to_string(), "_source": {"quote": "\"".repeat(900)}}))
            .collect();
        Mock::given(method("POST"))
            .and(path("/quotes/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": {"total": {"value": 200, "relation": "eq"}, "hits": hits}
            })))
            .mount(&server)
            .await;

        let (status, bytes) = rpc_raw(
            state_for(&server, None),
            json!({
                "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                "params": {"name": "search", "arguments": {"index": "quotes", "size": 200}}
            }),
            None,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(bytes.len() <= DEFAULT_MAX_RESPONSE_BYTES, "{}", bytes.len());
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["result"]["_meta"]["truncated"], true);
        let payload: Value =
            serde_json::from_str(body["result"]["content"][1]["text"].as_str().unwrap()).unwrap();
        assert!(payload["truncation"]["dropped_over_budget"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn tool_failures_are_jsonrpc_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"type": "index_not_found_exception", "reason": "no such index [ghost]"}
            })))
            .mount(&server)
            .await;

        let (_, body) = rpc(
            state_for(&server, None),
            json!({
                "jsonrpc": "2.0", "id": 7, "method": "tools/call",
                "params": {"name": "search", "arguments": {"index": "ghost"}}
            }),
            None,
        )
        .await;

        assert_eq!(body["error"]["code"], -32004);
        assert_eq!(body["error"]["data"]["kind"], "NOT_FOUND");
        assert_eq!(body["error"]["data"]["index"], "ghost");
        assert!(body["error"]["data"]["traceId"].as_str().is_some());
    }

    #[tokio::test]
    async fn protocol_errors() {
        let server = MockServer::start().await;
        let state = state_for(&server, None);

        let (_, body) = rpc(
            state.clone(),
            json!({"jsonrpc": "2.0", "id": 1, "method": "resources/list"}),
            None,
        )
        .await;
        assert_eq!(body["error"]["code"], METHOD_NOT_FOUND);

        let (status, body) = rpc(
            state.clone(),
            json!({"jsonrpc": "1.0", "id": 1, "method": "ping"}),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], INVALID_REQUEST);

        let (_, body) = rpc(
            state,
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"arguments": {}}}),
            None,
        )
        .await;
        assert_eq!(body["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn api_key_is_enforced_when_configured() {
        let server = MockServer::start().await;
        let state = state_for(&server, Some("s3cret"));
        let ping = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});

        let (status, body) = rpc(state.clone(), ping.clone(), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], UNAUTHORIZED);

        let (status, body) = rpc(state, ping, Some("s3cret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], json!({}));
    }
}
