use std::{future::Future, time::Instant};

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{
    clamp::{clamp_search, validate_index_pattern, SearchRequest},
    errors::{ErrorContext, NormalizedError},
    es_client::EsClient,
    models::{
        ClusterHealthParams, EsqlQueryParams, GetMappingsParams, GetShardsParams,
        ListIndicesDetailedParams, ListIndicesParams, SearchParams, TotalRelation,
    },
    policy::SizePolicy,
    shaper::{bound_document, shape_list, shape_search, ShapedList},
};

const HEALTH_STATUSES: [&str; 3] = ["green", "yellow", "red"];
// Upstream names echoed into summaries are cut to this many chars.
const MAX_SUMMARY_NAME_CHARS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Search,
    GetMappings,
    GetClusterHealth,
    ListIndices,
    ListIndicesDetailed,
    GetShards,
    GetNodesInfo,
    Esql,
}

impl Tool {
    pub const ALL: [Tool; 8] = [
        Tool::Search,
        Tool::GetMappings,
        Tool::GetClusterHealth,
        Tool::ListIndices,
        Tool::ListIndicesDetailed,
        Tool::GetShards,
        Tool::GetNodesInfo,
        Tool::Esql,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "search" => Some(Self::Search),
            "get_mappings" | "mapping" => Some(Self::GetMappings),
            "get_cluster_health" | "health" => Some(Self::GetClusterHealth),
            "list_indices" => Some(Self::ListIndices),
            "list_indices_detailed" => Some(Self::ListIndicesDetailed),
            "get_shards" => Some(Self::GetShards),
            "get_nodes_info" => Some(Self::GetNodesInfo),
            "esql" => Some(Self::Esql),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::GetMappings => "get_mappings",
            Self::GetClusterHealth => "get_cluster_health",
            Self::ListIndices => "list_indices",
            Self::ListIndicesDetailed => "list_indices_detailed",
            Self::GetShards => "get_shards",
            Self::GetNodesInfo => "get_nodes_info",
            Self::Esql => "esql",
        }
    }

    /// Tools whose request goes through the query clamp before dispatch.
    pub fn is_search_class(&self) -> bool {
        matches!(self, Self::Search)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestPhase {
    Received,
    Clamped,
    Dispatched,
    Shaped,
    Errored,
    Completed,
}

impl RequestPhase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Clamped => "clamped",
            Self::Dispatched => "dispatched",
            Self::Shaped => "shaped",
            Self::Errored => "errored",
            Self::Completed => "completed",
        }
    }
}

fn enter(trace_id: &str, operation: &str, phase: RequestPhase) {
    debug!(trace_id = %trace_id, tool = %operation, phase = phase.as_str(), "Tool call phase");
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub summary: String,
    pub payload: Value,
    pub truncated: bool,
}

/// Aborts the wrapped task when dropped, so an abandoned request stops its upstream call.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs `work` on its own task. A panic in `work` surfaces as `Internal` instead of
/// unwinding into the caller.
pub async fn isolate<T, F>(work: F, context: &ErrorContext) -> Result<T, NormalizedError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, NormalizedError>> + Send + 'static,
{
    let mut task = AbortOnDrop(tokio::spawn(work));
    match (&mut task.0).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(NormalizedError::internal(
            format!("tool task panicked: {err}"),
            context,
        )),
        Err(err) => Err(NormalizedError::internal(
            format!("tool task was cancelled: {err}"),
            context,
        )),
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: EsClient,
    policy: SizePolicy,
}

impl Dispatcher {
    pub fn new(client: EsClient, policy: SizePolicy) -> Self {
        Self { client, policy }
    }

    /// Routes one tool call. Exactly one result comes back per call.
    pub async fn dispatch(
        &self,
        name: &str,
        args: &Value,
        trace_id: &str,
    ) -> Result<ToolOutput, NormalizedError> {
        let start = Instant::now();
        let context = ErrorContext::new(name);
        enter(trace_id, name, RequestPhase::Received);

        let result = match Tool::parse(name) {
            Some(tool) => {
                let this = self.clone();
                let args = args.clone();
                let trace = trace_id.to_string();
                isolate(async move { this.run(tool, args, &trace).await }, &context).await
            }
            None => Err(NormalizedError::invalid_request(
                format!("Unknown tool: {name}"),
                &context,
            )),
        };

        match &result {
            Ok(output) => debug!(
                trace_id = %trace_id,
                tool = %name,
                truncated = output.truncated,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Tool call completed"
            ),
            Err(err) => {
                enter(trace_id, name, RequestPhase::Errored);
                err.log(trace_id);
            }
        }
        enter(trace_id, name, RequestPhase::Completed);

        result
    }

    async fn run(&self, tool: Tool, args: Value, trace_id: &str) -> Result<ToolOutput, NormalizedError> {
        let context = ErrorContext::new(tool.name());
        debug!(
            trace_id = %trace_id,
            tool = tool.name(),
            clamped = tool.is_search_class(),
            "Routing tool call"
        );
        let args = if args.is_null() {
            Value::Object(Map::new())
        } else {
            args
        };

        let output = match tool {
            Tool::Search => self.search(args, context, trace_id).await,
            Tool::GetMappings => self.get_mappings(args, context, trace_id).await,
            Tool::GetClusterHealth => self.cluster_health(args, context, trace_id).await,
            Tool::ListIndices => self.list_indices(args, context, trace_id).await,
            Tool::ListIndicesDetailed => self.list_indices_detailed(args, context, trace_id).await,
            Tool::GetShards => self.get_shards(args, context, trace_id).await,
            Tool::GetNodesInfo => self.get_nodes_info(context, trace_id).await,
            Tool::Esql => self.esql(args, context, trace_id).await,
        }?;

        enter(trace_id, tool.name(), RequestPhase::Shaped);
        Ok(output)
    }

    async fn search(
        &self,
        args: Value,
        context: ErrorContext,
        trace_id: &str,
    ) -> Result<ToolOutput, NormalizedError> {
        let params: SearchParams = parse_args(args, &context)?;
        let context = context.with_index(params.index.clone());
        let request = SearchRequest::from_params(params, &context)?;
        let clamped = clamp_search(&self.policy, request, &context)?;
        debug!(
            trace_id = %trace_id,
            index = %clamped.index,
            requested_size = ?clamped.requested_size,
            effective_size = clamped.effective_size,
            "Search clamped"
        );
        enter(trace_id, &context.operation, RequestPhase::Clamped);

        enter(trace_id, &context.operation, RequestPhase::Dispatched);
        let raw = self.client.search(&clamped, &context).await?;
        let shaped = shape_search(
            &self.policy,
            &raw,
            clamped.requested_size,
            clamped.effective_size,
        );

        let total = match shaped.total_relation {
            TotalRelation::Eq => shaped.total_available.to_string(),
            TotalRelation::Gte => format!("{}+", shaped.total_available),
        };
        let mut summary = format!("Total results: {total}, showing {}.", shaped.returned);
        if shaped.aggregations.is_some() {
            summary.push_str(" Aggregations included.");
        }
        if shaped.truncated {
            summary.push_str(" Results were truncated to fit response limits.");
        }

        Ok(ToolOutput {
            summary,
            truncated: shaped.truncated,
            payload: to_payload(&shaped, &context)?,
        })
    }

    async fn get_mappings(
        &self,
        args: Value,
        context: ErrorContext,
        trace_id: &str,
    ) -> Result<ToolOutput, NormalizedError> {
        let params: GetMappingsParams = parse_args(args, &context)?;
        let context = context.with_index(params.index.clone());
        validate_index_pattern(&params.index, &context)?;

        enter(trace_id, &context.operation, RequestPhase::Dispatched);
        let response = self.client.get_mapping(&params.index, &context).await?;
        let matched = response.len();
        let Some((index, entry)) = response.into_iter().next() else {
            return Err(NormalizedError::not_found(
                format!("Index not found: {}", params.index),
                &context,
            ));
        };

        let mappings = match entry {
            Value::Object(mut entry) => entry.remove("mappings").unwrap_or(Value::Object(entry)),
            other => other,
        };
        let bounded = bound_document(
            &self.policy,
            json!({
                "index": index,
                "indices_matched": matched,
                "mappings": mappings,
            }),
        );

        let name = summary_name(&index);
        let mut summary = format!("Mappings for index {name}.");
        if matched > 1 {
            summary = format!("Mappings for index {name} (first of {matched} matching indices).");
        }
        if bounded.truncated {
            summary.push_str(" Mapping was truncated to fit response limits.");
        }

        Ok(ToolOutput {
            summary,
            truncated: bounded.truncated,
            payload: to_payload(&bounded, &context)?,
        })
    }

    async fn cluster_health(
        &self,
        args: Value,
        context: ErrorContext,
        trace_id: &str,
    ) -> Result<ToolOutput, NormalizedError> {
        let params: ClusterHealthParams = parse_args(args, &context)?;
        if let Some(status) = &params.wait_for_status {
            validate_health_status(status, "wait_for_status", &context)?;
        }

        enter(trace_id, &context.operation, RequestPhase::Dispatched);
        let health = self.client.cluster_health(&params, &context).await?;
        let cluster = summary_name(
            health
                .get("cluster_name")
                .and_then(Value::as_str)
                .unwrap_or("unknown"),
        );
        let status = summary_name(health.get("status").and_then(Value::as_str).unwrap_or("unknown"));

        let bounded = bound_document(&self.policy, health);
        Ok(ToolOutput {
            summary: format!("Cluster {cluster} is {status}."),
            truncated: bounded.truncated,
            payload: to_payload(&bounded, &context)?,
        })
    }

    async fn list_indices(
        &self,
        args: Value,
        context: ErrorContext,
        trace_id: &str,
    ) -> Result<ToolOutput, NormalizedError> {
        let params: ListIndicesParams = parse_args(args, &context)?;
        let context = context.with_index(params.index_pattern.clone());
        validate_index_pattern(&params.index_pattern, &context)?;

        enter(trace_id, &context.operation, RequestPhase::Dispatched);
        let rows = self
            .client
            .cat(
                &format!("indices/{}", params.index_pattern),
                &[("h", "index,status,docs.count".to_string())],
                &context,
            )
            .await?;

        self.listing(rows, "indices", &context)
    }

    async fn list_indices_detailed(
        &self,
        args: Value,
        context: ErrorContext,
        trace_id: &str,
    ) -> Result<ToolOutput, NormalizedError> {
        let params: ListIndicesDetailedParams = parse_args(args, &context)?;
        let context = context.with_index(params.index_pattern.clone());
        validate_index_pattern(&params.index_pattern, &context)?;

        let mut query = vec![(
            "h",
            "index,health,status,pri,rep,docs.count,store.size,pri.store.size".to_string(),
        )];
        if let Some(health) = &params.health {
            validate_health_status(health, "health", &context)?;
            query.push(("health", health.clone()));
        }
        if let Some(sort) = params.sort_by.as_deref().filter(|s| !s.trim().is_empty()) {
            query.push(("s", sort.trim().to_string()));
        }

        enter(trace_id, &context.operation, RequestPhase::Dispatched);
        let rows = self
            .client
            .cat(&format!("indices/{}", params.index_pattern), &query, &context)
            .await?;

        self.listing(rows, "indices", &context)
    }

    async fn get_shards(
        &self,
        args: Value,
        context: ErrorContext,
        trace_id: &str,
    ) -> Result<ToolOutput, NormalizedError> {
        let params: GetShardsParams = parse_args(args, &context)?;
        let (endpoint, context) = match params.index.as_deref().filter(|i| !i.trim().is_empty()) {
            Some(index) => {
                let context = context.with_index(index);
                validate_index_pattern(index, &context)?;
                (format!("shards/{index}"), context)
            }
            None => ("shards".to_string(), context),
        };

        enter(trace_id, &context.operation, RequestPhase::Dispatched);
        let rows = self
            .client
            .cat(
                &endpoint,
                &[("h", "index,shard,prirep,state,docs,store,node".to_string())],
                &context,
            )
            .await?;

        self.listing(rows, "shards", &context)
    }

    async fn get_nodes_info(
        &self,
        context: ErrorContext,
        trace_id: &str,
    ) -> Result<ToolOutput, NormalizedError> {
        enter(trace_id, &context.operation, RequestPhase::Dispatched);
        let rows = self
            .client
            .cat(
                "nodes",
                &[(
                    "h",
                    "name,ip,heap.percent,ram.percent,cpu,load_1m,node.role,master".to_string(),
                )],
                &context,
            )
            .await?;

        self.listing(rows, "nodes", &context)
    }

    async fn esql(
        &self,
        args: Value,
        context: ErrorContext,
        trace_id: &str,
    ) -> Result<ToolOutput, NormalizedError> {
        let params: EsqlQueryParams = parse_args(args, &context)?;
        if params.query.trim().is_empty() {
            return Err(NormalizedError::invalid_request(
                "query must be a non-empty ES|QL statement",
                &context,
            ));
        }

        enter(trace_id, &context.operation, RequestPhase::Dispatched);
        let response = self.client.esql(&params.query, &context).await?;
        self.listing(response.into_rows(), "rows", &context)
    }

    fn listing(
        &self,
        rows: Vec<Value>,
        noun: &str,
        context: &ErrorContext,
    ) -> Result<ToolOutput, NormalizedError> {
        let shaped: ShapedList = shape_list(&self.policy, rows, self.policy.max_list_items());
        let mut summary = format!(
            "Found {} {noun}, showing {}.",
            shaped.total_available, shaped.returned
        );
        if shaped.truncated {
            summary.push_str(" List was truncated to fit response limits.");
        }

        Ok(ToolOutput {
            summary,
            truncated: shaped.truncated,
            payload: to_payload(&shaped, context)?,
        })
    }
}

fn parse_args<T: DeserializeOwned>(args: Value, context: &ErrorContext) -> Result<T, NormalizedError> {
    serde_json::from_value(args).map_err(|e| {
        NormalizedError::invalid_request(format!("Invalid arguments: {e}"), context)
    })
}

fn validate_health_status(
    value: &str,
    field: &str,
    context: &ErrorContext,
) -> Result<(), NormalizedError> {
    if HEALTH_STATUSES.contains(&value) {
        Ok(())
    } else {
        Err(NormalizedError::invalid_request(
            format!("{field} must be one of green, yellow, red (got {value:?})"),
            context,
        ))
    }
}

fn summary_name(name: &str) -> String {
    match name.char_indices().nth(MAX_SUMMARY_NAME_CHARS) {
        Some((cut, _)) => format!("{}...", &name[..cut]),
        None => name.to_string(),
    }
}

fn to_payload<T: serde::Serialize>(value: &T, context: &ErrorContext) -> Result<Value, NormalizedError> {
    serde_json::to_value(value)
        .map_err(|e| NormalizedError::internal(format!("failed to encode tool payload: {e}"), context))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wiremock::{
        matchers::{body_partial_json, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{
        errors::ErrorKind,
        es_client::EsConfig,
        policy::json_len,
        shaper::ShapedResponse,
    };

    fn dispatcher(server: &MockServer) -> Dispatcher {
        let mut config = EsConfig::new(server.uri());
        config.request_timeout = Duration::from_millis(500);
        Dispatcher::new(EsClient::new(&config).unwrap(), SizePolicy::default())
    }

    fn hits(count: usize, total: u64) -> Value {
        let hits: Vec<Value> = (0..count)
            .map(|i| {
                json!({
                    "_index": "test-safety-limits",
                    "_id": i.to_string(),
                    "_source": {"id": i, "message": "x".repeat(200)}
                })
            })
            .collect();
        json!({"took": 4, "hits": {"total": {"value": total, "relation": "eq"}, "hits": hits}})
    }

    #[test]
    fn tool_names_and_aliases_resolve() {
        for tool in Tool::ALL {
            assert_eq!(Tool::parse(tool.name()), Some(tool));
        }
        assert_eq!(Tool::parse("mapping"), Some(Tool::GetMappings));
        assert_eq!(Tool::parse("health"), Some(Tool::GetClusterHealth));
        assert_eq!(Tool::parse("delete_index"), None);
        assert!(Tool::Search.is_search_class());
        assert!(!Tool::GetMappings.is_search_class());
    }

    #[tokio::test]
    async fn oversized_search_is_clamped_before_dispatch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/test-safety-limits/_search"))
            .and(body_partial_json(json!({"size": 200})))
            .respond_with(ResponseTemplate::new(200).set_body_json(hits(200, 250)))
            .expect(1)
            .mount(&server)
            .await;

        let output = dispatcher(&server)
            .dispatch(
                "search",
                &json!({
                    "index": "test-safety-limits",
                    "query_body": {"query": {"match_all": {}}},
                    "size": 500
                }),
                "trace-1",
            )
            .await
            .unwrap();

        let shaped: ShapedResponse = serde_json::from_value(output.payload).unwrap();
        assert_eq!(shaped.hits.len(), 200);
        assert_eq!(shaped.effective_size, 200);
        assert_eq!(shaped.requested_size, Some(500));
        assert_eq!(shaped.total_available, 250);
        assert!(shaped.truncated);
        assert!(output.truncated);
        assert!(output.summary.starts_with("Total results: 250, showing 200."));
    }

    #[tokio::test]
    async fn small_search_is_not_truncated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/test-safety-limits/_search"))
            .and(body_partial_json(json!({"size": 10})))
            .respond_with(ResponseTemplate::new(200).set_body_json(hits(10, 250)))
            .mount(&server)
            .await;

        let output = dispatcher(&server)
            .dispatch(
                "search",
                &json!({"index": "test-safety-limits", "query_body": {}, "size": 10}),
                "trace-2",
            )
            .await
            .unwrap();

        assert!(!output.truncated);
        assert_eq!(output.payload["hits"].as_array().map(Vec::len), Some(10));
        assert_eq!(output.summary, "Total results: 250, showing 10.");
    }

    #[tokio::test]
    async fn unknown_tool_is_invalid_request() {
        let server = MockServer::start().await;
        let err = dispatcher(&server)
            .dispatch("drop_everything", &json!({}), "trace-3")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn missing_index_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/does-not-exist/_search"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"type": "index_not_found_exception", "reason": "no such index [does-not-exist]"},
                "status": 404
            })))
            .mount(&server)
            .await;

        let err = dispatcher(&server)
            .dispatch("search", &json!({"index": "does-not-exist"}), "trace-4")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.context().index.as_deref(), Some("does-not-exist"));
    }

    #[tokio::test]
    async fn timeout_does_not_poison_later_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/slow/_search"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(hits(1, 1))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/fast/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hits(3, 3)))
            .mount(&server)
            .await;

        let dispatcher = dispatcher(&server);
        let err = dispatcher
            .dispatch("search", &json!({"index": "slow"}), "trace-5")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let output = dispatcher
            .dispatch("search", &json!({"index": "fast"}), "trace-6")
            .await
            .unwrap();
        assert_eq!(output.payload["returned"], 3);
    }

    #[tokio::test]
    async fn bad_arguments_never_reach_the_cluster() {
        let server = MockServer::start().await;
        let dispatcher = dispatcher(&server);

        for (tool, args) in [
            ("search", json!({})),
            ("search", json!({"index": "logs", "size": -5})),
            ("search", json!({"index": "logs", "query_body": {"size": "lots"}})),
            ("search", json!({"index": "../etc"})),
            ("search", json!({"index": ".."})),
            ("search", json!({"index": "%2e%2e"})),
            ("get_mappings", json!({"index": "."})),
            ("list_indices", json!({"index_pattern": ".."})),
            ("get_shards", json!({"index": "%2e%2e"})),
            ("get_cluster_health", json!({"wait_for_status": "purple"})),
            ("list_indices_detailed", json!({"health": "orange"})),
            ("esql", json!({"query": "   "})),
        ] {
            let err = dispatcher.dispatch(tool, &args, "trace-7").await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidRequest, "{tool} {args}");
        }
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn listings_are_capped() {
        let server = MockServer::start().await;
        let rows: Vec<Value> = (0..150)
            .map(|i| json!({"index": format!("test-{i}"), "status": "open", "docs.count": "1"}))
            .collect();
        Mock::given(method("GET"))
            .and(path("/_cat/indices/test-*"))
            .and(query_param("h", "index,status,docs.count"))
            .respond_with(ResponseTemplate::new(200).set_body_json(rows))
            .mount(&server)
            .await;

        let output = dispatcher(&server)
            .dispatch("list_indices", &json!({"index_pattern": "test-*"}), "trace-8")
            .await
            .unwrap();
        assert!(output.truncated);
        assert_eq!(output.payload["items"].as_array().map(Vec::len), Some(100));
        assert_eq!(output.payload["total_available"], 150);
        assert!(output.summary.starts_with("Found 150 indices, showing 100."));
    }

    #[tokio::test]
    async fn wildcard_mapping_returns_first_match() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/logs-*/_mapping"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "logs-a": {"mappings": {"properties": {"message": {"type": "text"}}}},
                "logs-b": {"mappings": {"properties": {"host": {"type": "keyword"}}}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/empty/_mapping"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let dispatcher = dispatcher(&server);
        let output = dispatcher
            .dispatch("mapping", &json!({"index": "logs-*"}), "trace-9")
            .await
            .unwrap();
        assert_eq!(output.payload["document"]["index"], "logs-a");
        assert_eq!(output.payload["document"]["indices_matched"], 2);
        assert_eq!(
            output.payload["document"]["mappings"]["properties"]["message"]["type"],
            "text"
        );
        assert!(!output.truncated);

        let err = dispatcher
            .dispatch("get_mappings", &json!({"index": "empty"}), "trace-10")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn health_and_esql_are_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_cluster/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "cluster_name": "docker-cluster",
                "status": "yellow",
                "number_of_nodes": 1
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/_query"))
            .and(body_partial_json(json!({"query": "FROM logs | LIMIT 2"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "columns": [{"name": "host", "type": "keyword"}],
                "values": [["a"], ["b"]]
            })))
            .mount(&server)
            .await;

        let dispatcher = dispatcher(&server);
        let output = dispatcher
            .dispatch("health", &Value::Null, "trace-11")
            .await
            .unwrap();
        assert_eq!(output.summary, "Cluster docker-cluster is yellow.");
        assert_eq!(output.payload["document"]["number_of_nodes"], 1);

        let output = dispatcher
            .dispatch("esql", &json!({"query": "FROM logs | LIMIT 2"}), "trace-12")
            .await
            .unwrap();
        assert_eq!(output.payload["items"], json!([{"host": "a"}, {"host": "b"}]));
        assert!(json_len(&output.payload) <= SizePolicy::default().max_response_bytes());
    }

    async fn explode() -> Result<(), NormalizedError> {
        panic!("boom")
    }

    #[tokio::test]
    async fn panics_become_internal_errors() {
        let context = ErrorContext::new("search");
        let err = isolate(explode(), &context).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!err.message().contains("boom"));

        let ok = isolate(async { Ok::<_, NormalizedError>(7) }, &context).await;
        assert_eq!(ok.unwrap(), 7);
    }

    #[tokio::test]
    async fn dropping_the_caller_aborts_the_task() {
        let (alive, gone) = tokio::sync::oneshot::channel::<()>();
        let context = ErrorContext::new("search");
        let call = isolate(
            async move {
                let _alive = alive;
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, NormalizedError>(())
            },
            &context,
        );

        assert!(tokio::time::timeout(Duration::from_millis(50), call).await.is_err());
        // The task's future, and with it the sender, is dropped once the abort lands.
        let closed = tokio::time::timeout(Duration::from_secs(2), gone).await;
        assert!(matches!(closed, Ok(Err(_))));
    }

    #[tokio::test]
    async fn abandoned_search_releases_the_caller() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/slow/_search"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(hits(1, 1))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/fast/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(hits(2, 2)))
            .mount(&server)
            .await;

        let mut config = EsConfig::new(server.uri());
        config.request_timeout = Duration::from_secs(10);
        let dispatcher = Dispatcher::new(EsClient::new(&config).unwrap(), SizePolicy::default());

        let start = Instant::now();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(300),
            dispatcher.dispatch("search", &json!({"index": "slow"}), "trace-13"),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(start.elapsed() < Duration::from_secs(2));

        let output = dispatcher
            .dispatch("search", &json!({"index": "fast"}), "trace-14")
            .await
            .unwrap();
        assert_eq!(output.payload["returned"], 2);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn summary_names_are_bounded() {
        assert_eq!(summary_name("docker-cluster"), "docker-cluster");
        let long = summary_name(&"c".repeat(5000));
        assert_eq!(long.chars().count(), MAX_SUMMARY_NAME_CHARS + 3);
    }
}
