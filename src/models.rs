use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

//----- Elasticsearch responses

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub took: Option<u64>,
    #[serde(default)]
    pub timed_out: bool,
    pub hits: Hits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregations: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hits {
    #[serde(default)]
    pub total: Option<TotalHits>,
    pub hits: Vec<Value>,
}

/// `hits.total` is an object since 7.x and a bare number before that.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TotalHits {
    Object {
        value: u64,
        #[serde(default)]
        relation: TotalRelation,
    },
    Count(u64),
}

impl TotalHits {
    pub fn value(&self) -> u64 {
        match self {
            Self::Object { value, .. } | Self::Count(value) => *value,
        }
    }

    pub fn relation(&self) -> TotalRelation {
        match self {
            Self::Object { relation, .. } => *relation,
            Self::Count(_) => TotalRelation::Eq,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TotalRelation {
    #[default]
    Eq,
    Gte,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsqlColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsqlQueryResponse {
    #[serde(default)]
    pub is_partial: Option<bool>,
    pub columns: Vec<EsqlColumn>,
    pub values: Vec<Vec<Value>>,
}

impl EsqlQueryResponse {
    /// One object per row, keyed by column name.
    pub fn into_rows(self) -> Vec<Value> {
        let columns = self.columns;
        self.values
            .into_iter()
            .map(|row| {
                let mut obj = Map::new();
                for (column, value) in columns.iter().zip(row) {
                    obj.insert(column.name.clone(), value);
                }
                Value::Object(obj)
            })
            .collect()
    }
}

/// `GET <index>/_mapping` answers with one entry per matched index.
pub type MappingResponse = Map<String, Value>;

//----- Tool arguments

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub index: String,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    /// Object, or a JSON string holding one.
    #[serde(default, alias = "query")]
    pub query_body: Option<Value>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct GetMappingsParams {
    pub index: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClusterHealthParams {
    #[serde(default)]
    pub wait_for_status: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListIndicesParams {
    pub index_pattern: String,
}

#[derive(Debug, Deserialize)]
pub struct ListIndicesDetailedParams {
    #[serde(default = "default_index_pattern")]
    pub index_pattern: String,
    #[serde(default)]
    pub health: Option<String>,
    #[serde(default)]
    pub sort_by: Option<String>,
}

fn default_index_pattern() -> String {
    "*".to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct GetShardsParams {
    #[serde(default)]
    pub index: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EsqlQueryParams {
    pub query: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn total_hits_accepts_both_shapes() {
        let modern: TotalHits = serde_json::from_value(json!({"value": 250, "relation": "gte"})).unwrap();
        assert_eq!(modern.value(), 250);
        assert_eq!(modern.relation(), TotalRelation::Gte);

        let legacy: TotalHits = serde_json::from_value(json!(42)).unwrap();
        assert_eq!(legacy.value(), 42);
        assert_eq!(legacy.relation(), TotalRelation::Eq);
    }

    #[test]
    fn search_result_tolerates_missing_optional_sections() {
        let parsed: SearchResult = serde_json::from_value(json!({"hits": {"hits": []}})).unwrap();
        assert!(parsed.hits.total.is_none());
        assert!(parsed.aggregations.is_none());
        assert!(!parsed.timed_out);
    }

    #[test]
    fn esql_rows_are_keyed_by_column() {
        let response: EsqlQueryResponse = serde_json::from_value(json!({
            "columns": [{"name": "host", "type": "keyword"}, {"name": "count", "type": "long"}],
            "values": [["a", 1], ["b", 2]]
        }))
        .unwrap();
        let rows = response.into_rows();
        assert_eq!(rows, vec![json!({"host": "a", "count": 1}), json!({"host": "b", "count": 2})]);
    }

    #[test]
    fn search_params_accept_query_alias() {
        let params: SearchParams =
            serde_json::from_value(json!({"index": "logs", "query": {"size": 5}})).unwrap();
        assert_eq!(params.query_body, Some(json!({"size": 5})));
        assert!(params.size.is_none());
    }
}
