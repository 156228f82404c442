use serde_json::{Map, Value};

use crate::{
    errors::{ErrorContext, NormalizedError},
    models::SearchParams,
    policy::SizePolicy,
};

// Characters Elasticsearch refuses in index names; they would also break the request path.
const FORBIDDEN_INDEX_CHARS: &[char] = &['\\', '/', '?', '"', '<', '>', '|', '#', ' ', '%'];

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub index: String,
    pub query_body: Map<String, Value>,
    pub size: Option<u64>,
    pub fields: Option<Vec<String>>,
}

impl SearchRequest {
    pub fn from_params(params: SearchParams, context: &ErrorContext) -> Result<Self, NormalizedError> {
        let query_body = match params.query_body {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            // Some clients send the query DSL as a JSON-encoded string.
            Some(Value::String(raw)) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                _ => {
                    return Err(NormalizedError::invalid_request(
                        "query_body string must contain a JSON object",
                        context,
                    ))
                }
            },
            Some(_) => {
                return Err(NormalizedError::invalid_request(
                    "query_body must be a JSON object",
                    context,
                ))
            }
        };

        Ok(Self {
            index: params.index,
            query_body,
            size: params.size,
            fields: params.fields,
        })
    }
}

/// The only form of a search that is ever sent downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct ClampedSearch {
    pub index: String,
    pub body: Map<String, Value>,
    pub requested_size: Option<u64>,
    pub effective_size: u64,
}

pub fn validate_index_pattern(index: &str, context: &ErrorContext) -> Result<(), NormalizedError> {
    if index.trim().is_empty() {
        return Err(NormalizedError::invalid_request(
            "index must be a non-empty index name or pattern",
            context,
        ));
    }

    if let Some(bad) = index.chars().find(|c| FORBIDDEN_INDEX_CHARS.contains(c)) {
        return Err(NormalizedError::invalid_request(
            format!("index contains forbidden character {bad:?}"),
            context,
        ));
    }

    // Dot segments would be resolved away in the request path.
    if index.split(',').any(|name| matches!(name.trim(), "." | "..")) {
        return Err(NormalizedError::invalid_request(
            format!("index must not be a dot segment (got {index:?})"),
            context,
        ));
    }

    Ok(())
}

pub fn clamp_search(
    policy: &SizePolicy,
    request: SearchRequest,
    context: &ErrorContext,
) -> Result<ClampedSearch, NormalizedError> {
    validate_index_pattern(&request.index, context)?;

    let SearchRequest {
        index,
        mut query_body,
        size,
        fields,
    } = request;

    let body_size = match query_body.get("size") {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.as_u64().ok_or_else(|| {
            NormalizedError::invalid_request(
                "query_body.size must be a non-negative integer",
                context,
            )
        })?),
    };

    let requested_size = size.or(body_size);
    let effective_size = policy.clamp_size(requested_size);
    query_body.insert("size".to_string(), Value::from(effective_size));

    if let Some(fields) = fields.filter(|f| !f.is_empty()) {
        merge_source_fields(&mut query_body, fields);
    }

    Ok(ClampedSearch {
        index,
        body: query_body,
        requested_size,
        effective_size,
    })
}

fn merge_source_fields(body: &mut Map<String, Value>, fields: Vec<String>) {
    let source = body.entry("_source").or_insert(Value::Null);
    let list = match source {
        Value::Object(source) => source.entry("includes").or_insert(Value::Null),
        other => other,
    };

    match list {
        Value::Array(_) => {}
        Value::String(single) => {
            let single = std::mem::take(single);
            *list = Value::Array(vec![Value::String(single)]);
        }
        // `false`, `null` or anything else is replaced by the projection.
        _ => *list = Value::Array(Vec::new()),
    }

    if let Value::Array(values) = list {
        for field in fields {
            let field = Value::String(field);
            if !values.contains(&field) {
                values.push(field);
            }
        }
    }
}
