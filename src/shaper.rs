use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    models::{SearchResult, TotalRelation},
    policy::{embedded_len, escaped_len, SizePolicy},
};

// Serialized as the final member of `ShapedResponse` when aggregations are present.
const AGGREGATIONS_KEY: &str = r#","aggregations":"#;

/// What the shaper removed. Everything zero/false means the payload is the upstream answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationReport {
    /// The requested size was lowered and more results existed than were fetched.
    pub size_clamped: bool,
    pub dropped_over_limit: usize,
    pub fields_truncated: usize,
    pub dropped_over_budget: usize,
    pub aggregations_omitted: bool,
}

impl TruncationReport {
    pub fn any(&self) -> bool {
        self.size_clamped
            || self.dropped_over_limit > 0
            || self.fields_truncated > 0
            || self.dropped_over_budget > 0
            || self.aggregations_omitted
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapedResponse {
    pub total_available: u64,
    pub total_relation: TotalRelation,
    pub requested_size: Option<u64>,
    pub effective_size: u64,
    pub returned: usize,
    pub truncated: bool,
    pub truncation: TruncationReport,
    pub hits: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregations: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapedList {
    pub total_available: usize,
    pub returned: usize,
    pub truncated: bool,
    pub truncation: TruncationReport,
    pub items: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundedDocument {
    pub truncated: bool,
    pub fields_truncated: usize,
    pub entries_omitted: usize,
    pub document: Value,
}

/// Bounds a search answer. `raw` is read, never modified.
pub fn shape_search(
    policy: &SizePolicy,
    raw: &SearchResult,
    requested_size: Option<u64>,
    effective_size: u64,
) -> ShapedResponse {
    let upstream = raw.hits.hits.len();
    let keep = upstream.min(usize::try_from(effective_size).unwrap_or(usize::MAX));

    let (total_available, total_relation) = match &raw.hits.total {
        Some(total) => (total.value(), total.relation()),
        None => (upstream as u64, TotalRelation::Eq),
    };

    let candidate = ShapedResponse {
        total_available,
        total_relation,
        requested_size,
        effective_size,
        returned: keep,
        truncated: false,
        truncation: TruncationReport {
            size_clamped: requested_size.is_some_and(|requested| requested > effective_size)
                && total_available > keep as u64,
            dropped_over_limit: upstream - keep,
            ..TruncationReport::default()
        },
        hits: raw.hits.hits[..keep].to_vec(),
        aggregations: raw.aggregations.clone(),
    };

    reshape(policy, candidate)
}

/// Enforces the size, field and byte bounds on `next`. A no-op for an answer already shaped
/// under the same policy.
pub fn reshape(policy: &SizePolicy, mut next: ShapedResponse) -> ShapedResponse {
    let limit = usize::try_from(next.effective_size).unwrap_or(usize::MAX);
    if next.hits.len() > limit {
        next.truncation.dropped_over_limit += next.hits.len() - limit;
        next.hits.truncate(limit);
    }

    next.truncation.fields_truncated += next
        .hits
        .iter_mut()
        .map(|hit| policy.truncate_strings(hit))
        .sum::<usize>();
    if let Some(aggs) = next.aggregations.as_mut() {
        next.truncation.fields_truncated += policy.truncate_strings(aggs);
    }

    enforce_response_budget(policy, next)
}

fn enforce_response_budget(policy: &SizePolicy, mut shaped: ShapedResponse) -> ShapedResponse {
    let budget = policy.payload_budget();

    let aggregations = shaped.aggregations.take();
    let aggregations_len = aggregations
        .as_ref()
        .map(|aggs| embedded_len(aggs).saturating_add(escaped_len(AGGREGATIONS_KEY.as_bytes())))
        .unwrap_or(0);

    let mut hits = std::mem::take(&mut shaped.hits);
    let candidates = hits.len();
    let already_dropped = shaped.truncation.dropped_over_budget;

    let dropped = fit_items(&mut hits, budget, |keep| {
        let mut skeleton = shaped.clone();
        skeleton.returned = keep;
        skeleton.truncation.dropped_over_budget = already_dropped + (candidates - keep);
        skeleton.truncated = skeleton.truncation.any();
        embedded_len(&skeleton).saturating_add(aggregations_len)
    });

    shaped.truncation.dropped_over_budget += dropped;
    shaped.hits = hits;
    shaped.aggregations = aggregations;
    shaped.returned = shaped.hits.len();
    shaped.truncated = shaped.truncation.any();

    while embedded_len(&shaped) > budget {
        if shaped.hits.pop().is_some() {
            shaped.truncation.dropped_over_budget += 1;
        } else if shaped.aggregations.take().is_some() {
            shaped.truncation.aggregations_omitted = true;
        } else {
            break;
        }
        shaped.returned = shaped.hits.len();
        shaped.truncated = shaped.truncation.any();
    }

    shaped
}

/// Bounds a listing (cat APIs, ES|QL rows) the same way hits are bounded.
pub fn shape_list(policy: &SizePolicy, mut items: Vec<Value>, limit: usize) -> ShapedList {
    let total_available = items.len();
    let mut report = TruncationReport::default();

    if items.len() > limit {
        report.dropped_over_limit = items.len() - limit;
        items.truncate(limit);
    }

    report.fields_truncated = items
        .iter_mut()
        .map(|item| policy.truncate_strings(item))
        .sum();

    let mut shaped = ShapedList {
        total_available,
        returned: items.len(),
        truncated: report.any(),
        truncation: report,
        items: Vec::new(),
    };

    let budget = policy.payload_budget();
    let candidates = items.len();
    let dropped = fit_items(&mut items, budget, |keep| {
        let mut skeleton = shaped.clone();
        skeleton.returned = keep;
        skeleton.truncation.dropped_over_budget = candidates - keep;
        skeleton.truncated = skeleton.truncation.any();
        embedded_len(&skeleton)
    });

    shaped.truncation.dropped_over_budget = dropped;
    shaped.items = items;
    shaped.returned = shaped.items.len();
    shaped.truncated = shaped.truncation.any();

    while embedded_len(&shaped) > budget && shaped.items.pop().is_some() {
        shaped.truncation.dropped_over_budget += 1;
        shaped.returned = shaped.items.len();
        shaped.truncated = true;
    }

    shaped
}

/// Bounds a free-form document (mappings, cluster health). Oversized strings are cut first,
/// then the heaviest entries are removed until the document fits.
pub fn bound_document(policy: &SizePolicy, mut document: Value) -> BoundedDocument {
    let fields_truncated = policy.truncate_strings(&mut document);
    let mut bounded = BoundedDocument {
        truncated: fields_truncated > 0,
        fields_truncated,
        entries_omitted: 0,
        document,
    };

    let budget = policy.payload_budget();
    if embedded_len(&bounded) <= budget {
        return bounded;
    }

    // Measured with the widest possible counter so the pruned document always fits.
    let mut document = std::mem::take(&mut bounded.document);
    bounded.truncated = true;
    bounded.entries_omitted = usize::MAX;
    let envelope = embedded_len(&bounded).saturating_sub(embedded_len(&Value::Null));
    let allowance = budget.saturating_sub(envelope);

    let mut omitted = 0;
    let len = embedded_len(&document);
    if fit_value(&mut document, len, allowance, &mut omitted) > allowance {
        document = Value::Null;
        omitted += 1;
    }

    bounded.document = document;
    bounded.entries_omitted = omitted;
    bounded
}

/// Shrinks `value` (currently `len` bytes) to at most `allowance` bytes by removing the
/// heaviest entries first. Each child is measured once; the running length is kept
/// arithmetically. Returns the new length.
fn fit_value(value: &mut Value, len: usize, allowance: usize, omitted: &mut usize) -> usize {
    if len <= allowance {
        return len;
    }

    match value {
        Value::Array(items) => {
            let (len, removed) = {
                let mut children: Vec<(usize, &mut Value)> =
                    items.iter_mut().map(|item| (0, item)).collect();
                fit_children(&mut children, len, allowance, omitted)
            };
            let mut removed = removed.into_iter();
            items.retain(|_| !removed.next().unwrap_or(false));
            len
        }
        Value::Object(map) => {
            let (len, removed) = {
                // `"key":` precedes every member.
                let mut children: Vec<(usize, &mut Value)> = map
                    .iter_mut()
                    .map(|(key, child)| (embedded_len(key.as_str()) + 1, child))
                    .collect();
                fit_children(&mut children, len, allowance, omitted)
            };
            let mut removed = removed.into_iter();
            map.retain(|_, _| !removed.next().unwrap_or(false));
            len
        }
        _ => len,
    }
}

/// `children` pairs each member's fixed overhead with its value. Returns the new length of the
/// container and which members to remove.
fn fit_children(
    children: &mut [(usize, &mut Value)],
    mut len: usize,
    allowance: usize,
    omitted: &mut usize,
) -> (usize, Vec<bool>) {
    let sizes: Vec<usize> = children.iter().map(|(_, child)| embedded_len(&**child)).collect();
    let mut order: Vec<usize> = (0..children.len()).collect();
    order.sort_by_key(|&idx| std::cmp::Reverse(children[idx].0 + sizes[idx]));

    let mut removed = vec![false; children.len()];
    let mut remaining = children.len();
    for idx in order {
        if len <= allowance {
            break;
        }
        let overshoot = len - allowance;
        let (overhead, child) = &mut children[idx];
        let mut child_len = sizes[idx];

        // Small excesses only cost small entries: descend while the child alone is larger.
        if child_len > overshoot && is_non_empty_container(child) {
            let shrunk = fit_value(child, child_len, child_len - overshoot, omitted);
            len -= child_len - shrunk;
            child_len = shrunk;
            if len <= allowance {
                break;
            }
        }

        let separator = usize::from(remaining > 1);
        len = len.saturating_sub(*overhead + child_len + separator);
        removed[idx] = true;
        remaining -= 1;
        *omitted += 1;
    }

    (len, removed)
}

fn is_non_empty_container(value: &Value) -> bool {
    match value {
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => false,
    }
}

/// Drops trailing items until `envelope_len(kept) + items` fits in `budget`. `envelope_len`
/// measures everything except the items themselves for a given kept count.
fn fit_items<F>(items: &mut Vec<Value>, budget: usize, mut envelope_len: F) -> usize
where
    F: FnMut(usize) -> usize,
{
    let sizes: Vec<usize> = items.iter().map(embedded_len).collect();
    let mut body = sizes
        .iter()
        .fold(0usize, |acc, len| acc.saturating_add(*len))
        .saturating_add(sizes.len().saturating_sub(1));

    let mut keep = items.len();
    while keep > 0 && envelope_len(keep).saturating_add(body) > budget {
        keep -= 1;
        let separator = usize::from(keep > 0);
        body = body.saturating_sub(sizes[keep] + separator);
    }

    let dropped = items.len() - keep;
    items.truncate(keep);
    dropped
}
