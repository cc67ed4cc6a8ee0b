//! Upstream port: the fetch primitive every collector goes through.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub const LEADS_ENDPOINT: &str = "/api/v4/leads";
pub const USERS_ENDPOINT: &str = "/api/v4/users";
pub const PIPELINES_ENDPOINT: &str = "/api/v4/leads/pipelines";
pub const CONTACTS_ENDPOINT: &str = "/api/v4/contacts";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request to `{endpoint}` failed: {message}")]
    Transport { endpoint: String, message: String },
    #[error("`{endpoint}` answered with status {status}")]
    Status { endpoint: String, status: u16 },
    #[error("`{endpoint}` returned an undecodable body: {message}")]
    Decode { endpoint: String, message: String },
    #[error("invalid upstream url: {0}")]
    Url(String),
}

impl UpstreamError {
    pub fn transport(endpoint: &str, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        }
    }

    pub fn decode(endpoint: &str, err: impl std::fmt::Display) -> Self {
        Self::Decode {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        }
    }
}

/// Query string for one upstream call, kept as ordered pairs so repeated and
/// bracketed keys (`id[0]`, `filter[created_at][from]`) survive untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamQuery {
    pairs: Vec<(String, String)>,
}

impl UpstreamQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.pairs.push((key.into(), value.to_string()));
        self
    }

    /// Restrict to records created inside `[from, to]` (epoch seconds, inclusive).
    pub fn created_between(self, from: i64, to: i64) -> Self {
        self.param("filter[created_at][from]", from)
            .param("filter[created_at][to]", to)
    }

    /// Batched lookup by id using indexed parameters.
    pub fn with_ids(ids: &[i64]) -> Self {
        ids.iter()
            .enumerate()
            .fold(Self::new(), |query, (idx, id)| {
                query.param(format!("id[{idx}]"), id)
            })
    }

    /// Copy of this query addressed at one page.
    pub fn page(&self, limit: u32, page: u32) -> Self {
        self.clone().param("limit", limit).param("page", page)
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, value)| value.as_str())
    }

    /// Number of `id[N]` parameters carried by this query.
    pub fn id_count(&self) -> usize {
        self.pairs
            .iter()
            .filter(|(key, _)| key.starts_with("id["))
            .count()
    }
}

/// Transport-agnostic fetch of one upstream resource.
///
/// Implementations own throttling and retries. An `Err` means the call gave up;
/// callers degrade it to "no data from this call".
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, endpoint: &str, query: &UpstreamQuery) -> Result<Value, UpstreamError>;
}

/// Items of `_embedded.<entity>`; anything else yields an empty slice.
pub fn embedded_items<'a>(body: &'a Value, entity: &str) -> &'a [Value] {
    body.get("_embedded")
        .and_then(|embedded| embedded.get(entity))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Decode every embedded item on its own so one malformed record does not
/// discard the rest of its page.
pub fn decode_items<T: DeserializeOwned>(body: &Value, entity: &str) -> Vec<T> {
    embedded_items(body, entity)
        .iter()
        .filter_map(|item| match T::deserialize(item) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!(
                    target = "leadcache::upstream",
                    entity,
                    error = %err,
                    "skipping malformed upstream record"
                );
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_become_indexed_parameters() {
        let query = UpstreamQuery::with_ids(&[5, 9]);
        assert_eq!(query.get("id[0]"), Some("5"));
        assert_eq!(query.get("id[1]"), Some("9"));
        assert_eq!(query.id_count(), 2);
    }

    #[test]
    fn page_keeps_filters() {
        let query = UpstreamQuery::new()
            .created_between(10, 20)
            .param("with", "contacts")
            .page(250, 3);
        assert_eq!(query.get("filter[created_at][from]"), Some("10"));
        assert_eq!(query.get("filter[created_at][to]"), Some("20"));
        assert_eq!(query.get("limit"), Some("250"));
        assert_eq!(query.get("page"), Some("3"));
    }

    #[test]
    fn embedded_items_tolerates_missing_envelope() {
        assert!(embedded_items(&json!({}), "leads").is_empty());
        assert!(embedded_items(&json!({ "_embedded": { "leads": {} } }), "leads").is_empty());
        assert_eq!(
            embedded_items(&json!({ "_embedded": { "leads": [1, 2] } }), "leads").len(),
            2
        );
    }

    #[test]
    fn malformed_items_are_skipped() {
        #[derive(serde::Deserialize)]
        struct Item {
            #[allow(dead_code)]
            id: i64,
        }

        let body = json!({ "_embedded": { "leads": [{ "id": 1 }, { "id": "x" }, { "id": 3 }] } });
        let items: Vec<Item> = decode_items(&body, "leads");
        assert_eq!(items.len(), 2);
    }
}
