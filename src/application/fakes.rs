//! Scripted upstream used by unit tests across the application layer.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::upstream::{Upstream, UpstreamError, UpstreamQuery};

type Responder = dyn Fn(&str, &UpstreamQuery) -> Result<Value, UpstreamError> + Send + Sync;

pub(crate) struct FakeUpstream {
    responder: Box<Responder>,
    calls: Mutex<Vec<(String, UpstreamQuery)>>,
}

impl FakeUpstream {
    pub(crate) fn new(
        responder: impl Fn(&str, &UpstreamQuery) -> Result<Value, UpstreamError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<(String, UpstreamQuery)> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn calls_to(&self, endpoint: &str) -> Vec<UpstreamQuery> {
        self.calls()
            .into_iter()
            .filter(|(called, _)| called == endpoint)
            .map(|(_, query)| query)
            .collect()
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn fetch(&self, endpoint: &str, query: &UpstreamQuery) -> Result<Value, UpstreamError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((endpoint.to_string(), query.clone()));
        (self.responder)(endpoint, query)
    }
}

/// `_embedded.<entity>` envelope around `items`.
pub(crate) fn envelope(entity: &str, items: Vec<Value>) -> Value {
    json!({ "_embedded": { entity: items } })
}

/// `count` minimal lead payloads with ids starting at `first_id`.
pub(crate) fn leads(first_id: i64, count: usize) -> Vec<Value> {
    (0..count as i64)
        .map(|offset| json!({ "id": first_id + offset }))
        .collect()
}

pub(crate) fn query_page(query: &UpstreamQuery) -> u32 {
    query
        .get("page")
        .and_then(|page| page.parse().ok())
        .unwrap_or(1)
}
