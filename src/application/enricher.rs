//! Secondary-entity resolution: users, contacts and pipeline metadata.

use std::{
    collections::{HashMap, HashSet},
    num::NonZeroUsize,
};

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::domain::entities::{ContactRecord, ContactRef, Identified, PipelineRecord, UserRecord};

use super::paginator::Paginator;
use super::upstream::{
    CONTACTS_ENDPOINT, PIPELINES_ENDPOINT, USERS_ENDPOINT, UpstreamQuery, decode_items,
};

/// Secondary entities keyed by upstream id, rebuilt every refresh cycle.
///
/// A missing key is an expected state, not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupMap<V> {
    entries: HashMap<i64, V>,
}

impl<V> Default for LookupMap<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<V> FromIterator<(i64, V)> for LookupMap<V> {
    fn from_iter<I: IntoIterator<Item = (i64, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<V> LookupMap<V> {
    pub fn get(&self, id: i64) -> Option<&V> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Display attributes of one pipeline status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusInfo {
    pub pipeline_id: i64,
    pub pipeline_name: Option<String>,
    pub status_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineMaps {
    pub pipelines: LookupMap<String>,
    pub statuses: LookupMap<StatusInfo>,
}

impl PipelineMaps {
    pub fn from_records(records: &[PipelineRecord]) -> Self {
        let pipelines = records
            .iter()
            .filter_map(|pipeline| pipeline.name.clone().map(|name| (pipeline.id, name)))
            .collect();

        let statuses = records
            .iter()
            .flat_map(|pipeline| {
                pipeline.statuses().iter().map(|status| {
                    (
                        status.id,
                        StatusInfo {
                            pipeline_id: pipeline.id,
                            pipeline_name: pipeline.name.clone(),
                            status_name: status.name.clone(),
                        },
                    )
                })
            })
            .collect();

        Self {
            pipelines,
            statuses,
        }
    }
}

pub struct Enricher {
    paginator: Paginator,
    chunk_size: NonZeroUsize,
}

impl Enricher {
    pub fn new(paginator: Paginator, chunk_size: NonZeroUsize) -> Self {
        Self {
            paginator,
            chunk_size,
        }
    }

    /// Resolve `ids` through batched `id[N]` lookups.
    ///
    /// Ids are deduplicated and split into chunks of the configured size; a
    /// failed chunk only leaves its ids unresolved.
    pub async fn build_lookup<T>(
        &self,
        endpoint: &str,
        entity: &str,
        ids: impl IntoIterator<Item = i64>,
    ) -> LookupMap<T>
    where
        T: DeserializeOwned + Identified,
    {
        let unique = dedup_ids(ids);
        let mut entries = HashMap::with_capacity(unique.len());

        for chunk in unique.chunks(self.chunk_size.get()) {
            let query = UpstreamQuery::with_ids(chunk);
            match self.fetch_once(endpoint, &query).await {
                Some(body) => {
                    for record in decode_items::<T>(&body, entity) {
                        entries.insert(record.id(), record);
                    }
                }
                None => continue,
            }
        }

        debug!(
            target = "leadcache::enricher",
            endpoint,
            requested = unique.len(),
            resolved = entries.len(),
            "lookup built"
        );

        LookupMap { entries }
    }

    pub async fn contacts(&self, ids: impl IntoIterator<Item = i64>) -> LookupMap<ContactRecord> {
        self.build_lookup(CONTACTS_ENDPOINT, "contacts", ids).await
    }

    /// Every user's display name. Users missing a name are left out.
    pub async fn users(&self) -> LookupMap<String> {
        let collection = self
            .paginator
            .fetch_all::<UserRecord>(USERS_ENDPOINT, "users", &UpstreamQuery::new())
            .await;
        if collection.incomplete {
            warn!(
                target = "leadcache::enricher",
                resolved = collection.records.len(),
                "user directory only partially fetched"
            );
        }

        collection
            .records
            .into_iter()
            .filter_map(|user| user.name.map(|name| (user.id, name)))
            .collect()
    }

    pub async fn pipelines(&self) -> PipelineMaps {
        match self
            .fetch_once(PIPELINES_ENDPOINT, &UpstreamQuery::new())
            .await
        {
            Some(body) => {
                PipelineMaps::from_records(&decode_items::<PipelineRecord>(&body, "pipelines"))
            }
            None => PipelineMaps::default(),
        }
    }

    async fn fetch_once(
        &self,
        endpoint: &str,
        query: &UpstreamQuery,
    ) -> Option<serde_json::Value> {
        match self.paginator.upstream().fetch(endpoint, query).await {
            Ok(body) => Some(body),
            Err(err) => {
                warn!(
                    target = "leadcache::enricher",
                    endpoint,
                    error = %err,
                    "lookup call failed; affected ids stay unresolved"
                );
                None
            }
        }
    }
}

/// Distinct ids in first-seen order.
pub fn dedup_ids(ids: impl IntoIterator<Item = i64>) -> Vec<i64> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

/// The reference flagged as main, else the first one.
pub fn primary_ref(refs: &[ContactRef]) -> Option<&ContactRef> {
    refs.iter().find(|candidate| candidate.is_main).or(refs.first())
}

/// Resolve the primary related entity of a record through `lookup`.
pub fn resolve_primary<'a, V>(refs: &[ContactRef], lookup: &'a LookupMap<V>) -> Option<&'a V> {
    primary_ref(refs).and_then(|chosen| lookup.get(chosen.id))
}
