//! One full rebuild of a dataset: collect, enrich, filter, flatten.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use time::OffsetDateTime;
use tracing::{info, instrument};

use crate::domain::entities::RawLead;
use crate::domain::rows::FlatRow;
use crate::domain::types::DatasetKind;
use crate::util::timezone::start_of_day;

use super::enricher::{Enricher, primary_ref};
use super::error::BuildError;
use super::flatten::{Flattener, Lookups};
use super::paginator::{Paginator, month_windows};
use super::upstream::{LEADS_ENDPOINT, UpstreamQuery};

/// Rows ready to be published, plus whether a page ceiling cut them short.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuiltRows {
    pub rows: Vec<FlatRow>,
    pub truncated: bool,
}

/// Anything able to produce a fresh row set for a dataset.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn build(&self) -> Result<BuiltRows, BuildError>;
}

/// What a dataset collects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetPlan {
    pub kind: DatasetKind,
    pub created_from: NaiveDate,
    /// Keep only leads in one of these statuses; empty keeps everything.
    pub status_ids: Vec<i64>,
}

impl DatasetPlan {
    fn accepts(&self, lead: &RawLead) -> bool {
        self.status_ids.is_empty()
            || lead
                .status_id
                .is_some_and(|status| self.status_ids.contains(&status))
    }
}

pub struct LeadPipeline {
    plan: DatasetPlan,
    paginator: Paginator,
    enricher: Arc<Enricher>,
    flattener: Arc<Flattener>,
}

impl LeadPipeline {
    /// `paginator` carries the dataset's own page ceiling.
    pub fn new(
        plan: DatasetPlan,
        paginator: Paginator,
        enricher: Arc<Enricher>,
        flattener: Arc<Flattener>,
    ) -> Self {
        Self {
            plan,
            paginator,
            enricher,
            flattener,
        }
    }
}

#[async_trait]
impl RowSource for LeadPipeline {
    #[instrument(skip(self), fields(dataset = %self.plan.kind))]
    async fn build(&self) -> Result<BuiltRows, BuildError> {
        let tz = self.flattener.timezone();
        let from = start_of_day(self.plan.created_from, tz).ok_or_else(|| {
            BuildError::InvalidWindow(format!(
                "{} has no local midnight in {tz}",
                self.plan.created_from
            ))
        })?;
        let windows = month_windows(from, OffsetDateTime::now_utc().unix_timestamp(), tz);
        let base = UpstreamQuery::new().param("with", "contacts");

        let (primary, users, pipelines) = tokio::join!(
            self.paginator
                .fetch_windows::<RawLead>(LEADS_ENDPOINT, "leads", &base, &windows),
            self.enricher.users(),
            self.enricher.pipelines(),
        );

        if primary.incomplete {
            return Err(BuildError::UpstreamUnavailable { stage: "leads" });
        }

        let fetched = primary.records.len();
        let leads: Vec<RawLead> = primary
            .records
            .into_iter()
            .filter(|lead| self.plan.accepts(lead))
            .collect();

        let contact_ids = leads
            .iter()
            .filter_map(|lead| primary_ref(lead.contact_refs()).map(|chosen| chosen.id));
        let contacts = self.enricher.contacts(contact_ids).await;

        let lookups = Lookups {
            users,
            contacts,
            pipelines,
        };
        let rows: Vec<FlatRow> = leads
            .iter()
            .map(|lead| self.flattener.flatten(lead, &lookups))
            .collect();

        info!(
            target = "leadcache::pipeline",
            dataset = %self.plan.kind,
            windows = windows.len(),
            pages = primary.pages,
            fetched,
            rows = rows.len(),
            truncated = primary.truncated,
            "dataset rebuilt"
        );

        Ok(BuiltRows {
            rows,
            truncated: primary.truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        num::{NonZeroU32, NonZeroUsize},
    };

    use serde_json::{Value, json};

    use super::*;
    use crate::application::fakes::{FakeUpstream, envelope};
    use crate::application::upstream::{
        CONTACTS_ENDPOINT, PIPELINES_ENDPOINT, USERS_ENDPOINT, UpstreamError,
    };
    use crate::domain::types::WON_STATUS_ID;

    const TZ: chrono_tz::Tz = chrono_tz::UTC;

    fn created_from() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).expect("date")
    }

    fn lead_payloads() -> Vec<Value> {
        let created = start_of_day(created_from(), TZ).expect("start") + 3_600;
        vec![
            json!({
                "id": 1, "name": "open", "status_id": 70, "pipeline_id": 7,
                "responsible_user_id": 3, "created_at": created,
                "_embedded": { "contacts": [{ "id": 50, "is_main": true }] }
            }),
            json!({
                "id": 2, "name": "won", "status_id": WON_STATUS_ID, "pipeline_id": 7,
                "created_at": created + 60,
                "_embedded": { "contacts": [{ "id": 51 }, { "id": 52 }] }
            }),
        ]
    }

    /// Answers like the CRM: leads only inside the window that contains them.
    fn crm(fail_leads: bool) -> Arc<FakeUpstream> {
        Arc::new(FakeUpstream::new(move |endpoint, query| match endpoint {
            LEADS_ENDPOINT if fail_leads => Err(UpstreamError::Status {
                endpoint: endpoint.to_string(),
                status: 503,
            }),
            LEADS_ENDPOINT => {
                let bound = |key: &str| {
                    query
                        .get(key)
                        .and_then(|value| value.parse::<i64>().ok())
                        .unwrap_or_default()
                };
                let (from, to) = (
                    bound("filter[created_at][from]"),
                    bound("filter[created_at][to]"),
                );
                let inside = lead_payloads()
                    .into_iter()
                    .filter(|lead| {
                        let created = lead["created_at"].as_i64().unwrap_or_default();
                        from <= created && created <= to
                    })
                    .collect();
                Ok(envelope("leads", inside))
            }
            USERS_ENDPOINT => Ok(envelope("users", vec![json!({ "id": 3, "name": "Ana" })])),
            PIPELINES_ENDPOINT => Ok(envelope(
                "pipelines",
                vec![json!({
                    "id": 7, "name": "Sales",
                    "_embedded": { "statuses": [{ "id": 70, "name": "Qualified" }] }
                })],
            )),
            CONTACTS_ENDPOINT => {
                let contacts = (0..query.id_count())
                    .filter_map(|idx| query.get(&format!("id[{idx}]")))
                    .map(|id| json!({ "id": id.parse::<i64>().unwrap_or_default(), "name": format!("contact {id}") }))
                    .collect();
                Ok(envelope("contacts", contacts))
            }
            _ => Ok(Value::Null),
        }))
    }

    fn pipeline(upstream: Arc<FakeUpstream>, status_ids: Vec<i64>) -> LeadPipeline {
        let paginator = Paginator::new(
            upstream,
            NonZeroU32::new(250).expect("page size"),
            NonZeroU32::new(5).expect("max pages"),
        );
        let enricher = Enricher::new(paginator.clone(), NonZeroUsize::new(40).expect("chunk"));
        let flattener = Flattener::new(
            TZ,
            HashMap::from([(WON_STATUS_ID, "Lead - Convertido".to_string())]),
        );
        LeadPipeline::new(
            DatasetPlan {
                kind: DatasetKind::Leads,
                created_from: created_from(),
                status_ids,
            },
            paginator,
            Arc::new(enricher),
            Arc::new(flattener),
        )
    }

    #[tokio::test]
    async fn builds_enriched_rows_from_every_window() {
        let upstream = crm(false);

        let built = pipeline(upstream.clone(), Vec::new())
            .build()
            .await
            .expect("build");

        assert_eq!(built.rows.len(), 2);
        assert!(!built.truncated);

        let open = &built.rows[0];
        assert_eq!(open.status_name, "Qualified");
        assert_eq!(open.pipeline_name, "Sales");
        assert_eq!(open.responsible_user_name, "Ana");
        assert_eq!(open.contact_name.as_deref(), Some("contact 50"));

        let won = &built.rows[1];
        assert_eq!(won.status_name, "Lead - Convertido");
        assert_eq!(won.contact_id, Some(51));
        assert_eq!(won.responsible_user_name, "unassigned");

        let lead_calls = upstream.calls_to(LEADS_ENDPOINT);
        assert!(lead_calls.len() > 1, "one call per month window");
        assert!(lead_calls.iter().all(|call| call.get("with") == Some("contacts")));
    }

    #[tokio::test]
    async fn only_primary_contacts_are_looked_up() {
        let upstream = crm(false);
        pipeline(upstream.clone(), Vec::new())
            .build()
            .await
            .expect("build");

        let lookups = upstream.calls_to(CONTACTS_ENDPOINT);
        assert_eq!(lookups.len(), 1);
        assert_eq!(lookups[0].id_count(), 2);
    }

    #[tokio::test]
    async fn status_filter_keeps_only_closed_leads() {
        let built = pipeline(crm(false), vec![WON_STATUS_ID])
            .build()
            .await
            .expect("build");

        assert_eq!(built.rows.len(), 1);
        assert_eq!(built.rows[0].id, 2);
    }

    #[tokio::test]
    async fn failed_primary_collection_fails_the_build() {
        let result = pipeline(crm(true), Vec::new()).build().await;
        assert_eq!(
            result,
            Err(BuildError::UpstreamUnavailable { stage: "leads" })
        );
    }
}
