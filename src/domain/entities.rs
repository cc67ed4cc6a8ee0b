//! Upstream records as delivered by the CRM API.
//!
//! Only the attributes the cache actually reads are modelled; everything else
//! in the payload is ignored during decoding.

use serde::Deserialize;
use serde_json::{Number, Value};

/// Primary record: one lead.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawLead {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub price: Option<Number>,
    #[serde(default)]
    pub pipeline_id: Option<i64>,
    #[serde(default)]
    pub status_id: Option<i64>,
    #[serde(default)]
    pub responsible_user_id: Option<i64>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
    #[serde(default)]
    pub closed_at: Option<i64>,
    #[serde(default)]
    pub custom_fields_values: Option<Vec<CustomFieldValue>>,
    #[serde(default, rename = "_embedded")]
    pub embedded: Option<LeadEmbedded>,
}

impl RawLead {
    pub fn contact_refs(&self) -> &[ContactRef] {
        self.embedded
            .as_ref()
            .map(|embedded| embedded.contacts.as_slice())
            .unwrap_or_default()
    }

    pub fn custom_fields(&self) -> &[CustomFieldValue] {
        self.custom_fields_values.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct LeadEmbedded {
    #[serde(default)]
    pub contacts: Vec<ContactRef>,
}

/// Reference from a lead to one of its contacts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContactRef {
    pub id: i64,
    #[serde(default)]
    pub is_main: bool,
}

/// One custom field descriptor with its (possibly multiple) values.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CustomFieldValue {
    #[serde(default)]
    pub field_id: Option<i64>,
    #[serde(default)]
    pub field_name: Option<String>,
    #[serde(default)]
    pub values: Option<Vec<CustomFieldEntry>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CustomFieldEntry {
    #[serde(default)]
    pub value: Value,
}

/// Secondary record joined onto leads through [`ContactRef`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContactRecord {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub custom_fields_values: Option<Vec<CustomFieldValue>>,
}

impl ContactRecord {
    pub fn custom_fields(&self) -> &[CustomFieldValue] {
        self.custom_fields_values.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PipelineRecord {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub statuses: Option<Vec<StatusRecord>>,
    #[serde(default, rename = "_embedded")]
    pub embedded: Option<PipelineEmbedded>,
}

impl PipelineRecord {
    /// Statuses are nested under `_embedded` by the v4 API; older payloads
    /// carry them inline.
    pub fn statuses(&self) -> &[StatusRecord] {
        match self.embedded.as_ref() {
            Some(embedded) if !embedded.statuses.is_empty() => &embedded.statuses,
            _ => self.statuses.as_deref().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct PipelineEmbedded {
    #[serde(default)]
    pub statuses: Vec<StatusRecord>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusRecord {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
}

/// Anything that can be keyed into a lookup map by its upstream id.
pub trait Identified {
    fn id(&self) -> i64;
}

impl Identified for ContactRecord {
    fn id(&self) -> i64 {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lead_decodes_with_sparse_payload() {
        let lead: RawLead = serde_json::from_value(json!({ "id": 7 })).expect("lead");
        assert_eq!(lead.id, 7);
        assert!(lead.contact_refs().is_empty());
        assert!(lead.custom_fields().is_empty());
    }

    #[test]
    fn lead_decodes_embedded_contacts() {
        let lead: RawLead = serde_json::from_value(json!({
            "id": 1,
            "price": 1500,
            "_embedded": { "contacts": [{ "id": 10 }, { "id": 11, "is_main": true }] }
        }))
        .expect("lead");
        assert_eq!(lead.contact_refs().len(), 2);
        assert!(lead.contact_refs()[1].is_main);
        assert_eq!(lead.price, Some(Number::from(1500)));
    }

    #[test]
    fn pipeline_prefers_embedded_statuses() {
        let pipeline: PipelineRecord = serde_json::from_value(json!({
            "id": 3,
            "name": "Sales",
            "statuses": [{ "id": 1, "name": "inline" }],
            "_embedded": { "statuses": [{ "id": 2, "name": "embedded" }] }
        }))
        .expect("pipeline");
        assert_eq!(pipeline.statuses().len(), 1);
        assert_eq!(pipeline.statuses()[0].id, 2);
    }
}
