//! Raw lead + lookups → served row.

use std::collections::{BTreeMap, HashMap};

use chrono_tz::Tz;
use serde_json::{Number, Value};

use crate::domain::entities::{ContactRecord, CustomFieldValue, RawLead};
use crate::domain::rows::{FlatRow, is_fixed_column};
use crate::util::timezone::format_epoch;

use super::enricher::{LookupMap, PipelineMaps, resolve_primary};

pub const UNKNOWN: &str = "unknown";
pub const UNASSIGNED: &str = "unassigned";
pub const CONTACT_FIELD_PREFIX: &str = "contact_";

/// Everything a refresh cycle resolved about secondary entities.
#[derive(Debug, Clone, Default)]
pub struct Lookups {
    pub users: LookupMap<String>,
    pub contacts: LookupMap<ContactRecord>,
    pub pipelines: PipelineMaps,
}

#[derive(Debug, Clone)]
pub struct Flattener {
    tz: Tz,
    status_overrides: HashMap<i64, String>,
}

impl Flattener {
    pub fn new(tz: Tz, status_overrides: HashMap<i64, String>) -> Self {
        Self {
            tz,
            status_overrides,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Denormalize one lead. Pure: the same inputs always yield the same row.
    pub fn flatten(&self, lead: &RawLead, lookups: &Lookups) -> FlatRow {
        let contact = resolve_primary(lead.contact_refs(), &lookups.contacts);

        let mut custom_fields = normalize_custom_fields(lead.custom_fields(), "");
        if let Some(contact) = contact {
            for (key, value) in normalize_custom_fields(contact.custom_fields(), CONTACT_FIELD_PREFIX)
            {
                custom_fields.entry(key).or_insert(value);
            }
        }

        FlatRow {
            id: lead.id,
            name: lead.name.clone(),
            price: lead.price.clone().unwrap_or_else(|| Number::from(0)),
            pipeline_id: lead.pipeline_id,
            pipeline_name: self.pipeline_name(lead, &lookups.pipelines),
            status_id: lead.status_id,
            status_name: self.status_name(lead.status_id, &lookups.pipelines),
            responsible_user_id: lead.responsible_user_id,
            responsible_user_name: lead
                .responsible_user_id
                .and_then(|id| lookups.users.get(id))
                .cloned()
                .unwrap_or_else(|| UNASSIGNED.to_string()),
            created_at: format_epoch(lead.created_at, self.tz),
            updated_at: format_epoch(lead.updated_at, self.tz),
            closed_at: format_epoch(lead.closed_at, self.tz),
            contact_id: contact.map(|contact| contact.id),
            contact_name: contact.and_then(|contact| contact.name.clone()),
            custom_fields,
        }
    }

    fn status_name(&self, status_id: Option<i64>, maps: &PipelineMaps) -> String {
        let Some(status_id) = status_id else {
            return UNKNOWN.to_string();
        };
        self.status_overrides
            .get(&status_id)
            .cloned()
            .or_else(|| {
                maps.statuses
                    .get(status_id)
                    .and_then(|info| info.status_name.clone())
            })
            .unwrap_or_else(|| UNKNOWN.to_string())
    }

    fn pipeline_name(&self, lead: &RawLead, maps: &PipelineMaps) -> String {
        lead.pipeline_id
            .and_then(|id| maps.pipelines.get(id).cloned())
            .or_else(|| {
                lead.status_id
                    .and_then(|id| maps.statuses.get(id))
                    .filter(|info| Some(info.pipeline_id) == lead.pipeline_id)
                    .and_then(|info| info.pipeline_name.clone())
            })
            .unwrap_or_else(|| UNKNOWN.to_string())
    }
}

/// One key per descriptor: `prefix` + field name (or `field_<id>`), valued
/// with its non-empty values joined by `", "`, or null when none remain.
pub fn normalize_custom_fields(
    fields: &[CustomFieldValue],
    prefix: &str,
) -> BTreeMap<String, Option<String>> {
    let mut normalized = BTreeMap::new();

    for field in fields {
        let Some(label) = field_label(field) else {
            continue;
        };
        let key = format!("{prefix}{label}");
        if is_fixed_column(&key) {
            continue;
        }

        let parts: Vec<String> = field
            .values
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|entry| value_text(&entry.value))
            .collect();
        let joined = (!parts.is_empty()).then(|| parts.join(", "));

        normalized.insert(key, joined);
    }

    normalized
}

fn field_label(field: &CustomFieldValue) -> Option<String> {
    match field.field_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => Some(name.to_string()),
        _ => field.field_id.map(|id| format!("field_{id}")),
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(text) if text.is_empty() => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(true) => Some("true".to_string()),
        Value::Number(number) => Some(number.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::enricher::StatusInfo;
    use crate::domain::entities::{ContactRef, CustomFieldEntry, LeadEmbedded};
    use serde_json::json;

    fn field(name: Option<&str>, id: Option<i64>, values: Vec<Value>) -> CustomFieldValue {
        CustomFieldValue {
            field_id: id,
            field_name: name.map(str::to_string),
            values: Some(
                values
                    .into_iter()
                    .map(|value| CustomFieldEntry { value })
                    .collect(),
            ),
        }
    }

    fn lead() -> RawLead {
        serde_json::from_value(json!({
            "id": 10,
            "name": "Website form",
            "price": 1500,
            "pipeline_id": 7,
            "status_id": 70,
            "responsible_user_id": 3,
            "created_at": 1700000000,
            "updated_at": 0,
            "custom_fields_values": [
                { "field_name": "Origin", "values": [{ "value": "Ads" }, { "value": "" }] }
            ],
            "_embedded": { "contacts": [{ "id": 5, "is_main": false }, { "id": 6, "is_main": true }] }
        }))
        .expect("lead")
    }

    fn lookups() -> Lookups {
        let contact: ContactRecord = serde_json::from_value(json!({
            "id": 6,
            "name": "Maria",
            "custom_fields_values": [
                { "field_name": "Phone", "values": [{ "value": "+55 11 9999" }] }
            ]
        }))
        .expect("contact");

        Lookups {
            users: [(3, "Ana".to_string())].into_iter().collect(),
            contacts: [(6, contact)].into_iter().collect(),
            pipelines: PipelineMaps {
                pipelines: [(7, "Sales".to_string())].into_iter().collect(),
                statuses: [(
                    70,
                    StatusInfo {
                        pipeline_id: 7,
                        pipeline_name: Some("Sales".into()),
                        status_name: Some("Qualified".into()),
                    },
                )]
                .into_iter()
                .collect(),
            },
        }
    }

    fn flattener() -> Flattener {
        Flattener::new(chrono_tz::America::Sao_Paulo, HashMap::new())
    }

    #[test]
    fn joins_every_lookup() {
        let row = flattener().flatten(&lead(), &lookups());

        assert_eq!(row.pipeline_name, "Sales");
        assert_eq!(row.status_name, "Qualified");
        assert_eq!(row.responsible_user_name, "Ana");
        assert_eq!(row.price, Number::from(1500));
        assert_eq!(row.created_at.as_deref(), Some("2023-11-14 19:13:20"));
        assert_eq!(row.updated_at, None);
        assert_eq!(row.contact_id, Some(6));
        assert_eq!(row.contact_name.as_deref(), Some("Maria"));
        assert_eq!(row.custom_fields["Origin"].as_deref(), Some("Ads"));
        assert_eq!(
            row.custom_fields["contact_Phone"].as_deref(),
            Some("+55 11 9999")
        );
    }

    #[test]
    fn flatten_is_idempotent() {
        let flattener = flattener();
        let (lead, lookups) = (lead(), lookups());
        assert_eq!(
            flattener.flatten(&lead, &lookups),
            flattener.flatten(&lead, &lookups)
        );
    }

    #[test]
    fn override_table_wins_over_fetched_status() {
        let flattener = Flattener::new(
            chrono_tz::UTC,
            HashMap::from([(70, "Lead - Qualificado".to_string())]),
        );
        let row = flattener.flatten(&lead(), &lookups());
        assert_eq!(row.status_name, "Lead - Qualificado");
        assert_eq!(row.created_at.as_deref(), Some("2023-11-14 22:13:20"));
    }

    #[test]
    fn unresolved_joins_use_sentinels() {
        let mut bare = lead();
        bare.price = None;
        bare.embedded = Some(LeadEmbedded { contacts: vec![] });

        let row = flattener().flatten(&bare, &Lookups::default());

        assert_eq!(row.pipeline_name, UNKNOWN);
        assert_eq!(row.status_name, UNKNOWN);
        assert_eq!(row.responsible_user_name, UNASSIGNED);
        assert_eq!(row.price, Number::from(0));
        assert_eq!(row.contact_id, None);
        assert_eq!(row.contact_name, None);
    }

    #[test]
    fn contact_reference_without_lookup_entry_leaves_contact_empty() {
        let mut orphan = lead();
        orphan.embedded = Some(LeadEmbedded {
            contacts: vec![ContactRef { id: 99, is_main: true }],
        });
        let row = flattener().flatten(&orphan, &lookups());
        assert_eq!(row.contact_id, None);
        assert!(!row.custom_fields.contains_key("contact_Phone"));
    }

    #[test]
    fn custom_field_values_are_joined_or_null() {
        let fields = [
            field(Some("Tags"), None, vec![json!("a"), json!(null), json!("b")]),
            field(Some("Empty"), None, vec![json!(""), json!(false)]),
            field(None, Some(321), vec![json!(0)]),
            field(Some("Flag"), None, vec![json!(true)]),
        ];

        let normalized = normalize_custom_fields(&fields, "");

        assert_eq!(normalized["Tags"].as_deref(), Some("a, b"));
        assert_eq!(normalized["Empty"], None);
        assert_eq!(normalized["field_321"].as_deref(), Some("0"));
        assert_eq!(normalized["Flag"].as_deref(), Some("true"));
    }

    #[test]
    fn custom_fields_cannot_shadow_fixed_columns() {
        let fields = [
            field(Some("price"), None, vec![json!("999")]),
            field(Some("id"), None, vec![json!("x")]),
            field(Some("Budget"), None, vec![json!("10")]),
        ];
        let normalized = normalize_custom_fields(&fields, "");
        assert_eq!(normalized.len(), 1);
        assert!(normalized.contains_key("Budget"));
    }

    #[test]
    fn nameless_fields_without_id_are_skipped() {
        let fields = [field(None, None, vec![json!("x")])];
        assert!(normalize_custom_fields(&fields, "contact_").is_empty());
    }
}
