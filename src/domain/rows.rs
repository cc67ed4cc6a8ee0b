//! The served, denormalized row.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Number;

/// Column names owned by [`FlatRow`]; custom field keys may not shadow them.
pub const FIXED_COLUMNS: &[&str] = &[
    "id",
    "name",
    "price",
    "pipeline_id",
    "pipeline_name",
    "status_id",
    "status_name",
    "responsible_user_id",
    "responsible_user_name",
    "created_at",
    "updated_at",
    "closed_at",
    "contact_id",
    "contact_name",
];

/// One lead joined with its pipeline, status, responsible user and primary
/// contact. Custom fields are flattened into the same JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatRow {
    pub id: i64,
    pub name: Option<String>,
    pub price: Number,
    pub pipeline_id: Option<i64>,
    pub pipeline_name: String,
    pub status_id: Option<i64>,
    pub status_name: String,
    pub responsible_user_id: Option<i64>,
    pub responsible_user_name: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub closed_at: Option<String>,
    pub contact_id: Option<i64>,
    pub contact_name: Option<String>,
    #[serde(flatten)]
    pub custom_fields: BTreeMap<String, Option<String>>,
}

pub fn is_fixed_column(key: &str) -> bool {
    FIXED_COLUMNS.contains(&key)
}
