use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;

use crate::{
    application::error::HttpError,
    cache::{RefreshCoordinator, RefreshOutcome},
    domain::{rows::FlatRow, types::DatasetKind},
};

use super::HttpState;

#[derive(Debug, Default, Deserialize)]
pub(super) struct ReadParams {
    format: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadFormat {
    Array,
    Envelope,
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(with = "time::serde::rfc3339::option")]
    last_update: Option<OffsetDateTime>,
    total: usize,
    truncated: bool,
    data: &'a [FlatRow],
}

pub(super) async fn health() -> Response {
    Json(json!({ "ok": true })).into_response()
}

pub(super) async fn dataset_rows(
    State(state): State<HttpState>,
    Path(dataset): Path<String>,
    Query(params): Query<ReadParams>,
) -> Result<Response, HttpError> {
    let format = parse_format(params.format.as_deref())?;
    let coordinator = resolve_dataset(&state, &dataset)?;
    let snapshot = coordinator.serve().await;

    let response = match format {
        ReadFormat::Array => Json(&snapshot.rows).into_response(),
        ReadFormat::Envelope => Json(Envelope {
            last_update: snapshot.built_at,
            total: snapshot.len(),
            truncated: snapshot.truncated,
            data: &snapshot.rows,
        })
        .into_response(),
    };
    Ok(response)
}

pub(super) async fn refresh_dataset(
    State(state): State<HttpState>,
    Path(dataset): Path<String>,
) -> Result<Response, HttpError> {
    let coordinator = resolve_dataset(&state, &dataset)?;

    match coordinator.trigger_refresh().await {
        RefreshOutcome::Completed { rows } => {
            Ok(Json(json!({ "ok": true, "rows": rows })).into_response())
        }
        RefreshOutcome::Skipped => Err(HttpError::new(
            "infra::http::refresh_dataset",
            StatusCode::CONFLICT,
            "Refresh already running",
            format!("A refresh of `{}` is already in progress", coordinator.kind()),
        )),
        RefreshOutcome::Failed(err) => Err(HttpError::from(err)),
    }
}

pub(super) async fn dataset_status(
    State(state): State<HttpState>,
    Path(dataset): Path<String>,
) -> Result<Response, HttpError> {
    let coordinator = resolve_dataset(&state, &dataset)?;
    Ok(Json(coordinator.status()).into_response())
}

/// Unknown names and disabled datasets look the same to clients.
fn resolve_dataset(state: &HttpState, name: &str) -> Result<Arc<RefreshCoordinator>, HttpError> {
    let not_found = |detail: String| {
        HttpError::new(
            "infra::http::resolve_dataset",
            StatusCode::NOT_FOUND,
            "Unknown dataset",
            detail,
        )
    };

    let kind = name
        .parse::<DatasetKind>()
        .map_err(|err| not_found(err.to_string()))?;
    state
        .coordinator(kind)
        .cloned()
        .ok_or_else(|| not_found(format!("dataset `{kind}` is disabled")))
}

fn parse_format(value: Option<&str>) -> Result<ReadFormat, HttpError> {
    match value.map(str::trim).unwrap_or("").to_ascii_lowercase().as_str() {
        "" | "array" => Ok(ReadFormat::Array),
        "envelope" => Ok(ReadFormat::Envelope),
        other => Err(HttpError::new(
            "infra::http::parse_format",
            StatusCode::BAD_REQUEST,
            "Unknown format",
            format!("Format `{other}` is not recognised"),
        )),
    }
}
