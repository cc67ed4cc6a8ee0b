//! HTTP surface: one read, refresh and status route per dataset.

mod handlers;
mod middleware;

use std::{collections::HashMap, sync::Arc};

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use crate::{cache::RefreshCoordinator, domain::types::DatasetKind};

use middleware::{log_responses, set_request_context};

#[derive(Clone, Default)]
pub struct HttpState {
    datasets: Arc<HashMap<DatasetKind, Arc<RefreshCoordinator>>>,
}

impl HttpState {
    pub fn new(coordinators: impl IntoIterator<Item = Arc<RefreshCoordinator>>) -> Self {
        let datasets = coordinators
            .into_iter()
            .map(|coordinator| (coordinator.kind(), coordinator))
            .collect();
        Self {
            datasets: Arc::new(datasets),
        }
    }

    pub fn coordinator(&self, kind: DatasetKind) -> Option<&Arc<RefreshCoordinator>> {
        self.datasets.get(&kind)
    }
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/{dataset}", get(handlers::dataset_rows))
        .route("/{dataset}/refresh", post(handlers::refresh_dataset))
        .route("/{dataset}/status", get(handlers::dataset_status))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
