use std::{process, sync::Arc, time::Duration};

use leadcache::{
    application::{
        enricher::Enricher,
        error::AppError,
        flatten::Flattener,
        paginator::Paginator,
        pipeline::{DatasetPlan, LeadPipeline},
        upstream::Upstream,
    },
    cache::{CacheConfig, RefreshCoordinator, RefreshOutcome, SnapshotFiles, SnapshotStore},
    config,
    domain::types::DatasetKind,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        telemetry,
        upstream::{HttpUpstream, UpstreamConfig},
    },
};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Refresh(args) => run_refresh(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cache_config = CacheConfig::from(&settings.cache);
    let coordinators = build_coordinators(&settings, &cache_config).await?;

    if cache_config.refresh_on_startup {
        for coordinator in &coordinators {
            let coordinator = Arc::clone(coordinator);
            tokio::spawn(async move {
                let outcome = coordinator.refresh_now().await;
                log_outcome(coordinator.kind(), "startup", &outcome);
            });
        }
    }

    let schedule_handle = cache_config.refresh_interval.map(|period| {
        let coordinators = coordinators.clone();
        tokio::spawn(async move {
            let mut interval = refresh_schedule(period);
            interval.tick().await; // Skip the first immediate tick
            loop {
                interval.tick().await;
                for coordinator in &coordinators {
                    let outcome = coordinator.trigger_refresh().await;
                    log_outcome(coordinator.kind(), "schedule", &outcome);
                }
            }
        })
    });

    let result = serve_http(&settings, HttpState::new(coordinators)).await;

    if let Some(handle) = schedule_handle {
        handle.abort();
        let _ = handle.await;
    }

    result
}

/// Ticks every `period`; a build outlasting the period delays the next tick
/// instead of triggering a burst of catch-up refreshes.
fn refresh_schedule(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn run_refresh(
    settings: config::Settings,
    args: config::RefreshArgs,
) -> Result<(), AppError> {
    let cache_config = CacheConfig::from(&settings.cache);
    let coordinators = build_coordinators(&settings, &cache_config).await?;

    let selected: Vec<_> = match args.dataset {
        Some(kind) => {
            let found: Vec<_> = coordinators
                .into_iter()
                .filter(|coordinator| coordinator.kind() == kind)
                .collect();
            if found.is_empty() {
                return Err(AppError::from(InfraError::configuration(format!(
                    "dataset `{kind}` is disabled"
                ))));
            }
            found
        }
        None => coordinators,
    };

    for coordinator in selected {
        let outcome = coordinator.refresh_now().await;
        log_outcome(coordinator.kind(), "cli", &outcome);
        match outcome {
            RefreshOutcome::Completed { .. } => {}
            RefreshOutcome::Failed(err) => return Err(AppError::from(err)),
            RefreshOutcome::Skipped => {
                return Err(AppError::unexpected(format!(
                    "refresh of `{}` was skipped",
                    coordinator.kind()
                )));
            }
        }
    }

    Ok(())
}

/// Wire one coordinator per enabled dataset, hydrated from its snapshot.
async fn build_coordinators(
    settings: &config::Settings,
    cache_config: &CacheConfig,
) -> Result<Vec<Arc<RefreshCoordinator>>, AppError> {
    let upstream_config = UpstreamConfig::try_from(&settings.upstream)?;
    let upstream: Arc<dyn Upstream> = Arc::new(HttpUpstream::new(upstream_config)?);

    let paginator = Paginator::new(
        upstream,
        settings.upstream.page_size,
        settings.datasets.leads.max_pages,
    );
    let enricher = Arc::new(Enricher::new(
        paginator.clone(),
        settings.upstream.id_chunk_size,
    ));
    let flattener = Arc::new(Flattener::new(
        settings.flatten.timezone,
        settings.flatten.status_overrides.clone(),
    ));

    let mut coordinators = Vec::new();
    for kind in settings.datasets.enabled() {
        let dataset = settings.datasets.get(kind);

        let files = SnapshotFiles::new(cache_config.rows_path(kind), cache_config.meta_path(kind));
        let store = Arc::new(SnapshotStore::new(kind, files));
        store.load().await;

        let plan = DatasetPlan {
            kind,
            created_from: dataset.created_from,
            status_ids: dataset.status_ids.clone(),
        };
        let pipeline = LeadPipeline::new(
            plan,
            paginator.with_max_pages(dataset.max_pages),
            Arc::clone(&enricher),
            Arc::clone(&flattener),
        );

        coordinators.push(Arc::new(RefreshCoordinator::new(store, Arc::new(pipeline))));
    }

    if coordinators.is_empty() {
        warn!(target = "leadcache::startup", "no dataset is enabled");
    }

    Ok(coordinators)
}

fn log_outcome(kind: DatasetKind, trigger: &'static str, outcome: &RefreshOutcome) {
    match outcome {
        RefreshOutcome::Completed { rows } => info!(
            target = "leadcache::refresh",
            dataset = %kind,
            trigger,
            rows,
            "dataset refreshed"
        ),
        RefreshOutcome::Skipped => info!(
            target = "leadcache::refresh",
            dataset = %kind,
            trigger,
            "refresh skipped; another build is running"
        ),
        RefreshOutcome::Failed(err) => warn!(
            target = "leadcache::refresh",
            dataset = %kind,
            trigger,
            error = %err,
            "refresh failed"
        ),
    }
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "leadcache::startup",
        addr = %settings.server.addr,
        "listening"
    );

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(
            target = "leadcache::startup",
            error = %err,
            "failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
    info!(target = "leadcache::startup", "shutdown signal received");
}
