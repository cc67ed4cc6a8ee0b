//! Single-flight refresh of one dataset and stale-while-revalidate reads.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use metrics::{counter, histogram};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::application::error::BuildError;
use crate::application::pipeline::RowSource;
use crate::domain::types::DatasetKind;

use super::store::{CacheSnapshot, SnapshotStore};

const METRIC_REFRESH_TOTAL: &str = "leadcache_refresh_total";
const METRIC_REFRESH_MS: &str = "leadcache_refresh_ms";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Idle,
    Running,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// Another build held the slot; this request was dropped.
    Skipped,
    Completed { rows: usize },
    Failed(BuildError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetStatus {
    pub dataset: DatasetKind,
    pub state: BuildState,
    pub rows: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_update: Option<OffsetDateTime>,
    pub truncated: bool,
}

struct Slot {
    running: AtomicBool,
    /// Bumped every time a build releases the slot.
    finished: watch::Sender<u64>,
}

/// Proof of holding the build slot. Dropping it releases the slot, including
/// when the build task panics.
struct SlotGuard {
    slot: Arc<Slot>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slot.running.store(false, Ordering::Release);
        self.slot.finished.send_modify(|generation| *generation += 1);
    }
}

pub struct RefreshCoordinator {
    kind: DatasetKind,
    store: Arc<SnapshotStore>,
    source: Arc<dyn RowSource>,
    slot: Arc<Slot>,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<SnapshotStore>, source: Arc<dyn RowSource>) -> Self {
        let (finished, _) = watch::channel(0);
        Self {
            kind: store.kind(),
            store,
            source,
            slot: Arc::new(Slot {
                running: AtomicBool::new(false),
                finished,
            }),
        }
    }

    pub fn kind(&self) -> DatasetKind {
        self.kind
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn state(&self) -> BuildState {
        if self.slot.running.load(Ordering::Acquire) {
            BuildState::Running
        } else {
            BuildState::Idle
        }
    }

    pub fn status(&self) -> DatasetStatus {
        let snapshot = self.store.get();
        DatasetStatus {
            dataset: self.kind,
            state: self.state(),
            rows: snapshot.len(),
            last_update: snapshot.built_at,
            truncated: snapshot.truncated,
        }
    }

    /// Run one build unless another is already running.
    pub async fn trigger_refresh(self: &Arc<Self>) -> RefreshOutcome {
        match self.claim() {
            Some(guard) => self.finish(self.spawn_build(guard)).await,
            None => {
                debug!(
                    target = "leadcache::cache::coordinator",
                    dataset = %self.kind,
                    "refresh already running; request dropped"
                );
                RefreshOutcome::Skipped
            }
        }
    }

    /// Like [`Self::trigger_refresh`], but waits out an in-flight build and
    /// then runs its own instead of being dropped.
    pub async fn refresh_now(self: &Arc<Self>) -> RefreshOutcome {
        loop {
            match self.trigger_refresh().await {
                RefreshOutcome::Skipped => self.wait_idle().await,
                outcome => return outcome,
            }
        }
    }

    /// Stale-while-revalidate read.
    ///
    /// With data cached, returns it at once and starts at most one background
    /// refresh. With nothing cached, waits for a build (its own or the one in
    /// flight) and returns whatever the store holds afterwards.
    pub async fn serve(self: &Arc<Self>) -> Arc<CacheSnapshot> {
        let snapshot = self.store.get();

        if snapshot.is_populated() {
            if let Some(guard) = self.claim() {
                debug!(
                    target = "leadcache::cache::coordinator",
                    dataset = %self.kind,
                    "serving cached rows; refreshing in background"
                );
                drop(self.spawn_build(guard));
            }
            return snapshot;
        }

        match self.claim() {
            Some(guard) => {
                self.finish(self.spawn_build(guard)).await;
            }
            None => self.wait_idle().await,
        }
        self.store.get()
    }

    /// Resolves once no build is running.
    pub async fn wait_idle(&self) {
        let mut finished = self.slot.finished.subscribe();
        if !self.slot.running.load(Ordering::Acquire) {
            return;
        }
        while self.slot.running.load(Ordering::Acquire) {
            if finished.changed().await.is_err() {
                return;
            }
        }
    }

    fn claim(&self) -> Option<SlotGuard> {
        self.slot
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SlotGuard {
                slot: Arc::clone(&self.slot),
            })
    }

    fn spawn_build(self: &Arc<Self>, guard: SlotGuard) -> JoinHandle<RefreshOutcome> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            this.execute().await
        })
    }

    async fn finish(&self, handle: JoinHandle<RefreshOutcome>) -> RefreshOutcome {
        handle.await.unwrap_or_else(|err| {
            warn!(
                target = "leadcache::cache::coordinator",
                dataset = %self.kind,
                error = %err,
                "refresh task aborted"
            );
            counter!(METRIC_REFRESH_TOTAL, "dataset" => self.kind.as_str(), "result" => "panicked")
                .increment(1);
            RefreshOutcome::Failed(BuildError::task_failed(err.to_string()))
        })
    }

    async fn execute(&self) -> RefreshOutcome {
        let started = Instant::now();
        info!(
            target = "leadcache::cache::coordinator",
            dataset = %self.kind,
            "refresh started"
        );

        let outcome = match self.source.build().await {
            Ok(built) => {
                let snapshot = self.store.set(built).await;
                info!(
                    target = "leadcache::cache::coordinator",
                    dataset = %self.kind,
                    rows = snapshot.len(),
                    truncated = snapshot.truncated,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "refresh completed"
                );
                RefreshOutcome::Completed {
                    rows: snapshot.len(),
                }
            }
            Err(err) => {
                warn!(
                    target = "leadcache::cache::coordinator",
                    dataset = %self.kind,
                    error = %err,
                    "refresh failed; keeping previous snapshot"
                );
                RefreshOutcome::Failed(err)
            }
        };

        let result = match outcome {
            RefreshOutcome::Completed { .. } => "ok",
            _ => "error",
        };
        counter!(METRIC_REFRESH_TOTAL, "dataset" => self.kind.as_str(), "result" => result)
            .increment(1);
        histogram!(METRIC_REFRESH_MS, "dataset" => self.kind.as_str())
            .record(started.elapsed().as_secs_f64() * 1000.0);

        outcome
    }
}
