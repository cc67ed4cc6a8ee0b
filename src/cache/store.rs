//! Two-tier snapshot storage: memory for reads, disk for restarts.

use std::sync::{Arc, RwLock};

use metrics::gauge;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::application::pipeline::BuiltRows;
use crate::domain::rows::FlatRow;
use crate::domain::types::DatasetKind;

use super::lock::{rw_read, rw_write};
use super::persist::SnapshotFiles;

const SOURCE: &str = "cache::store";
const METRIC_SNAPSHOT_ROWS: &str = "leadcache_snapshot_rows";

/// The complete row set served for a dataset at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheSnapshot {
    pub rows: Vec<FlatRow>,
    /// `None` only before any build or when the metadata file was lost.
    pub built_at: Option<OffsetDateTime>,
    pub truncated: bool,
}

impl CacheSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Whether anything was ever built or restored. A successful build may
    /// legitimately produce zero rows.
    pub fn is_populated(&self) -> bool {
        self.built_at.is_some() || !self.rows.is_empty()
    }
}

pub struct SnapshotStore {
    kind: DatasetKind,
    current: RwLock<Arc<CacheSnapshot>>,
    files: Arc<SnapshotFiles>,
}

impl SnapshotStore {
    pub fn new(kind: DatasetKind, files: SnapshotFiles) -> Self {
        Self {
            kind,
            current: RwLock::new(Arc::new(CacheSnapshot::empty())),
            files: Arc::new(files),
        }
    }

    pub fn kind(&self) -> DatasetKind {
        self.kind
    }

    /// Current snapshot. Memory only.
    pub fn get(&self) -> Arc<CacheSnapshot> {
        Arc::clone(&rw_read(&self.current, SOURCE, "get"))
    }

    /// Publish `built` as the new snapshot, then persist it.
    ///
    /// Readers switch over in a single pointer swap. A failed disk write is
    /// logged and leaves the memory tier updated.
    pub async fn set(&self, built: BuiltRows) -> Arc<CacheSnapshot> {
        let snapshot = Arc::new(CacheSnapshot {
            rows: built.rows,
            built_at: Some(OffsetDateTime::now_utc()),
            truncated: built.truncated,
        });
        self.publish(Arc::clone(&snapshot));

        let files = Arc::clone(&self.files);
        let to_persist = Arc::clone(&snapshot);
        match tokio::task::spawn_blocking(move || files.save(&to_persist)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(
                target = "leadcache::cache::store",
                dataset = %self.kind,
                error = %err,
                "snapshot kept in memory only"
            ),
            Err(err) => warn!(
                target = "leadcache::cache::store",
                dataset = %self.kind,
                error = %err,
                "snapshot persistence task failed"
            ),
        }

        snapshot
    }

    /// Hydrate memory from disk. Never fails; unreadable files mean an empty
    /// cache.
    pub async fn load(&self) -> Arc<CacheSnapshot> {
        let files = Arc::clone(&self.files);
        let loaded = tokio::task::spawn_blocking(move || files.load())
            .await
            .unwrap_or_else(|err| {
                warn!(
                    target = "leadcache::cache::store",
                    dataset = %self.kind,
                    error = %err,
                    "snapshot load task failed"
                );
                CacheSnapshot::empty()
            });

        info!(
            target = "leadcache::cache::store",
            dataset = %self.kind,
            rows = loaded.len(),
            built_at = ?loaded.built_at,
            "snapshot hydrated from disk"
        );

        let snapshot = Arc::new(loaded);
        self.publish(Arc::clone(&snapshot));
        snapshot
    }

    fn publish(&self, snapshot: Arc<CacheSnapshot>) {
        gauge!(METRIC_SNAPSHOT_ROWS, "dataset" => self.kind.as_str()).set(snapshot.len() as f64);
        *rw_write(&self.current, SOURCE, "publish") = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::Number;
    use tempfile::TempDir;

    use super::*;

    fn store(dir: &TempDir) -> SnapshotStore {
        SnapshotStore::new(
            DatasetKind::Leads,
            SnapshotFiles::new(dir.path().join("leads.json"), dir.path().join("leads.meta.json")),
        )
    }

    fn rows(count: i64) -> Vec<FlatRow> {
        (1..=count)
            .map(|id| FlatRow {
                id,
                name: None,
                price: Number::from(id * 10),
                pipeline_id: None,
                pipeline_name: "unknown".into(),
                status_id: None,
                status_name: "unknown".into(),
                responsible_user_id: None,
                responsible_user_name: "unassigned".into(),
                created_at: None,
                updated_at: None,
                closed_at: None,
                contact_id: None,
                contact_name: None,
                custom_fields: BTreeMap::new(),
            })
            .collect()
    }

    #[tokio::test]
    async fn starts_empty() {
        let dir = TempDir::new().expect("tempdir");
        let snapshot = store(&dir).get();
        assert!(snapshot.is_empty());
        assert!(!snapshot.is_populated());
    }

    #[tokio::test]
    async fn set_replaces_and_persists() {
        let dir = TempDir::new().expect("tempdir");
        let store = store(&dir);
        let before = store.get();

        store
            .set(BuiltRows {
                rows: rows(3),
                truncated: false,
            })
            .await;

        let after = store.get();
        assert!(before.is_empty(), "earlier readers keep their snapshot");
        assert_eq!(after.len(), 3);
        assert!(after.built_at.is_some());
        assert!(dir.path().join("leads.json").exists());
        assert!(dir.path().join("leads.meta.json").exists());
    }

    #[tokio::test]
    async fn load_restores_a_previous_process_state() {
        let dir = TempDir::new().expect("tempdir");
        store(&dir)
            .set(BuiltRows {
                rows: rows(2),
                truncated: true,
            })
            .await;

        let restarted = store(&dir);
        let loaded = restarted.load().await;

        assert_eq!(loaded.len(), 2);
        assert!(loaded.truncated);
        assert_eq!(restarted.get().len(), 2);
    }

    #[tokio::test]
    async fn invalid_snapshot_text_loads_as_empty() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("leads.json"), "{ definitely not rows").expect("write");

        let store = store(&dir);
        let loaded = store.load().await;

        assert!(loaded.is_empty());
        assert!(!loaded.is_populated());
    }

    #[tokio::test]
    async fn empty_build_still_counts_as_populated() {
        let dir = TempDir::new().expect("tempdir");
        let store = store(&dir);
        store.set(BuiltRows::default()).await;
        assert!(store.get().is_populated());
    }
}
