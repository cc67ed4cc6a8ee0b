//! Cache configuration.

use std::{path::PathBuf, time::Duration};

use crate::domain::types::DatasetKind;

const DEFAULT_SNAPSHOT_DIR: &str = "data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Directory holding `<dataset>.json` and `<dataset>.meta.json`.
    pub snapshot_dir: PathBuf,
    /// Period of the scheduled refresh; `None` disables it.
    pub refresh_interval: Option<Duration>,
    pub refresh_on_startup: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from(DEFAULT_SNAPSHOT_DIR),
            refresh_interval: None,
            refresh_on_startup: false,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            snapshot_dir: settings.snapshot_dir.clone(),
            refresh_interval: settings.refresh_interval,
            refresh_on_startup: settings.refresh_on_startup,
        }
    }
}

impl CacheConfig {
    pub fn rows_path(&self, kind: DatasetKind) -> PathBuf {
        self.snapshot_dir.join(format!("{}.json", kind.as_str()))
    }

    pub fn meta_path(&self, kind: DatasetKind) -> PathBuf {
        self.snapshot_dir.join(format!("{}.meta.json", kind.as_str()))
    }
}
