//! Lead snapshot cache.
//!
//! Each dataset owns one [`SnapshotStore`] (memory tier plus JSON files on
//! disk) and one [`RefreshCoordinator`] that rebuilds it single-flight and
//! serves stale rows while a rebuild runs.
//!
//! ```toml
//! [cache]
//! snapshot_dir = "data"
//! refresh_interval_seconds = 600
//! refresh_on_startup = true
//! ```

mod config;
mod coordinator;
mod lock;
mod persist;
mod store;

pub use config::CacheConfig;
pub use coordinator::{BuildState, DatasetStatus, RefreshCoordinator, RefreshOutcome};
pub use persist::{SnapshotError, SnapshotFiles, SnapshotMeta};
pub use store::{CacheSnapshot, SnapshotStore};
