//! Durable tier: one rows file and one metadata file per dataset.

use std::{
    fs,
    io::{BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tempfile::NamedTempFile;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::domain::rows::FlatRow;

use super::store::CacheSnapshot;

const SOURCE: &str = "leadcache::cache::persist";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io failed for `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot `{}` could not be decoded: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SnapshotError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Contents of `<dataset>.meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_update: Option<OffsetDateTime>,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub truncated: bool,
}

impl From<&CacheSnapshot> for SnapshotMeta {
    fn from(snapshot: &CacheSnapshot) -> Self {
        Self {
            last_update: snapshot.built_at,
            total: snapshot.rows.len(),
            truncated: snapshot.truncated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFiles {
    rows: PathBuf,
    meta: PathBuf,
}

impl SnapshotFiles {
    pub fn new(rows: PathBuf, meta: PathBuf) -> Self {
        Self { rows, meta }
    }

    /// Read both files. Any problem with the rows file yields an empty
    /// snapshot; a bad metadata file only loses `built_at` and `truncated`.
    pub fn load(&self) -> CacheSnapshot {
        let rows: Vec<FlatRow> = match read_json(&self.rows) {
            Ok(Some(rows)) => rows,
            Ok(None) => {
                debug!(target = SOURCE, path = %self.rows.display(), "no snapshot on disk");
                return CacheSnapshot::empty();
            }
            Err(err) => {
                warn!(target = SOURCE, error = %err, "discarding unreadable snapshot");
                return CacheSnapshot::empty();
            }
        };

        let meta: Option<SnapshotMeta> = read_json(&self.meta).unwrap_or_else(|err| {
            warn!(target = SOURCE, error = %err, "discarding unreadable snapshot metadata");
            None
        });

        CacheSnapshot {
            rows,
            built_at: meta.as_ref().and_then(|meta| meta.last_update),
            truncated: meta.is_some_and(|meta| meta.truncated),
        }
    }

    /// Write rows first, then metadata, each through a temp file renamed into
    /// place so readers never observe a torn file.
    pub fn save(&self, snapshot: &CacheSnapshot) -> Result<(), SnapshotError> {
        write_atomic(&self.rows, &snapshot.rows)?;
        write_atomic(&self.meta, &SnapshotMeta::from(snapshot))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, SnapshotError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(SnapshotError::io(path, err)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| SnapshotError::Decode {
            path: path.to_path_buf(),
            source,
        })
}

fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), SnapshotError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|err| SnapshotError::io(dir, err))?;

    let mut temp = NamedTempFile::new_in(dir).map_err(|err| SnapshotError::io(dir, err))?;
    {
        let mut writer = BufWriter::new(temp.as_file_mut());
        serde_json::to_writer(&mut writer, value)?;
        writer.flush().map_err(|err| SnapshotError::io(path, err))?;
    }
    temp.persist(path)
        .map_err(|err| SnapshotError::io(path, err.error))?;
    Ok(())
}
