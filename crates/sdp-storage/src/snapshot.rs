//! Durable snapshot storage with an atomically swapped "current" pointer.
//!
//! Layout under the data directory:
//!
//! ```text
//! current.json
//! snapshots/<run_id>/raw.parquet
//! snapshots/<run_id>/raw.csv
//! snapshots/<run_id>/processed.parquet
//! snapshots/<run_id>/processed.csv
//! snapshots/<run_id>/metadata.json
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use sdp_core::{PipelineError, SnapshotSummary, Table};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::codec::{self, ColumnSpec};

pub const POINTER_FILE: &str = "current.json";
pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const METADATA_FILE: &str = "metadata.json";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Raw,
    Processed,
}

impl TableKind {
    pub fn name(&self) -> &'static str {
        match self {
            TableKind::Raw => "raw",
            TableKind::Processed => "processed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub schema_version: u32,
    pub summary: SnapshotSummary,
    pub tables: Vec<TableMetadata>,
    pub files: Vec<ManifestFile>,
}

impl SnapshotMetadata {
    pub fn table(&self, kind: TableKind) -> Option<&TableMetadata> {
        self.tables.iter().find(|t| t.name == kind.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub name: String,
    pub rows: usize,
    pub columns: Vec<ColumnSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotPointer {
    run_id: Uuid,
    dir: String,
    last_updated: DateTime<Utc>,
}

#[derive(Debug)]
pub struct SnapshotStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Persist both tables and the summary as a new snapshot, then make it current.
    ///
    /// Readers keep seeing the previous snapshot until the pointer rename lands.
    pub async fn save(
        &self,
        raw: &Table,
        processed: &Table,
        summary: &SnapshotSummary,
    ) -> anyhow::Result<SnapshotMetadata> {
        let _guard = self.write_lock.lock().await;

        let dir_name = summary.run_id.to_string();
        let snapshot_dir = self.root.join(SNAPSHOTS_DIR).join(&dir_name);
        fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let mut tables = Vec::new();
        let mut files = Vec::new();
        for (kind, table) in [(TableKind::Raw, raw), (TableKind::Processed, processed)] {
            let parquet = codec::encode_parquet(table)
                .with_context(|| format!("encoding {} parquet", kind.name()))?;
            let csv = codec::encode_csv(table)
                .with_context(|| format!("encoding {} csv", kind.name()))?;

            for (ext, bytes) in [("parquet", parquet), ("csv", csv)] {
                let file_name = format!("{}.{ext}", kind.name());
                write_atomic(&snapshot_dir.join(&file_name), &bytes).await?;
                files.push(ManifestFile {
                    name: format!("{}_{ext}", kind.name()),
                    path: file_name,
                    sha256: Self::sha256_hex(&bytes),
                    bytes: bytes.len() as u64,
                });
            }

            tables.push(TableMetadata {
                name: kind.name().to_string(),
                rows: table.len(),
                columns: codec::table_schema(table),
            });
        }

        let metadata = SnapshotMetadata {
            schema_version: SCHEMA_VERSION,
            summary: summary.clone(),
            tables,
            files,
        };
        let bytes = serde_json::to_vec_pretty(&metadata).context("serializing snapshot metadata")?;
        write_atomic(&snapshot_dir.join(METADATA_FILE), &bytes).await?;

        let pointer = SnapshotPointer {
            run_id: summary.run_id,
            dir: dir_name.clone(),
            last_updated: summary.last_updated,
        };
        let bytes = serde_json::to_vec_pretty(&pointer).context("serializing snapshot pointer")?;
        write_atomic(&self.root.join(POINTER_FILE), &bytes).await?;
        info!(
            run_id = %summary.run_id,
            raw_rows = raw.len(),
            processed_rows = processed.len(),
            "snapshot swapped in"
        );

        self.prune_except(&dir_name).await;
        Ok(metadata)
    }

    async fn prune_except(&self, keep: &str) {
        let snapshots = self.root.join(SNAPSHOTS_DIR);
        let mut entries = match fs::read_dir(&snapshots).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "listing old snapshots failed");
                return;
            }
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "listing old snapshots failed");
                    break;
                }
            };
            if entry.file_name().to_string_lossy() == keep {
                continue;
            }
            if let Err(err) = fs::remove_dir_all(entry.path()).await {
                warn!(path = %entry.path().display(), error = %err, "removing old snapshot failed");
            }
        }
    }

    async fn pointer(&self) -> anyhow::Result<Option<SnapshotPointer>> {
        let path = self.root.join(POINTER_FILE);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let pointer = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(pointer))
    }

    fn snapshot_dir(&self, pointer: &SnapshotPointer) -> PathBuf {
        self.root.join(SNAPSHOTS_DIR).join(&pointer.dir)
    }

    /// Metadata of the current snapshot, `None` when nothing was ever saved.
    pub async fn current(&self) -> anyhow::Result<Option<SnapshotMetadata>> {
        let Some(pointer) = self.pointer().await? else {
            return Ok(None);
        };
        let path = self.snapshot_dir(&pointer).join(METADATA_FILE);
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let metadata =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(metadata))
    }

    async fn require_current(&self) -> Result<(SnapshotPointer, SnapshotMetadata), PipelineError> {
        let pointer = self
            .pointer()
            .await?
            .ok_or_else(|| PipelineError::no_data("no snapshot has been saved yet"))?;
        let metadata = self
            .current()
            .await?
            .ok_or_else(|| PipelineError::no_data("snapshot pointer vanished while reading"))?;
        Ok((pointer, metadata))
    }

    pub async fn load(&self, kind: TableKind) -> Result<Table, PipelineError> {
        let (pointer, metadata) = self.require_current().await?;
        let dir = self.snapshot_dir(&pointer);
        let parquet_path = dir.join(format!("{}.parquet", kind.name()));

        match codec::read_parquet(&parquet_path) {
            Ok(table) => Ok(table),
            Err(err) => {
                warn!(
                    path = %parquet_path.display(),
                    error = %err,
                    "parquet snapshot unreadable, falling back to csv"
                );
                let spec = metadata.table(kind).with_context(|| {
                    format!("snapshot metadata lists no {} table", kind.name())
                })?;
                let csv_path = dir.join(format!("{}.csv", kind.name()));
                Ok(codec::read_csv(&csv_path, &spec.columns)?)
            }
        }
    }

    pub async fn load_processed(&self) -> Result<Table, PipelineError> {
        self.load(TableKind::Processed).await
    }

    pub async fn load_raw(&self) -> Result<Table, PipelineError> {
        self.load(TableKind::Raw).await
    }

    pub async fn load_summary(&self) -> Result<SnapshotSummary, PipelineError> {
        let (_, metadata) = self.require_current().await?;
        Ok(metadata.summary)
    }

    pub async fn last_updated(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(self.pointer().await?.map(|p| p.last_updated))
    }

    pub async fn is_stale(&self, max_age_hours: u64) -> bool {
        self.is_stale_at(Utc::now(), max_age_hours).await
    }

    /// True when there is no snapshot, it cannot be read, or it is older than
    /// `max_age_hours` relative to `now`.
    pub async fn is_stale_at(&self, now: DateTime<Utc>, max_age_hours: u64) -> bool {
        let last_updated = match self.last_updated().await {
            Ok(Some(ts)) => ts,
            Ok(None) => return true,
            Err(err) => {
                warn!(error = %err, "snapshot pointer unreadable, treating as stale");
                return true;
            }
        };
        let max_age = i64::try_from(max_age_hours)
            .ok()
            .and_then(TimeDelta::try_hours)
            .unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(last_updated) > max_age
    }
}

/// Write via a temp file in the same directory and rename into place.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}
