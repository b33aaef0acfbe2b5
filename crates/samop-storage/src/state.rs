//! Rotating run snapshots plus the fixed "latest" legacy response file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use samop_core::{LegacyResponse, LegacySummary, PartitionFailure, ResolvedParams, StateSnapshot};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SNAPSHOT_KEEP: usize = 10;
pub const LEGACY_SNAPSHOT_FILE: &str = "sam_opportunities_latest.json";

const SNAPSHOT_PREFIX: &str = "sam_state_";
const SNAPSHOT_SUFFIX: &str = ".json";

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn legacy_path(&self) -> PathBuf {
        self.root.join(LEGACY_SNAPSHOT_FILE)
    }

    /// Microsecond stamps sort lexically in write order.
    pub fn snapshot_file_name(at: DateTime<Utc>) -> String {
        format!(
            "{SNAPSHOT_PREFIX}{}{SNAPSHOT_SUFFIX}",
            at.format("%Y%m%d_%H%M%S_%6f")
        )
    }

    pub async fn save(
        &self,
        params: &ResolvedParams,
        summary: &LegacySummary,
        failed_partitions: &[PartitionFailure],
    ) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating state directory {}", self.root.display()))?;

        // Claim the name with create_new so concurrent savers never share one;
        // the atomic write then replaces the empty placeholder.
        let mut timestamp = Utc::now();
        let path = loop {
            let candidate = self.root.join(Self::snapshot_file_name(timestamp));
            match fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&candidate)
                .await
            {
                Ok(_) => break candidate,
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    timestamp += ChronoDuration::microseconds(1);
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("reserving snapshot path {}", candidate.display()))
                }
            }
        };

        let snapshot = StateSnapshot {
            timestamp,
            params: params.clone(),
            summary: summary.clone(),
            failed_partitions: failed_partitions.to_vec(),
        };
        let written = match serde_json::to_vec_pretty(&snapshot).context("serializing state snapshot") {
            Ok(bytes) => write_atomic(&path, &bytes).await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            let _ = fs::remove_file(&path).await;
            return Err(err);
        }
        debug!(path = %path.display(), "state snapshot written");
        Ok(path)
    }

    /// Snapshot paths, newest first.
    pub async fn list_snapshots(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.root.display()))
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.root.display()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(SNAPSHOT_PREFIX) && name.ends_with(SNAPSHOT_SUFFIX) {
                names.push(name);
            }
        }
        names.sort();
        names.reverse();
        Ok(names.into_iter().map(|n| self.root.join(n)).collect())
    }

    /// Delete all but the newest `keep` snapshots. Returns how many were removed.
    pub async fn rotate(&self, keep: usize) -> anyhow::Result<usize> {
        let snapshots = self.list_snapshots().await?;
        let mut deleted = 0usize;
        for path in snapshots.into_iter().skip(keep) {
            match fs::remove_file(&path).await {
                Ok(()) => deleted += 1,
                Err(err) => warn!(path = %path.display(), error = %err, "failed to delete old snapshot"),
            }
        }
        if deleted > 0 {
            info!(deleted, keep, "rotated state snapshots");
        }
        Ok(deleted)
    }

    /// Best effort; a failed write is logged and reported as `None`.
    pub async fn save_legacy(&self, response: &LegacyResponse) -> Option<PathBuf> {
        let path = self.legacy_path();
        let result = async {
            fs::create_dir_all(&self.root)
                .await
                .with_context(|| format!("creating state directory {}", self.root.display()))?;
            let bytes = serde_json::to_vec_pretty(response).context("serializing legacy response")?;
            write_atomic(&path, &bytes).await
        }
        .await;

        match result {
            Ok(()) => Some(path),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to write legacy snapshot");
                None
            }
        }
    }

    pub async fn load_legacy(&self) -> anyhow::Result<Option<LegacyResponse>> {
        let path = self.legacy_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        let response =
            serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(response))
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
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
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("renaming {} -> {}", temp_path.display(), path.display())
        });
    }
    Ok(())
}
