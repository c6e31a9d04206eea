use crate::domain::portfolio::Portfolio;
use crate::domain::types::{CommunicationLogs, MemoryOpRecord};
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    date: NaiveDate,
    timestamp: String,
    portfolio: Portfolio,
}

/// All per-day file writes go through here: portfolio snapshots, the
/// memory-operations JSONL log, and communication analysis dumps.
pub struct PersistenceService {
    base_dir: PathBuf,
    config_name: String,
}

impl PersistenceService {
    pub fn new(base_dir: impl Into<PathBuf>, config_name: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            config_name: config_name.into(),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.base_dir.join("state")
    }

    pub fn dashboard_dir(&self) -> PathBuf {
        self.state_dir().join("team_dashboard")
    }

    fn memory_ops_dir(&self) -> PathBuf {
        self.base_dir
            .join("logs_and_memory")
            .join(&self.config_name)
            .join("memory_operations")
    }

    fn communications_dir(&self) -> PathBuf {
        self.base_dir.join("analysis_results_logs")
    }

    fn write_atomic(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {parent:?}"))?;
        }
        // Atomic write: temp file then rename.
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, content).with_context(|| format!("failed to write {temp_path:?}"))?;
        fs::rename(&temp_path, path).with_context(|| format!("failed to rename to {path:?}"))?;
        Ok(())
    }

    /// Writes `state/portfolio_<YYYY-MM-DD>.json` with `{date, timestamp,
    /// portfolio}`. At most one snapshot per day; rewrites are atomic.
    pub fn write_portfolio_snapshot(
        &self,
        date: NaiveDate,
        portfolio: &Portfolio,
    ) -> Result<PathBuf> {
        let snapshot = SnapshotFile {
            date,
            timestamp: Utc::now().to_rfc3339(),
            portfolio: portfolio.clone(),
        };
        let path = self.state_dir().join(format!("portfolio_{date}.json"));
        let content =
            serde_json::to_string_pretty(&snapshot).context("failed to serialize snapshot")?;
        Self::write_atomic(&path, &content)?;
        info!("Persistence: wrote snapshot {:?}", path);
        Ok(path)
    }

    /// Newest snapshot in the state directory, if any. ISO dates make the
    /// lexicographically-greatest filename the most recent.
    pub fn load_latest_snapshot(&self) -> Result<Option<(NaiveDate, Portfolio)>> {
        let state_dir = self.state_dir();
        if !state_dir.exists() {
            return Ok(None);
        }

        let mut latest: Option<PathBuf> = None;
        for entry in fs::read_dir(&state_dir).context("failed to read state dir")? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with("portfolio_") && name.ends_with(".json") {
                if latest
                    .as_ref()
                    .and_then(|p| p.file_name().and_then(|n| n.to_str()))
                    .is_none_or(|current| name > current)
                {
                    latest = Some(path);
                }
            }
        }

        let Some(path) = latest else {
            return Ok(None);
        };
        let content =
            fs::read_to_string(&path).with_context(|| format!("failed to read {path:?}"))?;
        let snapshot: SnapshotFile =
            serde_json::from_str(&content).with_context(|| format!("failed to parse {path:?}"))?;
        Ok(Some((snapshot.date, snapshot.portfolio)))
    }

    /// Appends one JSON object per line to
    /// `logs_and_memory/<config>/memory_operations/memory_ops_<YYYYMMDD>.jsonl`.
    pub fn append_memory_op(&self, date: NaiveDate, record: &MemoryOpRecord) -> Result<()> {
        let dir = self.memory_ops_dir();
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {dir:?}"))?;
        let path = dir.join(format!("memory_ops_{}.jsonl", date.format("%Y%m%d")));

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {path:?}"))?;
        let line = serde_json::to_string(record).context("failed to serialize memory op")?;
        writeln!(file, "{line}").with_context(|| format!("failed to append to {path:?}"))?;
        Ok(())
    }

    pub fn memory_ops_path(&self, date: NaiveDate) -> PathBuf {
        self.memory_ops_dir()
            .join(format!("memory_ops_{}.jsonl", date.format("%Y%m%d")))
    }

    /// Writes `analysis_results_logs/communications_analysis_<stamp>.json`.
    pub fn write_communication_log(
        &self,
        date: NaiveDate,
        logs: &CommunicationLogs,
    ) -> Result<PathBuf> {
        let stamp = format!(
            "{}_{}",
            date.format("%Y%m%d"),
            Utc::now().format("%H%M%S")
        );
        let path = self
            .communications_dir()
            .join(format!("communications_analysis_{stamp}.json"));
        let content = serde_json::to_string_pretty(logs)
            .context("failed to serialize communication logs")?;
        Self::write_atomic(&path, &content)?;
        Ok(path)
    }
}
