//! Append-only cost ledger. One JSON line per generation call, plus
//! aggregation for display.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Succeeded,
    Failed,
    Cached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub ts: String,
    pub user_id: String,
    pub operation: String,
    pub model: String,
    pub input_images: u32,
    pub input_text_tokens: u64,
    pub output_images: u32,
    pub cost_usd: f64,
    pub status: LedgerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LedgerWriter {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl LedgerWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, mut entry: LedgerEntry) -> anyhow::Result<LedgerEntry> {
        if entry.ts.trim().is_empty() {
            entry.ts = now_utc_iso();
        }
        let line = serde_json::to_string(&entry)?;
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("ledger lock poisoned"))?;
        append_line(&self.path, &line)?;
        Ok(entry)
    }

    pub fn entries(&self) -> anyhow::Result<Vec<LedgerEntry>> {
        read_ledger(&self.path)
    }
}

/// Missing ledger reads as empty; malformed lines are skipped.
pub fn read_ledger(path: &Path) -> anyhow::Result<Vec<LedgerEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<LedgerEntry>(line).ok())
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerTotals {
    pub calls: u64,
    pub failed_calls: u64,
    pub cached_calls: u64,
    pub input_images: u64,
    pub output_images: u64,
    pub cost_usd: f64,
}

impl LedgerTotals {
    fn add(&mut self, entry: &LedgerEntry) {
        self.calls += 1;
        match entry.status {
            LedgerStatus::Failed => self.failed_calls += 1,
            LedgerStatus::Cached => self.cached_calls += 1,
            LedgerStatus::Succeeded => {}
        }
        self.input_images += u64::from(entry.input_images);
        self.output_images += u64::from(entry.output_images);
        self.cost_usd += entry.cost_usd;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerSummary {
    pub total: LedgerTotals,
    pub by_operation: BTreeMap<String, LedgerTotals>,
    pub by_model: BTreeMap<String, LedgerTotals>,
}

pub fn summarize<'a>(
    entries: impl IntoIterator<Item = &'a LedgerEntry>,
    user_id: Option<&str>,
) -> LedgerSummary {
    let mut summary = LedgerSummary::default();
    for entry in entries {
        if let Some(user_id) = user_id {
            if entry.user_id != user_id {
                continue;
            }
        }
        summary.total.add(entry);
        summary
            .by_operation
            .entry(entry.operation.clone())
            .or_default()
            .add(entry);
        summary
            .by_model
            .entry(entry.model.clone())
            .or_default()
            .add(entry);
    }
    summary
}

fn append_line(path: &Path, line: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user: &str, operation: &str, cost: f64, status: LedgerStatus) -> LedgerEntry {
        LedgerEntry {
            ts: String::new(),
            user_id: user.to_string(),
            operation: operation.to_string(),
            model: "gemini-2.5-flash-image".to_string(),
            input_images: 2,
            input_text_tokens: 100,
            output_images: if status == LedgerStatus::Failed { 0 } else { 1 },
            cost_usd: cost,
            status,
            batch_id: None,
            sku: None,
        }
    }

    #[test]
    fn writer_appends_and_stamps_timestamp() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = LedgerWriter::new(temp.path().join("ledger.jsonl"));

        let written = writer.record(entry("ada", "model_photo", 0.04, LedgerStatus::Succeeded))?;
        assert!(!written.ts.is_empty());
        writer.record(entry("ada", "retouch", 0.03, LedgerStatus::Failed))?;

        let entries = writer.entries()?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].operation, "model_photo");
        assert_eq!(entries[1].status, LedgerStatus::Failed);
        Ok(())
    }

    #[test]
    fn summary_groups_by_operation_and_filters_user() {
        let entries = vec![
            entry("ada", "model_photo", 0.04, LedgerStatus::Succeeded),
            entry("ada", "model_photo", 0.0, LedgerStatus::Cached),
            entry("ada", "expand", 0.001, LedgerStatus::Failed),
            entry("bob", "expand", 0.05, LedgerStatus::Succeeded),
        ];

        let all = summarize(&entries, None);
        assert_eq!(all.total.calls, 4);
        assert!((all.total.cost_usd - 0.091).abs() < 1e-9);

        let ada = summarize(&entries, Some("ada"));
        assert_eq!(ada.total.calls, 3);
        assert_eq!(ada.total.failed_calls, 1);
        assert_eq!(ada.total.cached_calls, 1);
        assert_eq!(ada.by_operation["model_photo"].output_images, 2);
        assert_eq!(ada.by_operation["expand"].output_images, 0);
    }

    #[test]
    fn missing_ledger_reads_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        assert!(read_ledger(&temp.path().join("none.jsonl"))?.is_empty());
        Ok(())
    }
}
