use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use lookbook_contracts::runs::summary::{write_summary, BatchSummary};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::handle::ItemStatus;
use crate::gallery::GalleryStore;
use crate::util::{map_object, write_json};

pub const REPORT_FILE: &str = "batch.json";
pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub sku: String,
    pub variation: u32,
    pub operation: String,
    pub status: ItemStatus,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub image_path: Option<PathBuf>,
    #[serde(default)]
    pub receipt_path: Option<PathBuf>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub name: String,
    pub out_dir: PathBuf,
    pub started_at: String,
    pub finished_at: String,
    pub items: Vec<ItemResult>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl BatchReport {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid batch report {}", path.display()))
    }

    pub fn count(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|item| item.status == status).count()
    }

    pub fn cost_total_usd(&self) -> f64 {
        self.items.iter().map(|item| item.cost_usd).sum()
    }

    pub fn outputs(&self) -> impl Iterator<Item = &ItemResult> {
        self.items.iter().filter(|item| item.image_path.is_some())
    }

    /// SKUs with at least one failed or cancelled item.
    pub fn retry_skus(&self) -> BTreeSet<String> {
        self.items
            .iter()
            .filter(|item| matches!(item.status, ItemStatus::Failed | ItemStatus::Cancelled))
            .map(|item| item.sku.clone())
            .collect()
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            batch_id: self.batch_id.clone(),
            started_at: self.started_at.clone(),
            finished_at: self.finished_at.clone(),
            total_items: self.items.len() as u64,
            succeeded: self.count(ItemStatus::Succeeded) as u64,
            failed: self.count(ItemStatus::Failed) as u64,
            cancelled: self.count(ItemStatus::Cancelled) as u64,
            cached: self.count(ItemStatus::Skipped) as u64,
            outputs: self.outputs().count() as u64,
            cost_total_usd: self.cost_total_usd(),
        }
    }

    /// Folds in the items of `previous` for SKUs this run did not touch,
    /// keeping `previous` order. SKUs this run did process replace their
    /// old items where those stood.
    pub fn carry_over(&mut self, previous: &BatchReport) {
        let rerun: BTreeSet<String> = self.items.iter().map(|item| item.sku.clone()).collect();
        let mut fresh = std::mem::take(&mut self.items);
        let mut items = Vec::with_capacity(previous.items.len().max(fresh.len()));
        let mut placed = BTreeSet::new();
        for item in &previous.items {
            if !rerun.contains(&item.sku) {
                items.push(item.clone());
            } else if placed.insert(item.sku.clone()) {
                let (matching, rest): (Vec<_>, Vec<_>) =
                    fresh.into_iter().partition(|new| new.sku == item.sku);
                items.extend(matching);
                fresh = rest;
            }
        }
        items.extend(fresh);
        self.items = items;
        for warning in &previous.warnings {
            if !self.warnings.contains(warning) {
                self.warnings.push(warning.clone());
            }
        }
    }

    pub fn write(&self) -> Result<()> {
        write_json(&self.out_dir.join(REPORT_FILE), &serde_json::to_value(self)?)?;
        write_summary(
            &self.out_dir.join(SUMMARY_FILE),
            &self.summary(),
            Some(&map_object(json!({ "name": self.name }))),
        )
    }
}

/// Copies every output into `/<batch name>/<SKU>/` and returns how many
/// files were imported.
pub fn import_into_gallery(report: &BatchReport, gallery: &mut GalleryStore) -> Result<usize> {
    let mut imported = 0;
    for item in report.outputs() {
        let Some(image_path) = &item.image_path else {
            continue;
        };
        let folder = gallery.ensure_folder_path(&[report.name.as_str(), item.sku.as_str()])?;
        gallery.import_file(
            &folder,
            image_path,
            map_object(json!({
                "batch_id": report.batch_id,
                "sku": item.sku,
                "variation": item.variation,
                "operation": item.operation,
                "model": item.model,
                "cost_usd": item.cost_usd,
            })),
        )?;
        imported += 1;
    }
    Ok(imported)
}
