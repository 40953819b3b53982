use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::plan::BatchTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Served from the result cache.
    Skipped,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchProgress {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub completed_fraction: f64,
}

#[derive(Debug, Clone)]
struct ItemState {
    sku: String,
    variation: u32,
    status: ItemStatus,
}

#[derive(Debug, Default)]
struct HandleState {
    cancelled: AtomicBool,
    cancelled_skus: Mutex<BTreeSet<String>>,
    items: Mutex<Vec<ItemState>>,
}

/// Shared view of a running batch. Clones observe and control the same run.
#[derive(Debug, Clone, Default)]
pub struct BatchHandle {
    state: Arc<HandleState>,
}

impl BatchHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queued tasks stop being started; calls already in flight finish.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn cancel_item(&self, sku: &str) {
        let sku = sku.trim().to_ascii_uppercase();
        if sku.is_empty() {
            return;
        }
        if let Ok(mut skus) = self.state.cancelled_skus.lock() {
            skus.insert(sku);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_item_cancelled(&self, sku: &str) -> bool {
        self.is_cancelled()
            || self
                .state
                .cancelled_skus
                .lock()
                .map(|skus| skus.contains(sku))
                .unwrap_or(false)
    }

    pub fn progress(&self) -> BatchProgress {
        let Ok(items) = self.state.items.lock() else {
            return BatchProgress::default();
        };
        let mut progress = BatchProgress {
            total: items.len(),
            ..BatchProgress::default()
        };
        for item in items.iter() {
            match item.status {
                ItemStatus::Pending => progress.pending += 1,
                ItemStatus::Running => progress.running += 1,
                ItemStatus::Succeeded => progress.succeeded += 1,
                ItemStatus::Failed => progress.failed += 1,
                ItemStatus::Cancelled => progress.cancelled += 1,
                ItemStatus::Skipped => progress.skipped += 1,
            }
        }
        if progress.total > 0 {
            let done = progress.total - progress.pending - progress.running;
            progress.completed_fraction = done as f64 / progress.total as f64;
        }
        progress
    }

    pub fn statuses(&self) -> Vec<(String, u32, ItemStatus)> {
        self.state
            .items
            .lock()
            .map(|items| {
                items
                    .iter()
                    .map(|item| (item.sku.clone(), item.variation, item.status))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn status(&self, index: usize) -> Option<ItemStatus> {
        self.state
            .items
            .lock()
            .ok()
            .and_then(|items| items.get(index).map(|item| item.status))
    }

    pub(crate) fn start(&self, tasks: &[BatchTask]) {
        if let Ok(mut items) = self.state.items.lock() {
            *items = tasks
                .iter()
                .map(|task| ItemState {
                    sku: task.sku.clone(),
                    variation: task.variation,
                    status: ItemStatus::Pending,
                })
                .collect();
        }
    }

    pub(crate) fn set_status(&self, index: usize, status: ItemStatus) {
        if let Ok(mut items) = self.state.items.lock() {
            if let Some(item) = items.get_mut(index) {
                item.status = status;
            }
        }
    }
}
