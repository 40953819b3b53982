//! Batch pipeline: group uploads into products, resolve per-product
//! settings, then fan generation calls out over a bounded worker pool.

mod handle;
mod plan;
mod report;
mod run;

pub use handle::{BatchHandle, BatchProgress, ItemStatus};
pub use plan::{plan_batch, BatchPlan, BatchRequest, BatchTask, PlanEstimate};
pub use report::{import_into_gallery, BatchReport, ItemResult, REPORT_FILE, SUMMARY_FILE};
pub use run::{run_batch, RunOptions, CACHE_FILE};
