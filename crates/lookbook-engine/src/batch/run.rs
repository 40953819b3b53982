use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;

use anyhow::{bail, Context, Result};
use lookbook_contracts::catalog::BatchOperation;
use lookbook_contracts::events::EventWriter;
use lookbook_contracts::runs::cache::ResultCache;
use serde_json::{json, Value};

use super::handle::{BatchHandle, ItemStatus};
use super::plan::{BatchPlan, BatchTask};
use super::report::{BatchReport, ItemResult, REPORT_FILE};
use crate::canvas::{ExpandSpec, Selection};
use crate::config::{clamp_concurrency, DEFAULT_BATCH_CONCURRENCY};
use crate::studio::{GenerationFailure, OpOptions, Studio, StudioOutput};
use crate::util::{error_chain_text, file_digest, map_object, now_utc_iso, stable_hash};

pub const CACHE_FILE: &str = "cache.json";

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub out_dir: PathBuf,
    pub concurrency: usize,
    pub use_cache: bool,
    /// Report of an earlier run of this batch. Its items for SKUs that are
    /// not part of this plan are carried into the new report.
    pub previous: Option<BatchReport>,
}

impl RunOptions {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            concurrency: DEFAULT_BATCH_CONCURRENCY,
            use_cache: true,
            previous: None,
        }
    }
}

struct RunShared<'a> {
    studio: &'a Studio,
    plan: &'a BatchPlan,
    options: &'a RunOptions,
    handle: &'a BatchHandle,
    events: EventWriter,
    queue: Mutex<VecDeque<usize>>,
    results: Mutex<Vec<Option<ItemResult>>>,
    cache: Mutex<ResultCache>,
    cancel_notices: Mutex<BTreeSet<String>>,
    log_error: Mutex<Option<anyhow::Error>>,
}

/// Runs every task of `plan` on at most `options.concurrency` worker
/// threads and writes `batch.json` and `summary.json` into the output dir.
pub fn run_batch(
    studio: &Studio,
    plan: &BatchPlan,
    options: &RunOptions,
    handle: &BatchHandle,
) -> Result<BatchReport> {
    std::fs::create_dir_all(&options.out_dir)
        .with_context(|| format!("failed creating {}", options.out_dir.display()))?;
    let started_at = now_utc_iso();
    let workers = clamp_concurrency(options.concurrency).min(plan.tasks.len().max(1));
    handle.start(&plan.tasks);

    let shared = RunShared {
        studio,
        plan,
        options,
        handle,
        events: studio.events().scoped("batch_id", plan.batch_id.as_str()),
        queue: Mutex::new((0..plan.tasks.len()).collect()),
        results: Mutex::new(vec![None; plan.tasks.len()]),
        cache: Mutex::new(ResultCache::new(options.out_dir.join(CACHE_FILE))),
        cancel_notices: Mutex::new(BTreeSet::new()),
        log_error: Mutex::new(None),
    };
    shared.events.emit(
        "batch_started",
        map_object(json!({
            "name": plan.name,
            "tasks": plan.tasks.len(),
            "concurrency": workers,
        })),
    )?;

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| shared.work());
        }
    });

    let RunShared {
        results, log_error, ..
    } = shared;
    let results = match results.into_inner() {
        Ok(results) => results,
        Err(_) => bail!("batch result table poisoned"),
    };
    let log_error = log_error.into_inner().ok().flatten();
    let items = plan
        .tasks
        .iter()
        .zip(results)
        .map(|(task, result)| {
            result.unwrap_or_else(|| ItemResult {
                error: Some("worker exited before finishing this item".to_string()),
                ..empty_result(task, ItemStatus::Failed)
            })
        })
        .collect();
    let mut report = BatchReport {
        batch_id: plan.batch_id.clone(),
        name: plan.name.clone(),
        out_dir: options.out_dir.clone(),
        started_at,
        finished_at: now_utc_iso(),
        items,
        warnings: plan.warnings.clone(),
    };
    if let Some(previous) = &options.previous {
        report.carry_over(previous);
    }
    report.write()?;
    if let Some(err) = log_error {
        return Err(err);
    }

    let summary = report.summary();
    studio.events().scoped("batch_id", plan.batch_id.as_str()).emit(
        "batch_finished",
        map_object(json!({
            "succeeded": summary.succeeded,
            "failed": summary.failed,
            "cancelled": summary.cancelled,
            "cached": summary.cached,
            "cost_total_usd": summary.cost_total_usd,
            "report_path": options.out_dir.join(REPORT_FILE).to_string_lossy().to_string(),
        })),
    )?;
    Ok(report)
}

impl RunShared<'_> {
    fn work(&self) {
        while let Some(index) = self.next_index() {
            let task = &self.plan.tasks[index];
            let result = self.process(index, task);
            self.handle.set_status(index, result.status);
            self.log(
                &self.events.scoped("sku", task.sku.as_str()),
                "batch_item_finished",
                json!({
                    "variation": task.variation,
                    "status": result.status,
                    "image_path": result.image_path,
                    "cost_usd": result.cost_usd,
                    "error": result.error,
                }),
            );
            if let Ok(mut results) = self.results.lock() {
                results[index] = Some(result);
            }
            let progress = self.handle.progress();
            self.log(&self.events, "batch_progress", json!({ "progress": progress }));
        }
    }

    /// Workers keep going when the event log fails; the first failure is
    /// returned once the report is written.
    fn log(&self, events: &EventWriter, kind: &str, payload: Value) {
        let Err(err) = events.emit(kind, map_object(payload)) else {
            return;
        };
        if let Ok(mut slot) = self.log_error.lock() {
            if slot.is_none() {
                *slot = Some(err.context(format!("failed logging {kind}")));
            }
        }
    }

    fn next_index(&self) -> Option<usize> {
        self.queue.lock().ok()?.pop_front()
    }

    fn process(&self, index: usize, task: &BatchTask) -> ItemResult {
        if self.handle.is_item_cancelled(&task.sku) {
            self.notice_cancel(task);
            return empty_result(task, ItemStatus::Cancelled);
        }
        self.handle.set_status(index, ItemStatus::Running);
        self.log(
            &self.events.scoped("sku", task.sku.as_str()),
            "batch_item_started",
            json!({ "variation": task.variation }),
        );
        match self.run_task(task) {
            Ok(result) => result,
            Err(err) => ItemResult {
                cost_usd: GenerationFailure::billed_cost(&err),
                error: Some(error_chain_text(&err, 2048)),
                ..empty_result(task, ItemStatus::Failed)
            },
        }
    }

    fn run_task(&self, task: &BatchTask) -> Result<ItemResult> {
        let mut opts = task.options(&self.plan.batch_id);
        let model = self.studio.select(&opts, task.capability())?.model.name;
        let key = cache_key(task, &model)?;

        if self.options.use_cache {
            let cached = self
                .cache
                .lock()
                .ok()
                .and_then(|mut cache| cache.get_existing_output(&key));
            if let Some(entry) = cached {
                self.studio
                    .record_cache_hit(task.settings.operation.as_str(), &model, &opts)?;
                return Ok(ItemResult {
                    model: Some(model),
                    image_path: entry.get("image_path").and_then(Value::as_str).map(PathBuf::from),
                    receipt_path: entry
                        .get("receipt_path")
                        .and_then(Value::as_str)
                        .map(PathBuf::from),
                    ..empty_result(task, ItemStatus::Skipped)
                });
            }
        }

        opts.output_dir = Some(self.options.out_dir.join(&task.sku));
        opts.file_stem = Some(task.file_stem());
        let output = dispatch(self.studio, task, &opts)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.set(
                &key,
                map_object(json!({
                    "image_path": output.image_path.to_string_lossy().to_string(),
                    "receipt_path": output.receipt_path.to_string_lossy().to_string(),
                    "model": output.model,
                    "cost_usd": output.cost_usd,
                })),
            )?;
        }
        Ok(ItemResult {
            model: Some(output.model),
            image_path: Some(output.image_path),
            receipt_path: Some(output.receipt_path),
            cost_usd: output.cost_usd,
            warnings: output.warnings,
            ..empty_result(task, ItemStatus::Succeeded)
        })
    }

    fn notice_cancel(&self, task: &BatchTask) {
        let scope = if self.handle.is_cancelled() {
            String::new()
        } else {
            task.sku.clone()
        };
        let first = self
            .cancel_notices
            .lock()
            .map(|mut seen| seen.insert(scope.clone()))
            .unwrap_or(false);
        if first {
            let sku = (!scope.is_empty()).then_some(scope);
            self.log(&self.events, "batch_cancel_requested", json!({ "sku": sku }));
        }
    }
}

fn dispatch(studio: &Studio, task: &BatchTask, opts: &OpOptions) -> Result<StudioOutput> {
    let Some(primary) = task.files.first() else {
        bail!("{} has no images", task.sku);
    };
    let settings = &task.settings;
    match settings.operation {
        BatchOperation::ModelPhoto => {
            studio.model_photo(&task.files, &task.brief(), &settings.aspect_ratio, opts)
        }
        BatchOperation::Pose => {
            let Some(pose) = settings.pose.as_deref().or(settings.prompt.as_deref()) else {
                bail!("{} needs a pose or prompt for a pose variation", task.sku);
            };
            studio.pose_variation(primary, pose, Some(&settings.aspect_ratio), opts)
        }
        BatchOperation::Expand => studio.expand(
            primary,
            &ExpandSpec::ToRatio(settings.aspect_ratio.clone()),
            opts,
        ),
        BatchOperation::Edit => {
            let Some(instruction) = settings.prompt.as_deref() else {
                bail!("{} needs a prompt for an edit", task.sku);
            };
            studio.retouch(primary, &Selection::Whole, instruction, opts)
        }
    }
}

/// Hash of everything that changes the output: product, variation,
/// resolved settings, model and the bytes of every input file.
fn cache_key(task: &BatchTask, model: &str) -> Result<String> {
    let digests = task
        .files
        .iter()
        .map(|path| file_digest(path))
        .collect::<Result<Vec<_>>>()?;
    let settings = &task.settings;
    Ok(stable_hash(&json!({
        "sku": task.sku,
        "variation": task.variation,
        "operation": settings.operation,
        "prompt": settings.prompt,
        "model_description": settings.model_description,
        "pose": settings.pose,
        "background": settings.background,
        "aspect_ratio": settings.aspect_ratio,
        "image_size": settings.image_size,
        "context": settings.context,
        "model": model,
        "inputs": digests,
    })))
}

fn empty_result(task: &BatchTask, status: ItemStatus) -> ItemResult {
    ItemResult {
        sku: task.sku.clone(),
        variation: task.variation,
        operation: task.settings.operation.to_string(),
        status,
        model: None,
        image_path: None,
        receipt_path: None,
        cost_usd: 0.0,
        error: None,
        warnings: Vec::new(),
    }
}
