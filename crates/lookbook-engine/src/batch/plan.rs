use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::{bail, Result};
use lookbook_contracts::catalog::{
    group_products, resolve_settings, BatchOperation, ItemSettings, MetadataSheet,
    ResolvedSettings,
};
use lookbook_contracts::models::{CAPABILITY_EDIT, CAPABILITY_GENERATE};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::canvas::CropRect;
use crate::data_url::DataUrl;
use crate::pricing::RequestShape;
use crate::prompts::{self, ModelBrief, SourceImage};
use crate::provider::PromptPart;
use crate::studio::{OpOptions, Studio};
use crate::util::map_object;

#[derive(Debug, Clone, Default)]
pub struct BatchRequest {
    pub name: String,
    pub files: Vec<PathBuf>,
    pub sheet: Option<MetadataSheet>,
    /// Per-SKU overrides, keyed by uppercase SKU.
    pub overrides: BTreeMap<String, ItemSettings>,
    pub defaults: ItemSettings,
    /// Restricts the plan to these SKUs when set.
    pub only_skus: Option<BTreeSet<String>>,
}

/// One generation call: a product and the 1-based variation number.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchTask {
    pub sku: String,
    pub variation: u32,
    pub files: Vec<PathBuf>,
    pub settings: ResolvedSettings,
}

impl BatchTask {
    pub fn file_stem(&self) -> String {
        format!(
            "{}-{}-{:02}",
            self.sku,
            self.settings.operation.as_str(),
            self.variation
        )
    }

    pub fn brief(&self) -> ModelBrief {
        ModelBrief {
            model_description: self.settings.model_description.clone(),
            pose: self.settings.pose.clone(),
            background: self.settings.background.clone(),
            extra_prompt: self.settings.prompt.clone(),
            context: self.settings.context.clone(),
        }
    }

    pub fn options(&self, batch_id: &str) -> OpOptions {
        OpOptions {
            model: self.settings.image_model.clone(),
            image_size: self.settings.image_size.clone(),
            batch_id: Some(batch_id.to_string()),
            sku: Some(self.sku.clone()),
            ..OpOptions::default()
        }
    }

    /// Shape of the request this task would send, priced before any file is read.
    pub fn estimate_shape(&self, max_inputs: usize) -> RequestShape {
        let parts = placeholder_prompt(self, max_inputs);
        let input_images = parts
            .iter()
            .filter(|part| matches!(part, PromptPart::Image { .. }))
            .count() as u32;
        let text_chars = parts
            .iter()
            .map(|part| match part {
                PromptPart::Text(text) => text.chars().count() as u64,
                PromptPart::Image { .. } => 0,
            })
            .sum();
        RequestShape {
            input_images,
            text_chars,
            output_images: 1,
            ..RequestShape::default()
        }
    }

    pub fn capability(&self) -> &'static str {
        match self.settings.operation {
            BatchOperation::ModelPhoto => CAPABILITY_GENERATE,
            _ => CAPABILITY_EDIT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlanEstimate {
    pub calls: usize,
    pub output_images: u64,
    pub total_usd: f64,
    pub by_operation: BTreeMap<String, f64>,
    pub by_model: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchPlan {
    pub batch_id: String,
    pub name: String,
    pub tasks: Vec<BatchTask>,
    pub products: usize,
    pub skipped_files: Vec<PathBuf>,
    pub warnings: Vec<String>,
    pub estimate: PlanEstimate,
}

pub fn plan_batch(studio: &Studio, request: &BatchRequest) -> Result<BatchPlan> {
    let name = request.name.trim();
    if name.is_empty() {
        bail!("batch name must not be empty");
    }
    let grouping = group_products(&request.files);
    let mut warnings = Vec::new();
    for skipped in &grouping.skipped {
        warnings.push(format!("Skipped {}: not a supported image.", skipped.display()));
    }
    if let Some(sheet) = &request.sheet {
        warnings.extend(sheet.warnings.iter().cloned());
        for sku in sheet.skus() {
            if grouping.product(sku).is_none() {
                warnings.push(format!("Sheet row {sku} has no matching images."));
            }
        }
    }

    let mut tasks = Vec::new();
    let mut products = 0;
    for product in &grouping.products {
        if let Some(only) = &request.only_skus {
            if !only.contains(&product.sku) {
                continue;
            }
        }
        let row = request.sheet.as_ref().and_then(|sheet| sheet.get(&product.sku));
        if request.sheet.is_some() && row.is_none() {
            warnings.push(format!(
                "{} has no sheet row; using defaults.",
                product.sku
            ));
        }
        let settings = resolve_settings(
            &product.sku,
            request.overrides.get(&product.sku),
            row,
            &request.defaults,
        );
        warnings.extend(settings.warnings.iter().cloned());
        products += 1;
        for variation in 1..=settings.variations {
            tasks.push(BatchTask {
                sku: product.sku.clone(),
                variation,
                files: product.files.clone(),
                settings: settings.clone(),
            });
        }
    }
    if tasks.is_empty() {
        bail!("batch '{name}' has no products to process");
    }

    let batch_id = format!(
        "batch-{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S"),
        &Uuid::new_v4().simple().to_string()[..8]
    );
    let estimate = estimate_plan(studio, &tasks, &batch_id)?;
    let plan = BatchPlan {
        batch_id,
        name: name.to_string(),
        tasks,
        products,
        skipped_files: grouping.skipped,
        warnings,
        estimate,
    };
    studio.events().scoped("batch_id", plan.batch_id.as_str()).emit(
        "batch_planned",
        map_object(json!({
            "name": plan.name,
            "products": plan.products,
            "tasks": plan.tasks.len(),
            "warnings": plan.warnings,
            "estimated_cost_usd": plan.estimate.total_usd,
        })),
    )?;
    Ok(plan)
}

fn estimate_plan(studio: &Studio, tasks: &[BatchTask], batch_id: &str) -> Result<PlanEstimate> {
    let mut estimate = PlanEstimate::default();
    for task in tasks {
        let opts = task.options(batch_id);
        let selection = studio.select(&opts, task.capability())?;
        let max_inputs = selection.model.max_input_images.max(1) as usize;
        let preview = studio.preview_cost(
            task.settings.operation.as_str(),
            &task.estimate_shape(max_inputs),
            &opts,
        )?;
        estimate.calls += 1;
        estimate.output_images += 1;
        estimate.total_usd += preview.estimate.total_usd;
        *estimate
            .by_operation
            .entry(task.settings.operation.to_string())
            .or_default() += preview.estimate.total_usd;
        *estimate.by_model.entry(preview.model).or_default() += preview.estimate.total_usd;
    }
    Ok(estimate)
}

/// The prompt a task would send, with empty images standing in for its files.
fn placeholder_prompt(task: &BatchTask, max_inputs: usize) -> Vec<PromptPart> {
    let sources: Vec<SourceImage> = task
        .files
        .iter()
        .take(max_inputs)
        .map(|path| SourceImage {
            source: path.to_string_lossy().to_string(),
            image: DataUrl::new("image/png", Vec::new()),
            dims: (1024, 1024),
        })
        .collect();
    let Some(first) = sources.first() else {
        return Vec::new();
    };
    let instruction = task.settings.prompt.clone().unwrap_or_default();
    match task.settings.operation {
        BatchOperation::ModelPhoto => prompts::model_photo(&sources, &task.brief()),
        BatchOperation::Pose => prompts::pose_variation(
            first,
            task.settings.pose.as_deref().unwrap_or(&instruction),
        ),
        BatchOperation::Expand => prompts::expand(
            first,
            CropRect {
                x: 0,
                y: 0,
                width: first.dims.0,
                height: first.dims.1,
            },
        ),
        BatchOperation::Edit => prompts::retouch_whole(first, &instruction),
    }
}
