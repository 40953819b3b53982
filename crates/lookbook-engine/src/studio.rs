use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};
use lookbook_contracts::aspect::snap_aspect_ratio;
use lookbook_contracts::events::EventWriter;
use lookbook_contracts::identity::Session;
use lookbook_contracts::ledger::{LedgerEntry, LedgerStatus, LedgerWriter};
use lookbook_contracts::models::{ModelSelection, ModelSelector, CAPABILITY_EDIT, CAPABILITY_GENERATE};
use lookbook_contracts::runs::receipts::{
    build_receipt, write_receipt, GenerationRequest, InputImageRef, ReceiptParts,
    ResolvedGeneration,
};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::canvas::{CropRect, ExpandSpec, Selection, MAX_RESIZE_SIDE};
use crate::config::StudioConfig;
use crate::data_url::DataUrl;
use crate::gemini::GeminiProvider;
use crate::pricing::{CostEstimate, PricingTables, RequestShape};
use crate::prompts::{self, ModelBrief, SourceImage};
use crate::provider::{DryrunProvider, GenerationCall, PromptPart, ProviderRegistry};
use crate::util::{error_chain_text, map_object, now_utc_iso, short_id};

/// Per-call knobs. Batch runs use `output_dir`/`file_stem` to place files
/// and `batch_id`/`sku` to tag ledger entries.
#[derive(Debug, Clone, Default)]
pub struct OpOptions {
    pub model: Option<String>,
    pub image_size: Option<String>,
    pub provider_options: Map<String, Value>,
    pub output_dir: Option<PathBuf>,
    pub file_stem: Option<String>,
    pub batch_id: Option<String>,
    pub sku: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudioOutput {
    pub artifact_id: String,
    pub operation: String,
    pub image_path: PathBuf,
    pub receipt_path: PathBuf,
    pub mime: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub provider: String,
    pub model: String,
    pub aspect_ratio: Option<String>,
    pub cost_usd: f64,
    pub latency_s: f64,
    pub fallback_reason: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostLatencyMetrics {
    pub provider: String,
    pub model: String,
    pub cost_total_usd: f64,
    pub cost_per_1k_images_usd: f64,
    pub latency_per_image_s: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostPreview {
    pub operation: String,
    pub model: String,
    pub provider: String,
    pub fallback_reason: Option<String>,
    pub estimate: CostEstimate,
}

/// Context on errors from a provider call that reached the provider. Holds
/// what the ledger billed for it.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationFailure {
    pub operation: String,
    pub cost_usd: f64,
}

impl GenerationFailure {
    /// Billed cost of the failed call behind `err`, zero when nothing was sent.
    pub fn billed_cost(err: &anyhow::Error) -> f64 {
        err.downcast_ref::<Self>()
            .map_or(0.0, |failure| failure.cost_usd)
    }
}

impl fmt::Display for GenerationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} generation failed", self.operation)
    }
}

struct Job {
    operation: &'static str,
    parts: Vec<PromptPart>,
    aspect_ratio: Option<String>,
    warnings: Vec<String>,
    metadata: Map<String, Value>,
    resize_to: Option<(u32, u32)>,
}

/// Entry point for every generation. Selects the model, calls the provider,
/// then writes the image, its receipt, a ledger line and the events.
pub struct Studio {
    out_dir: PathBuf,
    session: Session,
    events: EventWriter,
    ledger: LedgerWriter,
    selector: ModelSelector,
    providers: ProviderRegistry,
    pricing: PricingTables,
    default_model: Option<String>,
    last_metrics: Mutex<Option<CostLatencyMetrics>>,
}

impl Studio {
    pub fn new(
        config: &StudioConfig,
        session: Session,
        out_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let out_dir = out_dir.into();
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("failed creating {}", out_dir.display()))?;
        let run_id = out_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("lookbook")
            .to_string();
        let events = EventWriter::new(events_path.into(), run_id);
        events.emit(
            "run_started",
            map_object(json!({
                "out_dir": out_dir.to_string_lossy().to_string(),
                "user_id": session.user_id,
            })),
        )?;

        Ok(Self {
            out_dir,
            session,
            events,
            ledger: LedgerWriter::new(config.ledger_path()),
            selector: ModelSelector::new(None),
            providers: default_provider_registry(config),
            pricing: PricingTables::load(Some(&config.pricing_overrides_path())),
            default_model: config.image_model.clone(),
            last_metrics: Mutex::new(None),
        })
    }

    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    pub fn set_default_model(&mut self, model: Option<String>) {
        self.default_model = model;
    }

    pub fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    pub fn ledger(&self) -> &LedgerWriter {
        &self.ledger
    }

    pub fn selector(&self) -> &ModelSelector {
        &self.selector
    }

    pub fn last_cost_latency(&self) -> Option<CostLatencyMetrics> {
        self.last_metrics.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn finish(&self) -> Result<()> {
        self.events.emit(
            "run_finished",
            map_object(json!({
                "out_dir": self.out_dir.to_string_lossy().to_string(),
            })),
        )?;
        Ok(())
    }

    pub fn model_photo(
        &self,
        garments: &[PathBuf],
        brief: &ModelBrief,
        aspect_ratio: &str,
        opts: &OpOptions,
    ) -> Result<StudioOutput> {
        if garments.is_empty() {
            bail!("model photo needs at least one garment image");
        }
        let selection = self.select(opts, CAPABILITY_GENERATE)?;
        let mut warnings = Vec::new();
        let max_inputs = selection.model.max_input_images.max(1) as usize;
        let used = if garments.len() > max_inputs {
            warnings.push(format!(
                "{} accepts {max_inputs} input images; using the first {max_inputs} of {}.",
                selection.model.name,
                garments.len()
            ));
            &garments[..max_inputs]
        } else {
            garments
        };
        let sources = used
            .iter()
            .map(|path| load_source(path))
            .collect::<Result<Vec<_>>>()?;
        let Some(snapped) = snap_aspect_ratio(aspect_ratio) else {
            bail!("unrecognised aspect ratio '{aspect_ratio}'");
        };
        warnings.extend(snapped.warning);

        self.generate(
            selection,
            opts,
            Job {
                operation: "model_photo",
                parts: prompts::model_photo(&sources, brief),
                aspect_ratio: Some(snapped.ratio),
                warnings,
                metadata: map_object(json!({ "garments": used.len() })),
                resize_to: None,
            },
        )
    }

    pub fn retouch(
        &self,
        image: &Path,
        selection: &Selection,
        instruction: &str,
        opts: &OpOptions,
    ) -> Result<StudioOutput> {
        if instruction.trim().is_empty() {
            bail!("retouch needs an instruction");
        }
        let source = load_source(image)?;
        let parts = match selection {
            Selection::Whole => prompts::retouch_whole(&source, instruction),
            Selection::Point(hotspot) => {
                if hotspot.x >= source.dims.0 || hotspot.y >= source.dims.1 {
                    bail!(
                        "point ({}, {}) is outside the {}x{} image",
                        hotspot.x,
                        hotspot.y,
                        source.dims.0,
                        source.dims.1
                    );
                }
                prompts::retouch_point(&source, *hotspot, instruction)
            }
            Selection::Mask(mask) => {
                if mask.dimensions() != source.dims {
                    bail!(
                        "mask is {}x{} but the image is {}x{}",
                        mask.dimensions().0,
                        mask.dimensions().1,
                        source.dims.0,
                        source.dims.1
                    );
                }
                if mask.is_empty() {
                    bail!("mask is empty; paint the area to edit first");
                }
                prompts::retouch_mask(&source, mask.to_data_url()?, instruction)
            }
        };
        let mut metadata = map_object(json!({ "selection": selection.kind() }));
        match selection {
            Selection::Point(hotspot) => {
                metadata.insert("hotspot".to_string(), json!([hotspot.x, hotspot.y]));
            }
            Selection::Mask(mask) => {
                metadata.insert("mask_coverage".to_string(), json!(mask.coverage()));
            }
            Selection::Whole => {}
        }

        let model = self.select(opts, CAPABILITY_EDIT)?;
        self.generate(
            model,
            opts,
            Job {
                operation: "retouch",
                parts,
                aspect_ratio: ratio_for_dims(source.dims),
                warnings: Vec::new(),
                metadata,
                resize_to: None,
            },
        )
    }

    pub fn expand(&self, image: &Path, spec: &ExpandSpec, opts: &OpOptions) -> Result<StudioOutput> {
        let decoded = decode_path(image)?;
        let canvas = spec.build(&decoded)?;
        let padded = SourceImage {
            source: format!("{}#padded", image.display()),
            dims: canvas.image.dimensions(),
            image: DataUrl::from_image(&canvas.image)?,
        };
        let model = self.select(opts, CAPABILITY_EDIT)?;
        self.generate(
            model,
            opts,
            Job {
                operation: "expand",
                parts: prompts::expand(&padded, canvas.original),
                aspect_ratio: Some(canvas.aspect_ratio),
                warnings: canvas.warnings,
                metadata: map_object(json!({
                    "original_box": canvas.original,
                    "padded_size": [padded.dims.0, padded.dims.1],
                })),
                resize_to: None,
            },
        )
    }

    pub fn pose_variation(
        &self,
        image: &Path,
        pose: &str,
        aspect_ratio: Option<&str>,
        opts: &OpOptions,
    ) -> Result<StudioOutput> {
        if pose.trim().is_empty() {
            bail!("pose variation needs a pose description");
        }
        let source = load_source(image)?;
        let mut warnings = Vec::new();
        let ratio = match aspect_ratio {
            Some(raw) => {
                let Some(snapped) = snap_aspect_ratio(raw) else {
                    bail!("unrecognised aspect ratio '{raw}'");
                };
                warnings.extend(snapped.warning);
                Some(snapped.ratio)
            }
            None => ratio_for_dims(source.dims),
        };
        let model = self.select(opts, CAPABILITY_EDIT)?;
        self.generate(
            model,
            opts,
            Job {
                operation: "pose",
                parts: prompts::pose_variation(&source, pose),
                aspect_ratio: ratio,
                warnings,
                metadata: map_object(json!({ "pose": pose.trim() })),
                resize_to: None,
            },
        )
    }

    /// Crops locally, then sends the crop through one refine call.
    pub fn crop(&self, image: &Path, rect: CropRect, opts: &OpOptions) -> Result<StudioOutput> {
        let decoded = decode_path(image)?;
        let (width, height) = decoded.dimensions();
        if rect.width == 0
            || rect.height == 0
            || rect.x.saturating_add(rect.width) > width
            || rect.y.saturating_add(rect.height) > height
        {
            bail!("crop rectangle does not fit the {width}x{height} image");
        }
        let cropped = rect.apply(&decoded);
        let source = SourceImage {
            source: format!("{}#crop", image.display()),
            dims: cropped.dimensions(),
            image: DataUrl::from_image(&cropped)?,
        };
        let model = self.select(opts, CAPABILITY_EDIT)?;
        self.generate(
            model,
            opts,
            Job {
                operation: "crop",
                parts: prompts::refine(&source, "This photograph was just cropped."),
                aspect_ratio: ratio_for_dims(source.dims),
                warnings: Vec::new(),
                metadata: map_object(json!({ "crop": rect })),
                resize_to: None,
            },
        )
    }

    /// Resizes locally, refines, then scales the result to exactly `width`x`height`.
    pub fn resize(&self, image: &Path, width: u32, height: u32, opts: &OpOptions) -> Result<StudioOutput> {
        if width == 0 || height == 0 || width > MAX_RESIZE_SIDE || height > MAX_RESIZE_SIDE {
            bail!("resize target must be between 1 and {MAX_RESIZE_SIDE} pixels per side");
        }
        let decoded = decode_path(image)?;
        let resized = decoded.resize_exact(width, height, FilterType::Lanczos3);
        let source = SourceImage {
            source: format!("{}#resize", image.display()),
            dims: (width, height),
            image: DataUrl::from_image(&resized)?,
        };
        let model = self.select(opts, CAPABILITY_EDIT)?;
        self.generate(
            model,
            opts,
            Job {
                operation: "resize",
                parts: prompts::refine(
                    &source,
                    &format!("This photograph was just resized to {width}x{height}."),
                ),
                aspect_ratio: ratio_for_dims((width, height)),
                warnings: Vec::new(),
                metadata: map_object(json!({ "target_size": [width, height] })),
                resize_to: Some((width, height)),
            },
        )
    }

    pub fn refine(&self, image: &Path, note: &str, opts: &OpOptions) -> Result<StudioOutput> {
        let source = load_source(image)?;
        let model = self.select(opts, CAPABILITY_EDIT)?;
        self.generate(
            model,
            opts,
            Job {
                operation: "refine",
                parts: prompts::refine(&source, note),
                aspect_ratio: ratio_for_dims(source.dims),
                warnings: Vec::new(),
                metadata: Map::new(),
                resize_to: None,
            },
        )
    }

    pub fn preview_cost(
        &self,
        operation: &str,
        shape: &RequestShape,
        opts: &OpOptions,
    ) -> Result<CostPreview> {
        let capability = if operation == "model_photo" {
            CAPABILITY_GENERATE
        } else {
            CAPABILITY_EDIT
        };
        let selection = self.select(opts, capability)?;
        let mut shape = shape.clone();
        if shape.image_size.is_none() {
            shape.image_size = opts.image_size.clone();
        }
        Ok(CostPreview {
            operation: operation.to_string(),
            estimate: self
                .pricing
                .estimate(selection.model.pricing_key.as_deref(), &shape),
            model: selection.model.name,
            provider: selection.model.provider,
            fallback_reason: selection.fallback_reason,
        })
    }

    /// Ledger line for work served from the result cache.
    pub fn record_cache_hit(&self, operation: &str, model: &str, opts: &OpOptions) -> Result<()> {
        self.ledger.record(LedgerEntry {
            ts: String::new(),
            user_id: self.session.user_id.clone(),
            operation: operation.to_string(),
            model: model.to_string(),
            input_images: 0,
            input_text_tokens: 0,
            output_images: 1,
            cost_usd: 0.0,
            status: LedgerStatus::Cached,
            batch_id: opts.batch_id.clone(),
            sku: opts.sku.clone(),
        })?;
        Ok(())
    }

    pub fn select(&self, opts: &OpOptions, capability: &str) -> Result<ModelSelection> {
        let requested = opts.model.as_deref().or(self.default_model.as_deref());
        self.selector
            .select(requested, capability)
            .map_err(anyhow::Error::msg)
    }

    fn generate(&self, selection: ModelSelection, opts: &OpOptions, job: Job) -> Result<StudioOutput> {
        let model = selection.model;
        let fallback_reason = selection.fallback_reason;
        let mut warnings = job.warnings;
        if let Some(reason) = fallback_reason.clone() {
            warnings.push(reason);
        }

        let call = GenerationCall {
            model: model.name.clone(),
            parts: job.parts,
            aspect_ratio: job.aspect_ratio.clone(),
            image_size: opts.image_size.clone(),
            provider_options: opts.provider_options.clone(),
            metadata: job.metadata.clone(),
        };
        let input_images = call.input_image_count();
        if input_images > model.max_input_images {
            bail!(
                "{} accepts at most {} input images ({} given)",
                model.name,
                model.max_input_images,
                input_images
            );
        }
        let prompt = call.prompt_text();
        let mut shape = RequestShape {
            input_images,
            text_chars: prompt.chars().count() as u64,
            output_images: 1,
            image_size: opts.image_size.clone(),
            output_dims: None,
        };
        let planned = self.pricing.estimate(model.pricing_key.as_deref(), &shape);
        let events = match &opts.sku {
            Some(sku) => self.events.scoped("sku", sku.as_str()),
            None => self.events.clone(),
        };
        events.emit(
            "plan_preview",
            map_object(json!({
                "plan": {
                    "operation": job.operation,
                    "images": 1,
                    "model": model.name,
                    "provider": model.provider,
                    "aspect_ratio": job.aspect_ratio,
                    "image_size": opts.image_size,
                    "input_images": input_images,
                    "estimated_cost_usd": planned.total_usd,
                    "fallback_reason": fallback_reason,
                }
            })),
        )?;

        let Some(provider) = self.providers.get(&model.provider) else {
            let error = format!(
                "provider '{}' not registered (available: [{}])",
                model.provider,
                self.providers.names().join(", ")
            );
            self.record_failure(job.operation, &model.name, &planned, 0.0, &shape, opts)?;
            events.emit(
                "generation_failed",
                map_object(json!({
                    "operation": job.operation,
                    "provider": model.provider,
                    "model": model.name,
                    "error": error,
                })),
            )?;
            bail!("{error}");
        };

        events.emit(
            "generation_started",
            map_object(json!({
                "operation": job.operation,
                "provider": model.provider,
                "model": model.name,
            })),
        )?;
        let started = Instant::now();
        let outcome = match provider.generate(&call) {
            Ok(outcome) => outcome,
            Err(err) => {
                let error_text = error_chain_text(&err, 2048);
                let failed = self.record_failure(
                    job.operation,
                    &model.name,
                    &planned,
                    planned.input_cost_usd,
                    &shape,
                    opts,
                )?;
                let metrics = self.metrics(
                    &model.provider,
                    &model.name,
                    model.latency_key.as_deref(),
                    &planned,
                    failed.cost_usd,
                    started.elapsed().as_secs_f64(),
                );
                self.emit_cost_latency(&events, metrics)?;
                events.emit(
                    "generation_failed",
                    map_object(json!({
                        "operation": job.operation,
                        "provider": model.provider,
                        "model": model.name,
                        "error": error_text,
                    })),
                )?;
                return Err(err).context(GenerationFailure {
                    operation: job.operation.to_string(),
                    cost_usd: failed.cost_usd,
                });
            }
        };
        let latency_s = started.elapsed().as_secs_f64();
        warnings.extend(outcome.warnings.iter().cloned());

        let mut image = outcome.image;
        let mut dims = data_url_dims(&image);
        if let Some((width, height)) = job.resize_to {
            if dims != Some((width, height)) {
                let resized = image
                    .decode_image()?
                    .resize_exact(width, height, FilterType::Lanczos3);
                image = DataUrl::from_image(&resized)?;
                dims = Some((width, height));
            }
        }

        let out_dir = opts.output_dir.clone().unwrap_or_else(|| self.out_dir.clone());
        let stamp = chrono::Utc::now().timestamp_millis();
        let artifact_id = format!(
            "{}-{}-{}",
            job.operation,
            stamp,
            short_id(&prompt, stamp as u64)
        );
        let stem = opts.file_stem.clone().unwrap_or_else(|| artifact_id.clone());
        let image_path = out_dir.join(format!("{stem}.{}", image.extension()));
        let receipt_path = out_dir.join(format!("receipt-{stem}.json"));
        image.write_to(&image_path)?;

        shape.output_dims = dims;
        let cost = self.pricing.estimate(model.pricing_key.as_deref(), &shape);
        let metrics = self.metrics(
            &model.provider,
            &model.name,
            model.latency_key.as_deref(),
            &cost,
            cost.total_usd,
            latency_s,
        );

        let request = GenerationRequest {
            operation: job.operation.to_string(),
            prompt: prompt.clone(),
            model: opts.model.clone().or_else(|| self.default_model.clone()),
            aspect_ratio: job.aspect_ratio.clone(),
            image_size: opts.image_size.clone(),
            inputs: call
                .input_images()
                .map(|(role, source, data)| {
                    let dims = data_url_dims(data);
                    InputImageRef {
                        role: role.to_string(),
                        source: source.to_string(),
                        mime: data.mime.clone(),
                        width: dims.map(|value| value.0),
                        height: dims.map(|value| value.1),
                    }
                })
                .collect(),
            provider_options: opts.provider_options.clone(),
            metadata: job.metadata,
        };
        let resolved = ResolvedGeneration {
            provider: model.provider.clone(),
            model: model.name.clone(),
            aspect_ratio: job.aspect_ratio.clone(),
            image_size: cost.size_tier.clone(),
            width: dims.map(|value| value.0),
            height: dims.map(|value| value.1),
            mime: image.mime.clone(),
            fallback_reason: fallback_reason.clone(),
            warnings: warnings.clone(),
        };
        let result_metadata = map_object(json!({
            "artifact_id": artifact_id,
            "user_id": self.session.user_id,
            "batch_id": opts.batch_id,
            "sku": opts.sku,
            "cost": cost,
            "latency_s": latency_s,
            "model_text": outcome.text,
        }));
        let receipt = build_receipt(&ReceiptParts {
            request: &request,
            resolved: &resolved,
            provider_request: &outcome.provider_request,
            provider_response: &outcome.provider_response,
            image_path: &image_path,
            receipt_path: &receipt_path,
            result_metadata: &result_metadata,
        });
        write_receipt(&receipt_path, &receipt)?;

        self.ledger.record(LedgerEntry {
            ts: now_utc_iso(),
            user_id: self.session.user_id.clone(),
            operation: job.operation.to_string(),
            model: model.name.clone(),
            input_images,
            input_text_tokens: cost.input_text_tokens,
            output_images: 1,
            cost_usd: cost.total_usd,
            status: LedgerStatus::Succeeded,
            batch_id: opts.batch_id.clone(),
            sku: opts.sku.clone(),
        })?;

        events.emit(
            "artifact_created",
            map_object(json!({
                "artifact_id": artifact_id,
                "operation": job.operation,
                "image_path": image_path.to_string_lossy().to_string(),
                "receipt_path": receipt_path.to_string_lossy().to_string(),
                "width": dims.map(|value| value.0),
                "height": dims.map(|value| value.1),
                "warnings": warnings,
            })),
        )?;
        self.emit_cost_latency(&events, metrics)?;

        Ok(StudioOutput {
            artifact_id,
            operation: job.operation.to_string(),
            image_path,
            receipt_path,
            mime: image.mime,
            width: dims.map(|value| value.0),
            height: dims.map(|value| value.1),
            provider: model.provider,
            model: model.name,
            aspect_ratio: job.aspect_ratio,
            cost_usd: cost.total_usd,
            latency_s,
            fallback_reason,
            warnings,
        })
    }

    /// Failed calls produce no image; `cost_usd` is what the provider billed.
    fn record_failure(
        &self,
        operation: &str,
        model: &str,
        planned: &CostEstimate,
        cost_usd: f64,
        shape: &RequestShape,
        opts: &OpOptions,
    ) -> Result<LedgerEntry> {
        self.ledger.record(LedgerEntry {
            ts: String::new(),
            user_id: self.session.user_id.clone(),
            operation: operation.to_string(),
            model: model.to_string(),
            input_images: shape.input_images,
            input_text_tokens: planned.input_text_tokens,
            output_images: 0,
            cost_usd,
            status: LedgerStatus::Failed,
            batch_id: opts.batch_id.clone(),
            sku: opts.sku.clone(),
        })
    }

    fn metrics(
        &self,
        provider: &str,
        model: &str,
        latency_key: Option<&str>,
        estimate: &CostEstimate,
        cost_total_usd: f64,
        measured_latency: f64,
    ) -> CostLatencyMetrics {
        CostLatencyMetrics {
            provider: provider.to_string(),
            model: model.to_string(),
            cost_total_usd,
            cost_per_1k_images_usd: estimate.cost_per_image_usd * 1000.0,
            latency_per_image_s: self.pricing.latency_per_image(latency_key, measured_latency),
        }
    }

    fn emit_cost_latency(&self, events: &EventWriter, metrics: CostLatencyMetrics) -> Result<()> {
        events.emit(
            "cost_latency_update",
            map_object(json!({
                "provider": metrics.provider,
                "model": metrics.model,
                "cost_total_usd": metrics.cost_total_usd,
                "cost_per_1k_images_usd": metrics.cost_per_1k_images_usd,
                "latency_per_image_s": metrics.latency_per_image_s,
            })),
        )?;
        if let Ok(mut guard) = self.last_metrics.lock() {
            *guard = Some(metrics);
        }
        Ok(())
    }
}

pub fn default_provider_registry(config: &StudioConfig) -> ProviderRegistry {
    let mut providers = ProviderRegistry::new();
    providers.register(DryrunProvider);
    providers.register(GeminiProvider::new(
        Some(&config.api_base),
        config.api_key.clone(),
    ));
    providers
}

pub fn load_source(path: &Path) -> Result<SourceImage> {
    let image = DataUrl::from_path(path)?;
    let Some(dims) = data_url_dims(&image) else {
        bail!("{} is not a readable image", path.display());
    };
    Ok(SourceImage {
        source: path.to_string_lossy().to_string(),
        image,
        dims,
    })
}

fn decode_path(path: &Path) -> Result<DynamicImage> {
    image::open(path).with_context(|| format!("failed decoding {}", path.display()))
}

fn data_url_dims(image: &DataUrl) -> Option<(u32, u32)> {
    ImageReader::new(Cursor::new(&image.bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

fn ratio_for_dims(dims: (u32, u32)) -> Option<String> {
    snap_aspect_ratio(&format!("{}x{}", dims.0, dims.1)).map(|snapped| snapped.ratio)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use anyhow::bail;
    use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
    use lookbook_contracts::events::read_events;
    use lookbook_contracts::identity::Session;
    use lookbook_contracts::ledger::{read_ledger, LedgerStatus};
    use serde_json::Value;

    use super::{GenerationFailure, OpOptions, Studio};
    use crate::canvas::{CropRect, ExpandSpec, Hotspot, MaskCanvas, Selection};
    use crate::config::StudioConfig;
    use crate::pricing::RequestShape;
    use crate::prompts::ModelBrief;
    use crate::provider::{
        DryrunProvider, GenerationCall, GenerationOutcome, GenerationProvider, ProviderRegistry,
    };

    struct FailingProvider {
        calls: Arc<AtomicUsize>,
    }

    impl GenerationProvider for FailingProvider {
        fn name(&self) -> &str {
            "gemini"
        }

        fn generate(&self, _call: &GenerationCall) -> anyhow::Result<GenerationOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            bail!("Gemini blocked the prompt (SAFETY)")
        }
    }

    fn write_png(path: &Path, width: u32, height: u32) -> anyhow::Result<PathBuf> {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([200, 180, 160])))
            .save(path)?;
        Ok(path.to_path_buf())
    }

    fn studio(root: &Path) -> anyhow::Result<Studio> {
        let mut config = StudioConfig::local(root.join("home"));
        config.image_model = Some("dryrun-image-1".to_string());
        Studio::new(
            &config,
            Session::local(),
            root.join("out"),
            root.join("out").join("events.jsonl"),
        )
    }

    fn event_types(studio: &Studio) -> anyhow::Result<Vec<String>> {
        Ok(read_events(studio.events().path())?
            .iter()
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    #[test]
    fn model_photo_writes_image_receipt_ledger_and_events() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let garment = write_png(&temp.path().join("ts1001_front.png"), 40, 60)?;
        let studio = studio(temp.path())?;

        let output = studio.model_photo(
            &[garment],
            &ModelBrief::default(),
            "portrait",
            &OpOptions::default(),
        )?;
        assert!(output.image_path.is_file());
        assert!(output.receipt_path.is_file());
        assert_eq!(output.model, "dryrun-image-1");
        assert_eq!(output.aspect_ratio.as_deref(), Some("3:4"));
        assert_eq!((output.width, output.height), (Some(768), Some(1024)));

        let receipt: Value = serde_json::from_str(&std::fs::read_to_string(&output.receipt_path)?)?;
        assert_eq!(receipt["request"]["operation"], "model_photo");
        assert_eq!(receipt["request"]["inputs"][0]["role"], "garment");
        assert_eq!(receipt["request"]["inputs"][0]["width"], 40);

        let ledger = read_ledger(studio.ledger().path())?;
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].status, LedgerStatus::Succeeded);
        assert_eq!(ledger[0].user_id, "local");
        assert_eq!(ledger[0].input_images, 1);

        let types = event_types(&studio)?;
        let position = |name: &str| types.iter().position(|value| value == name);
        assert!(position("run_started") < position("plan_preview"));
        assert!(position("plan_preview") < position("generation_started"));
        assert!(position("generation_started") < position("artifact_created"));
        assert!(position("artifact_created") < position("cost_latency_update"));
        assert!(studio.last_cost_latency().is_some());
        Ok(())
    }

    #[test]
    fn provider_failure_logs_failed_ledger_entry() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = write_png(&temp.path().join("shirt.png"), 32, 32)?;
        let calls = Arc::new(AtomicUsize::new(0));
        let mut providers = ProviderRegistry::new();
        providers.register(FailingProvider {
            calls: Arc::clone(&calls),
        });
        let studio = studio(temp.path())?.with_providers(providers);

        let opts = OpOptions {
            model: Some("gemini-2.5-flash-image".to_string()),
            ..OpOptions::default()
        };
        let Err(err) = studio.retouch(&image, &Selection::Whole, "remove lint", &opts) else {
            bail!("retouch should fail");
        };
        let text = format!("{err:#}");
        assert!(text.contains("retouch generation failed"));
        assert!(text.contains("SAFETY"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let ledger = read_ledger(studio.ledger().path())?;
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].status, LedgerStatus::Failed);
        assert_eq!(ledger[0].output_images, 0);
        assert!(ledger[0].cost_usd > 0.0);
        assert_eq!(GenerationFailure::billed_cost(&err), ledger[0].cost_usd);
        assert!(event_types(&studio)?.contains(&"generation_failed".to_string()));
        Ok(())
    }

    #[test]
    fn retouch_validates_selection() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = write_png(&temp.path().join("shirt.png"), 20, 20)?;
        let studio = studio(temp.path())?;
        let opts = OpOptions::default();

        let outside = Selection::Point(Hotspot { x: 25, y: 1 });
        assert!(studio.retouch(&image, &outside, "fix", &opts).is_err());
        let empty = Selection::Mask(MaskCanvas::new(20, 20));
        assert!(studio.retouch(&image, &empty, "fix", &opts).is_err());
        let wrong_size = Selection::Mask(MaskCanvas::new(10, 10));
        assert!(studio.retouch(&image, &wrong_size, "fix", &opts).is_err());
        assert!(studio.retouch(&image, &Selection::Whole, "  ", &opts).is_err());

        let mut mask = MaskCanvas::new(20, 20);
        mask.invert();
        let output = studio.retouch(&image, &Selection::Mask(mask), "navy collar", &opts)?;
        assert_eq!(output.operation, "retouch");
        assert_eq!(read_ledger(studio.ledger().path())?.len(), 1);
        Ok(())
    }

    #[test]
    fn crop_and_resize_make_one_call_each() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = write_png(&temp.path().join("look.png"), 300, 400)?;
        let studio = studio(temp.path())?;
        let opts = OpOptions::default();

        let rect = CropRect {
            x: 0,
            y: 0,
            width: 300,
            height: 300,
        };
        let cropped = studio.crop(&image, rect, &opts)?;
        assert_eq!(cropped.aspect_ratio.as_deref(), Some("1:1"));
        let too_big = CropRect {
            x: 10,
            y: 0,
            width: 300,
            height: 10,
        };
        assert!(studio.crop(&image, too_big, &opts).is_err());

        let resized = studio.resize(&image, 120, 150, &opts)?;
        let decoded = image::open(&resized.image_path)?;
        assert_eq!(decoded.dimensions(), (120, 150));
        assert!(studio.resize(&image, 0, 150, &opts).is_err());

        let ops: Vec<String> = read_ledger(studio.ledger().path())?
            .into_iter()
            .map(|entry| entry.operation)
            .collect();
        assert_eq!(ops, vec!["crop".to_string(), "resize".to_string()]);
        Ok(())
    }

    #[test]
    fn expand_and_pose_use_requested_shapes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = write_png(&temp.path().join("look.png"), 300, 400)?;
        let studio = studio(temp.path())?;
        let opts = OpOptions {
            output_dir: Some(temp.path().join("custom")),
            file_stem: Some("TS1-expand-01".to_string()),
            sku: Some("TS1".to_string()),
            ..OpOptions::default()
        };
        let expanded = studio.expand(&image, &ExpandSpec::ToRatio("16:9".to_string()), &opts)?;
        assert_eq!(expanded.aspect_ratio.as_deref(), Some("16:9"));
        assert_eq!(expanded.image_path, temp.path().join("custom").join("TS1-expand-01.png"));

        let pose = studio.pose_variation(&image, "hands in pockets", Some("1080x1350"), &OpOptions::default())?;
        assert_eq!(pose.aspect_ratio.as_deref(), Some("4:5"));
        assert_eq!(pose.warnings.len(), 1);
        assert!(studio.pose_variation(&image, " ", None, &OpOptions::default()).is_err());

        let sku_events = read_events(studio.events().path())?
            .into_iter()
            .filter(|row| row.get("sku").and_then(Value::as_str) == Some("TS1"))
            .count();
        assert!(sku_events >= 3);
        Ok(())
    }

    #[test]
    fn preview_cost_prices_request_shape() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let studio = studio(temp.path())?;
        let preview = studio.preview_cost(
            "model_photo",
            &RequestShape {
                input_images: 3,
                text_chars: 800,
                output_images: 2,
                ..RequestShape::default()
            },
            &OpOptions {
                model: Some("gemini-3-pro-image-preview".to_string()),
                image_size: Some("4K".to_string()),
                ..OpOptions::default()
            },
        )?;
        assert_eq!(preview.model, "gemini-3-pro-image-preview");
        assert_eq!(preview.estimate.size_tier.as_deref(), Some("4K"));
        assert_eq!(preview.estimate.input_tokens, 3 * 560 + 200);
        assert!((preview.estimate.output_cost_usd - 0.48).abs() < 1e-9);
        assert!(read_ledger(studio.ledger().path())?.is_empty());
        Ok(())
    }

    #[test]
    fn missing_provider_fails_without_calling() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = write_png(&temp.path().join("shirt.png"), 16, 16)?;
        let mut providers = ProviderRegistry::new();
        providers.register(DryrunProvider);
        let studio = studio(temp.path())?.with_providers(providers);
        let opts = OpOptions {
            model: Some("gemini-2.5-flash-image".to_string()),
            ..OpOptions::default()
        };
        let Err(err) = studio.refine(&image, "sharpen", &opts) else {
            bail!("refine should fail without a gemini provider");
        };
        assert!(err.to_string().contains("provider 'gemini' not registered"));
        assert_eq!(GenerationFailure::billed_cost(&err), 0.0);
        let ledger = read_ledger(studio.ledger().path())?;
        assert_eq!(ledger[0].status, LedgerStatus::Failed);
        assert_eq!(ledger[0].cost_usd, 0.0);
        Ok(())
    }
}
