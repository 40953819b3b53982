use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use lookbook_contracts::catalog::{ItemSettings, MetadataSheet};
use lookbook_contracts::commands::parse_command;
use lookbook_contracts::events::EventWriter;
use lookbook_contracts::identity::{authorize, Session, StaticTokenVerifier};
use lookbook_contracts::ledger::{read_ledger, summarize, LedgerTotals};
use lookbook_engine::batch::{
    import_into_gallery, plan_batch, run_batch, BatchHandle, BatchPlan, BatchReport,
    BatchRequest, ItemStatus, RunOptions, REPORT_FILE,
};
use lookbook_engine::canvas::{CropRect, ExpandSpec, Hotspot, MaskCanvas, Padding, Selection};
use lookbook_engine::gallery::{GalleryStore, TreeNode, ROOT_ID};
use lookbook_engine::prompts::ModelBrief;
use lookbook_engine::{EditReply, EditSession, OpOptions, Studio, StudioConfig, StudioOutput};
use serde_json::Map;

#[derive(Debug, Parser)]
#[command(name = "lookbook", version, about = "Product photo studio for fashion catalogs")]
struct Cli {
    /// Data directory; defaults to LOOKBOOK_HOME or ~/.lookbook.
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    /// Bearer token; defaults to LOOKBOOK_TOKEN.
    #[arg(long, global = true)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    ModelPhoto(ModelPhotoArgs),
    Retouch(RetouchArgs),
    Expand(ExpandArgs),
    Pose(PoseArgs),
    Crop(CropArgs),
    Resize(ResizeArgs),
    Edit(EditArgs),
    #[command(subcommand)]
    Batch(BatchCommand),
    #[command(subcommand)]
    Gallery(GalleryCommand),
    Ledger(LedgerArgs),
    Whoami,
}

#[derive(Debug, Args)]
struct OutputArgs {
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    image_model: Option<String>,
    /// 1K, 2K or 4K.
    #[arg(long)]
    image_size: Option<String>,
}

#[derive(Debug, Parser)]
struct ModelPhotoArgs {
    #[arg(required = true)]
    garments: Vec<PathBuf>,
    #[arg(long)]
    model_description: Option<String>,
    #[arg(long)]
    pose: Option<String>,
    #[arg(long)]
    background: Option<String>,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long, default_value = "3:4")]
    aspect_ratio: String,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Parser)]
struct RetouchArgs {
    image: PathBuf,
    #[arg(long)]
    instruction: String,
    /// Image-space point as `x,y`.
    #[arg(long, conflicts_with = "mask")]
    point: Option<String>,
    /// Mask image; white marks the editable area.
    #[arg(long)]
    mask: Option<PathBuf>,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Parser)]
struct ExpandArgs {
    image: PathBuf,
    #[arg(long, conflicts_with = "pad")]
    ratio: Option<String>,
    /// Pixels to add as `left,top,right,bottom`.
    #[arg(long)]
    pad: Option<String>,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Parser)]
struct PoseArgs {
    image: PathBuf,
    #[arg(long)]
    pose: String,
    #[arg(long)]
    aspect_ratio: Option<String>,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Parser)]
struct CropArgs {
    image: PathBuf,
    #[arg(long)]
    x: f64,
    #[arg(long)]
    y: f64,
    #[arg(long)]
    width: f64,
    #[arg(long)]
    height: f64,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Parser)]
struct ResizeArgs {
    image: PathBuf,
    #[arg(long)]
    width: u32,
    #[arg(long)]
    height: u32,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Parser)]
struct EditArgs {
    /// Image to start from; omit to resume the session in --session.
    image: Option<PathBuf>,
    #[arg(long)]
    session: Option<PathBuf>,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Debug, Subcommand)]
enum BatchCommand {
    Plan(BatchInputArgs),
    Run(BatchRunArgs),
}

#[derive(Debug, Args)]
struct BatchInputArgs {
    /// Image files or directories of images.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    #[arg(long)]
    name: String,
    /// Metadata sheet as JSON rows.
    #[arg(long)]
    sheet: Option<PathBuf>,
    /// JSON object of per-SKU settings.
    #[arg(long)]
    overrides: Option<PathBuf>,
    #[arg(long)]
    operation: Option<String>,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    model_description: Option<String>,
    #[arg(long)]
    pose: Option<String>,
    #[arg(long)]
    background: Option<String>,
    #[arg(long)]
    aspect_ratio: Option<String>,
    #[arg(long)]
    variations: Option<u32>,
    #[arg(long)]
    image_model: Option<String>,
    #[arg(long)]
    image_size: Option<String>,
    /// Comma-separated SKUs to include.
    #[arg(long, value_delimiter = ',')]
    only: Vec<String>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct BatchRunArgs {
    #[command(flatten)]
    input: BatchInputArgs,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    no_cache: bool,
    /// Only rerun SKUs that failed or were cancelled in the previous report.
    #[arg(long)]
    retry_failed: bool,
    /// Copy outputs into the gallery under /<name>/<SKU>.
    #[arg(long)]
    import: bool,
    /// Read `cancel` or `cancel <SKU>` lines from stdin while running.
    #[arg(long)]
    interactive: bool,
}

#[derive(Debug, Subcommand)]
enum GalleryCommand {
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    Tree,
    Mkdir {
        path: String,
    },
    Import {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long, default_value = "/")]
        to: String,
    },
    Mv {
        path: String,
        dest: String,
    },
    Rename {
        path: String,
        name: String,
    },
    Rm {
        path: String,
    },
    Restore {
        /// Entry name inside the trash, or its full `/.trash/...` path.
        path: String,
    },
    EmptyTrash,
}

#[derive(Debug, Parser)]
struct LedgerArgs {
    /// Every user's spend; admins only.
    #[arg(long)]
    all: bool,
    #[arg(long)]
    json: bool,
}

struct Workspace {
    config: StudioConfig,
    session: Session,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("lookbook error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let workspace = open_workspace(cli.home, cli.token)?;
    match cli.command {
        Command::ModelPhoto(args) => run_model_photo(&workspace, args),
        Command::Retouch(args) => run_retouch(&workspace, args),
        Command::Expand(args) => run_expand(&workspace, args),
        Command::Pose(args) => run_pose(&workspace, args),
        Command::Crop(args) => run_crop(&workspace, args),
        Command::Resize(args) => run_resize(&workspace, args),
        Command::Edit(args) => run_edit(&workspace, args),
        Command::Batch(BatchCommand::Plan(args)) => run_batch_plan(&workspace, args),
        Command::Batch(BatchCommand::Run(args)) => run_batch_run(&workspace, args),
        Command::Gallery(command) => run_gallery(&workspace, command),
        Command::Ledger(args) => run_ledger(&workspace, args),
        Command::Whoami => {
            println!(
                "{} ({})",
                workspace.session.user_id, workspace.session.role
            );
            Ok(0)
        }
    }
}

fn open_workspace(home: Option<PathBuf>, token: Option<String>) -> Result<Workspace> {
    let mut config = StudioConfig::from_env();
    if let Some(home) = home {
        config.home = home;
    }
    if token.is_some() {
        config.token = token;
    }
    let session = resolve_session(&config)?;
    Ok(Workspace { config, session })
}

/// Without a token table the CLI runs as the local admin user.
fn resolve_session(config: &StudioConfig) -> Result<Session> {
    if !config.has_token_table() {
        return Ok(Session::local());
    }
    let verifier = StaticTokenVerifier::load(&config.tokens_path())?;
    let header = config.token.as_ref().map(|token| format!("Bearer {token}"));
    authorize(&verifier, header.as_deref()).context("set LOOKBOOK_TOKEN or pass --token")
}

fn open_studio(workspace: &Workspace, output: &OutputArgs) -> Result<Studio> {
    let out_dir = output
        .out
        .clone()
        .unwrap_or_else(|| workspace.config.outputs_dir());
    let events_path = output
        .events
        .clone()
        .unwrap_or_else(|| out_dir.join("events.jsonl"));
    let mut studio = Studio::new(
        &workspace.config,
        workspace.session.clone(),
        &out_dir,
        events_path,
    )?;
    if output.image_model.is_some() {
        studio.set_default_model(output.image_model.clone());
    }
    Ok(studio)
}

fn op_options(output: &OutputArgs) -> OpOptions {
    OpOptions {
        image_size: output.image_size.clone(),
        ..OpOptions::default()
    }
}

/// Runs one studio call, prints its result and closes the run.
fn finish_single(studio: &Studio, result: Result<StudioOutput>) -> Result<i32> {
    let outcome = result.map(|output| print_output(studio, &output));
    studio.finish()?;
    outcome?;
    Ok(0)
}

fn run_model_photo(workspace: &Workspace, args: ModelPhotoArgs) -> Result<i32> {
    let studio = open_studio(workspace, &args.output)?;
    let brief = ModelBrief {
        model_description: args.model_description,
        pose: args.pose,
        background: args.background,
        extra_prompt: args.prompt,
        context: Map::new(),
    };
    let result = studio.model_photo(
        &args.garments,
        &brief,
        &args.aspect_ratio,
        &op_options(&args.output),
    );
    finish_single(&studio, result)
}

fn run_retouch(workspace: &Workspace, args: RetouchArgs) -> Result<i32> {
    let dims = image::image_dimensions(&args.image)
        .with_context(|| format!("failed reading {}", args.image.display()))?;
    let selection = if let Some(mask) = &args.mask {
        let decoded =
            image::open(mask).with_context(|| format!("failed reading mask {}", mask.display()))?;
        Selection::Mask(MaskCanvas::from_image(&decoded, dims))
    } else if let Some(point) = &args.point {
        let Some((x, y)) = parse_pair(point) else {
            bail!("--point expects x,y");
        };
        Selection::Point(Hotspot::new(x, y, dims)?)
    } else {
        Selection::Whole
    };
    let studio = open_studio(workspace, &args.output)?;
    let result = studio.retouch(
        &args.image,
        &selection,
        &args.instruction,
        &op_options(&args.output),
    );
    finish_single(&studio, result)
}

fn run_expand(workspace: &Workspace, args: ExpandArgs) -> Result<i32> {
    let spec = match (&args.ratio, &args.pad) {
        (_, Some(pad)) => ExpandSpec::Padding(parse_padding(pad)?),
        (Some(ratio), None) => ExpandSpec::ToRatio(ratio.clone()),
        (None, None) => bail!("expand needs --ratio or --pad"),
    };
    let studio = open_studio(workspace, &args.output)?;
    let result = studio.expand(&args.image, &spec, &op_options(&args.output));
    finish_single(&studio, result)
}

fn run_pose(workspace: &Workspace, args: PoseArgs) -> Result<i32> {
    let studio = open_studio(workspace, &args.output)?;
    let result = studio.pose_variation(
        &args.image,
        &args.pose,
        args.aspect_ratio.as_deref(),
        &op_options(&args.output),
    );
    finish_single(&studio, result)
}

fn run_crop(workspace: &Workspace, args: CropArgs) -> Result<i32> {
    let dims = image::image_dimensions(&args.image)
        .with_context(|| format!("failed reading {}", args.image.display()))?;
    let rect = CropRect::clamped(args.x, args.y, args.width, args.height, dims)?;
    let studio = open_studio(workspace, &args.output)?;
    let result = studio.crop(&args.image, rect, &op_options(&args.output));
    finish_single(&studio, result)
}

fn run_resize(workspace: &Workspace, args: ResizeArgs) -> Result<i32> {
    let studio = open_studio(workspace, &args.output)?;
    let result = studio.resize(
        &args.image,
        args.width,
        args.height,
        &op_options(&args.output),
    );
    finish_single(&studio, result)
}

fn run_edit(workspace: &Workspace, args: EditArgs) -> Result<i32> {
    let studio = open_studio(workspace, &args.output)?;
    let session_dir = args
        .session
        .clone()
        .unwrap_or_else(|| studio.out_dir().join("edit"));
    let mut session = EditSession::open(&studio, args.image.as_deref(), &session_dir)?;
    if let Some(model) = &args.output.image_model {
        session.execute(&parse_command(&format!("/model {model}")))?;
    }

    let stdin = io::stdin();
    let mut line = String::new();
    println!(
        "Lookbook editor started on {}. Type /help for commands.",
        session.current_image().display()
    );

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let command = parse_command(line.trim_end_matches(['\n', '\r']));
        if command.action == "unknown"
            && matches!(command.arg_str("command"), Some("quit" | "exit"))
        {
            break;
        }
        match session.execute(&command)? {
            EditReply::Nothing => {}
            EditReply::Info(text) | EditReply::Invalid(text) => println!("{text}"),
            EditReply::Failed(text) => println!("Edit failed: {text}"),
            EditReply::Version { version, output } => {
                println!(
                    "{} ({}) -> {}",
                    version.version_id, version.operation, version.image_path
                );
                if let Some(output) = output {
                    for warning in &output.warnings {
                        println!("Warning: {warning}");
                    }
                    print_generation_cost_latency(&studio);
                }
            }
        }
    }

    studio.finish()?;
    Ok(0)
}

fn batch_request(args: &BatchInputArgs) -> Result<BatchRequest> {
    let sheet = args
        .sheet
        .as_deref()
        .map(MetadataSheet::load_json)
        .transpose()?;
    let overrides = match &args.overrides {
        Some(path) => load_overrides(path)?,
        None => BTreeMap::new(),
    };
    let only_skus: BTreeSet<String> = args
        .only
        .iter()
        .map(|sku| sku.trim().to_ascii_uppercase())
        .filter(|sku| !sku.is_empty())
        .collect();
    Ok(BatchRequest {
        name: args.name.clone(),
        files: collect_files(&args.inputs)?,
        sheet,
        overrides,
        defaults: ItemSettings {
            operation: args.operation.clone(),
            prompt: args.prompt.clone(),
            model_description: args.model_description.clone(),
            pose: args.pose.clone(),
            background: args.background.clone(),
            aspect_ratio: args.aspect_ratio.clone(),
            variations: args.variations,
            image_model: args.image_model.clone(),
            image_size: args.image_size.clone(),
        },
        only_skus: (!only_skus.is_empty()).then_some(only_skus),
    })
}

fn batch_studio(workspace: &Workspace, out_dir: &Path, events: Option<&Path>) -> Result<Studio> {
    let events_path = events
        .map(Path::to_path_buf)
        .unwrap_or_else(|| out_dir.join("events.jsonl"));
    Studio::new(
        &workspace.config,
        workspace.session.clone(),
        out_dir,
        events_path,
    )
}

fn run_batch_plan(workspace: &Workspace, args: BatchInputArgs) -> Result<i32> {
    let request = batch_request(&args)?;
    let out_dir = workspace.config.outputs_dir().join("plans");
    let studio = batch_studio(workspace, &out_dir, args.events.as_deref())?;
    let plan = plan_batch(&studio, &request);
    studio.finish()?;
    print_plan(&plan?);
    Ok(0)
}

fn run_batch_run(workspace: &Workspace, args: BatchRunArgs) -> Result<i32> {
    let out_dir = args
        .out
        .clone()
        .unwrap_or_else(|| workspace.config.outputs_dir().join(slug(&args.input.name)));
    let mut request = batch_request(&args.input)?;
    let mut previous = None;
    if args.retry_failed {
        let report = BatchReport::load(&out_dir.join(REPORT_FILE))?;
        let retry = report.retry_skus();
        if retry.is_empty() {
            println!("Nothing to retry in {}", out_dir.display());
            return Ok(0);
        }
        println!("Retrying {}", retry.iter().cloned().collect::<Vec<_>>().join(", "));
        request.only_skus = Some(retry);
        previous = Some(report);
    }

    let studio = batch_studio(workspace, &out_dir, args.input.events.as_deref())?;
    let plan = plan_batch(&studio, &request)?;
    print_plan(&plan);

    let mut options = RunOptions::new(&out_dir);
    options.concurrency = args
        .concurrency
        .unwrap_or(workspace.config.batch_concurrency);
    options.use_cache = !args.no_cache;
    options.previous = previous;
    let handle = BatchHandle::new();
    if args.interactive {
        spawn_cancel_listener(handle.clone());
    }
    let report = run_batch(&studio, &plan, &options, &handle);
    studio.finish()?;
    let report = report?;

    for item in &report.items {
        let detail = match (&item.image_path, &item.error) {
            (_, Some(error)) => error.clone(),
            (Some(path), None) => path.display().to_string(),
            (None, None) => String::new(),
        };
        println!(
            "{:<12} #{:02} {:<10} {}",
            item.sku,
            item.variation,
            status_label(item.status),
            detail
        );
    }
    let summary = report.summary();
    println!(
        "Batch {}: {} succeeded, {} failed, {} cancelled, {} cached | Cost: {}",
        report.batch_id,
        summary.succeeded,
        summary.failed,
        summary.cancelled,
        summary.cached,
        format_cost(Some(summary.cost_total_usd))
    );
    println!("Report: {}", out_dir.join(REPORT_FILE).display());

    if args.import {
        let mut gallery = open_gallery(workspace)?;
        let imported = import_into_gallery(&report, &mut gallery)?;
        println!("Imported {imported} images into /{}", report.name);
    }
    if summary.failed > 0 {
        return Ok(2);
    }
    Ok(0)
}

/// Reads stdin until EOF; `cancel` stops the batch, `cancel <SKU>` one product.
fn spawn_cancel_listener(handle: BatchHandle) {
    thread::spawn(move || {
        let stdin = io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let mut words = line.split_whitespace();
            if words.next() != Some("cancel") {
                continue;
            }
            match words.next() {
                Some(sku) => {
                    handle.cancel_item(sku);
                    println!("Cancelling {}", sku.to_ascii_uppercase());
                }
                None => {
                    handle.cancel();
                    println!("Cancelling remaining items");
                }
            }
        }
    });
}

fn print_plan(plan: &BatchPlan) {
    println!(
        "Plan {} '{}': {} products, {} calls, estimated {}",
        plan.batch_id,
        plan.name,
        plan.products,
        plan.tasks.len(),
        format_cost(Some(plan.estimate.total_usd))
    );
    for (model, cost) in &plan.estimate.by_model {
        println!("  {model}: {}", format_cost(Some(*cost)));
    }
    for warning in &plan.warnings {
        println!("Warning: {warning}");
    }
}

fn open_gallery(workspace: &Workspace) -> Result<GalleryStore> {
    let events = EventWriter::new(
        workspace.config.events_path(),
        format!("gallery-{}", workspace.session.user_id),
    );
    GalleryStore::open(
        workspace.config.gallery_root(&workspace.session.user_id),
        events,
    )
}

fn run_gallery(workspace: &Workspace, command: GalleryCommand) -> Result<i32> {
    let mut gallery = open_gallery(workspace)?;
    match command {
        GalleryCommand::Ls { path } => {
            let folder = find_entry(&gallery, &path)?;
            for entry in gallery.list(&folder)? {
                let suffix = if entry.is_folder() { "/" } else { "" };
                println!("{}{suffix}", entry.name);
            }
        }
        GalleryCommand::Tree => {
            for node in gallery.tree() {
                print_tree(&node, 0);
            }
        }
        GalleryCommand::Mkdir { path } => {
            let names: Vec<&str> = path.split('/').filter(|name| !name.is_empty()).collect();
            if names.is_empty() {
                bail!("mkdir needs a folder path");
            }
            let id = gallery.ensure_folder_path(&names)?;
            println!("Created {}", gallery.resolve_path(&id)?);
        }
        GalleryCommand::Import { files, to } => {
            let folder = find_entry(&gallery, &to)?;
            for file in files {
                let entry = gallery.import_file(&folder, &file, Map::new())?;
                println!("Imported {}", gallery.resolve_path(&entry.id)?);
            }
        }
        GalleryCommand::Mv { path, dest } => {
            let id = find_entry(&gallery, &path)?;
            let target = find_entry(&gallery, &dest)?;
            let entry = gallery.move_entry(&id, &target)?;
            println!("Moved to {}", gallery.resolve_path(&entry.id)?);
        }
        GalleryCommand::Rename { path, name } => {
            let id = find_entry(&gallery, &path)?;
            let entry = gallery.rename(&id, &name)?;
            println!("Renamed to {}", gallery.resolve_path(&entry.id)?);
        }
        GalleryCommand::Rm { path } => {
            let id = find_entry(&gallery, &path)?;
            let entry = gallery.delete(&id)?;
            println!("Moved {} to the trash", entry.name);
        }
        GalleryCommand::Restore { path } => {
            let path = if path.starts_with("/.trash/") {
                path
            } else {
                format!("/.trash/{}", path.trim_start_matches('/'))
            };
            let id = find_entry(&gallery, &path)?;
            let entry = gallery.restore(&id)?;
            println!("Restored {}", gallery.resolve_path(&entry.id)?);
        }
        GalleryCommand::EmptyTrash => {
            let removed = gallery.empty_trash()?;
            println!("Removed {removed} items");
        }
    }
    Ok(0)
}

fn find_entry(gallery: &GalleryStore, path: &str) -> Result<String> {
    if path.trim() == "/" {
        return Ok(ROOT_ID.to_string());
    }
    gallery
        .find_by_path(path)
        .map(|entry| entry.id.clone())
        .with_context(|| format!("no such gallery path: {path}"))
}

fn print_tree(node: &TreeNode, depth: usize) {
    let label = if node.entry.id == ROOT_ID {
        "/".to_string()
    } else if node.entry.is_folder() {
        format!("{}/", node.entry.name)
    } else {
        node.entry.name.clone()
    };
    println!("{}{label}", "  ".repeat(depth));
    for child in &node.children {
        print_tree(child, depth + 1);
    }
}

fn run_ledger(workspace: &Workspace, args: LedgerArgs) -> Result<i32> {
    if args.all && !workspace.session.is_admin() {
        bail!("--all requires an admin token");
    }
    let path = workspace.config.ledger_path();
    let entries = if path.is_file() {
        read_ledger(&path)?
    } else {
        Vec::new()
    };
    let user = (!args.all).then_some(workspace.session.user_id.as_str());
    let summary = summarize(&entries, user);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(0);
    }
    print_totals("Total", &summary.total);
    for (operation, totals) in &summary.by_operation {
        print_totals(&format!("  {operation}"), totals);
    }
    for (model, totals) in &summary.by_model {
        print_totals(&format!("  {model}"), totals);
    }
    Ok(0)
}

fn print_totals(label: &str, totals: &LedgerTotals) {
    println!(
        "{label}: {} calls ({} failed, {} cached), {} images out, {}",
        totals.calls,
        totals.failed_calls,
        totals.cached_calls,
        totals.output_images,
        format_cost(Some(totals.cost_usd))
    );
}

fn print_output(studio: &Studio, output: &StudioOutput) {
    println!("Saved {}", output.image_path.display());
    if let Some(reason) = &output.fallback_reason {
        println!("Model fallback: {reason}");
    }
    for warning in &output.warnings {
        println!("Warning: {warning}");
    }
    print_generation_cost_latency(studio);
}

fn format_cost(value: Option<f64>) -> String {
    match value {
        Some(raw) => format!("${raw:.4}"),
        None => "N/A".to_string(),
    }
}

fn format_latency(value: Option<f64>) -> String {
    match value {
        Some(raw) => format!("{raw:.2}s"),
        None => "N/A".to_string(),
    }
}

fn print_generation_cost_latency(studio: &Studio) {
    let metrics = studio.last_cost_latency();
    println!(
        "Cost of generation: {} | Latency per image: {}",
        format_cost(metrics.as_ref().map(|metrics| metrics.cost_total_usd)),
        format_latency(metrics.as_ref().map(|metrics| metrics.latency_per_image_s))
    );
}

fn status_label(status: ItemStatus) -> &'static str {
    match status {
        ItemStatus::Pending => "pending",
        ItemStatus::Running => "running",
        ItemStatus::Succeeded => "done",
        ItemStatus::Failed => "failed",
        ItemStatus::Cancelled => "cancelled",
        ItemStatus::Skipped => "cached",
    }
}

/// Expands directories one level, keeping explicit files as given.
fn collect_files(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut entries = fs::read_dir(input)
                .with_context(|| format!("failed reading {}", input.display()))?
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| path.is_file())
                .collect::<Vec<_>>();
            entries.sort();
            files.extend(entries);
        } else if input.is_file() {
            files.push(input.clone());
        } else {
            bail!("input not found: {}", input.display());
        }
    }
    Ok(files)
}

fn load_overrides(path: &Path) -> Result<BTreeMap<String, ItemSettings>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading overrides {}", path.display()))?;
    let parsed: BTreeMap<String, ItemSettings> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid overrides JSON {}", path.display()))?;
    Ok(parsed
        .into_iter()
        .map(|(sku, settings)| (sku.trim().to_ascii_uppercase(), settings))
        .collect())
}

fn parse_pair(raw: &str) -> Option<(f64, f64)> {
    let (x, y) = raw.split_once(',')?;
    Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
}

fn parse_padding(raw: &str) -> Result<Padding> {
    let values = raw
        .split(',')
        .map(|part| part.trim().parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("--pad expects four whole numbers, got '{raw}'"))?;
    let [left, top, right, bottom] = values[..] else {
        bail!("--pad expects left,top,right,bottom");
    };
    Ok(Padding {
        left,
        top,
        right,
        bottom,
    })
}

fn slug(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let collapsed = cleaned
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if collapsed.is_empty() {
        return "batch".to_string();
    }
    collapsed
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{collect_files, format_cost, format_latency, parse_padding, parse_pair, slug};

    #[test]
    fn padding_and_point_flags_parse() -> anyhow::Result<()> {
        let padding = parse_padding("10, 0,20,5")?;
        assert_eq!((padding.left, padding.top, padding.right, padding.bottom), (10, 0, 20, 5));
        assert!(parse_padding("1,2,3").is_err());
        assert!(parse_padding("1,2,3,-4").is_err());
        assert_eq!(parse_pair("12.5, 40"), Some((12.5, 40.0)));
        assert_eq!(parse_pair("12"), None);
        Ok(())
    }

    #[test]
    fn batch_names_become_directory_slugs() {
        assert_eq!(slug("Spring Drop '26"), "spring-drop-26");
        assert_eq!(slug("   "), "batch");
    }

    #[test]
    fn directories_expand_to_sorted_files() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        std::fs::write(temp.path().join("b.png"), [0])?;
        std::fs::write(temp.path().join("a.png"), [0])?;
        std::fs::create_dir(temp.path().join("nested"))?;
        let files = collect_files(&[temp.path().to_path_buf()])?;
        let names: Vec<String> = files
            .iter()
            .filter_map(|path| path.file_name().and_then(|name| name.to_str()))
            .map(str::to_string)
            .collect();
        assert_eq!(names, vec!["a.png".to_string(), "b.png".to_string()]);
        assert!(collect_files(&[PathBuf::from("/definitely/missing.png")]).is_err());
        Ok(())
    }

    #[test]
    fn cost_and_latency_formatting() {
        assert_eq!(format_cost(Some(0.039)), "$0.0390");
        assert_eq!(format_cost(None), "N/A");
        assert_eq!(format_latency(Some(1.234)), "1.23s");
    }
}
