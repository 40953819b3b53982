//! Interactive editing session over one image: a command per line, each
//! generation recorded as a version in the session's edit history.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use lookbook_contracts::commands::{EditorCommand, EDITOR_HELP_COMMANDS};
use lookbook_contracts::ledger::summarize;
use lookbook_contracts::runs::edit_history::{EditHistory, EditVersion};
use serde_json::{json, Map, Value};

use crate::canvas::{CropRect, ExpandSpec, Hotspot, MaskCanvas, Point, Selection, Stroke};
use crate::studio::{OpOptions, Studio, StudioOutput};
use crate::util::{error_chain_text, map_object};

pub const HISTORY_FILE: &str = "history.json";

#[derive(Debug, Clone)]
pub enum EditReply {
    Nothing,
    Info(String),
    Invalid(String),
    Version {
        version: EditVersion,
        output: Option<StudioOutput>,
    },
    Failed(String),
}

pub struct EditSession<'a> {
    studio: &'a Studio,
    dir: PathBuf,
    history: EditHistory,
    mask: Option<MaskCanvas>,
    model: Option<String>,
    spent_usd: f64,
}

impl<'a> EditSession<'a> {
    /// Starts a session on `image`, or resumes the history already in `dir`.
    pub fn open(studio: &'a Studio, image: Option<&Path>, dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed creating {}", dir.display()))?;
        let history_path = dir.join(HISTORY_FILE);
        let history = match image {
            Some(image) => {
                if !image.is_file() {
                    anyhow::bail!("image not found: {}", image.display());
                }
                let history = EditHistory::new(&history_path, image.to_string_lossy().to_string());
                history.save()?;
                history
            }
            None => EditHistory::load(&history_path)?,
        };
        let session = Self {
            studio,
            dir,
            history,
            mask: None,
            model: None,
            spent_usd: 0.0,
        };
        session.studio.events().emit(
            "edit_session_opened",
            map_object(json!({
                "session_id": session.history.session_id,
                "image_path": session.history.current().image_path,
            })),
        )?;
        Ok(session)
    }

    pub fn history(&self) -> &EditHistory {
        &self.history
    }

    pub fn current_image(&self) -> PathBuf {
        PathBuf::from(&self.history.current().image_path)
    }

    pub fn mask(&self) -> Option<&MaskCanvas> {
        self.mask.as_ref()
    }

    pub fn execute(&mut self, command: &EditorCommand) -> Result<EditReply> {
        let instruction = command.instruction.clone().unwrap_or_default();
        match command.action.as_str() {
            "noop" => Ok(EditReply::Nothing),
            "help" => Ok(EditReply::Info(format!(
                "Commands: {}",
                EDITOR_HELP_COMMANDS.join(" ")
            ))),
            "invalid" => Ok(EditReply::Invalid(format!(
                "Usage: {}",
                command.arg_str("usage").unwrap_or("/help")
            ))),
            "unknown" => Ok(EditReply::Invalid(format!(
                "Unknown command: /{}",
                command.arg_str("command").unwrap_or_default()
            ))),
            "edit" => self.run_retouch(Selection::Whole, &instruction),
            "point" => {
                let dims = self.current_dims()?;
                let hotspot = match Hotspot::new(
                    command.arg_f64("x").unwrap_or(-1.0),
                    command.arg_f64("y").unwrap_or(-1.0),
                    dims,
                ) {
                    Ok(hotspot) => hotspot,
                    Err(err) => return Ok(EditReply::Invalid(err.to_string())),
                };
                self.run_retouch(Selection::Point(hotspot), &instruction)
            }
            "mask" => {
                let path = PathBuf::from(command.arg_str("path").unwrap_or_default());
                let decoded = match image::open(&path) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        return Ok(EditReply::Invalid(format!(
                            "cannot read mask {}: {err}",
                            path.display()
                        )))
                    }
                };
                let mask = MaskCanvas::from_image(&decoded, self.current_dims()?);
                self.run_retouch(Selection::Mask(mask), &instruction)
            }
            "brush" | "erase" => {
                let dims = self.current_dims()?;
                let stroke = Stroke {
                    points: stroke_points(command.args.get("points")),
                    radius: command.arg_f64("radius").unwrap_or(24.0),
                    erase: command.action == "erase",
                };
                let mask = self
                    .mask
                    .get_or_insert_with(|| MaskCanvas::new(dims.0, dims.1));
                mask.apply_stroke(&stroke);
                Ok(EditReply::Info(format!(
                    "Mask covers {:.1}% of the image.",
                    mask.coverage() * 100.0
                )))
            }
            "clear_mask" => {
                if let Some(mask) = self.mask.as_mut() {
                    mask.clear();
                }
                Ok(EditReply::Info("Mask cleared.".to_string()))
            }
            "invert_mask" => {
                let dims = self.current_dims()?;
                let mask = self
                    .mask
                    .get_or_insert_with(|| MaskCanvas::new(dims.0, dims.1));
                mask.invert();
                Ok(EditReply::Info(format!(
                    "Mask inverted; it now covers {:.1}% of the image.",
                    mask.coverage() * 100.0
                )))
            }
            "apply_mask" => {
                let Some(mask) = self.mask.clone().filter(|mask| !mask.is_empty()) else {
                    return Ok(EditReply::Invalid(
                        "Paint an area with /brush before /apply.".to_string(),
                    ));
                };
                let reply = self.run_retouch(Selection::Mask(mask), &instruction)?;
                if matches!(reply, EditReply::Version { .. }) {
                    self.mask = None;
                }
                Ok(reply)
            }
            "crop" => {
                let dims = self.current_dims()?;
                let rect = match CropRect::clamped(
                    command.arg_f64("x").unwrap_or_default(),
                    command.arg_f64("y").unwrap_or_default(),
                    command.arg_f64("width").unwrap_or_default(),
                    command.arg_f64("height").unwrap_or_default(),
                    dims,
                ) {
                    Ok(rect) => rect,
                    Err(err) => return Ok(EditReply::Invalid(err.to_string())),
                };
                let settings = map_object(json!({ "crop": rect }));
                self.run_generation("crop", "", settings, |studio, image, opts| {
                    studio.crop(image, rect, opts)
                })
            }
            "resize" => {
                let width = command.arg_f64("width").unwrap_or_default() as u32;
                let height = command.arg_f64("height").unwrap_or_default() as u32;
                let settings = map_object(json!({ "width": width, "height": height }));
                self.run_generation("resize", "", settings, |studio, image, opts| {
                    studio.resize(image, width, height, opts)
                })
            }
            "expand" => {
                let ratio = command.arg_str("ratio").unwrap_or("1:1").to_string();
                let settings = map_object(json!({ "ratio": ratio }));
                let spec = ExpandSpec::ToRatio(ratio);
                self.run_generation("expand", "", settings, |studio, image, opts| {
                    studio.expand(image, &spec, opts)
                })
            }
            "pose" => {
                let settings = Map::new();
                self.run_generation("pose", &instruction, settings, |studio, image, opts| {
                    studio.pose_variation(image, &instruction, None, opts)
                })
            }
            "set_model" => {
                let name = instruction.trim();
                if self.studio.selector().registry.get(name).is_none() {
                    let known: Vec<String> = self
                        .studio
                        .selector()
                        .registry
                        .list()
                        .map(|model| model.name.clone())
                        .collect();
                    return Ok(EditReply::Invalid(format!(
                        "Unknown model '{name}' (available: {})",
                        known.join(", ")
                    )));
                }
                self.model = Some(name.to_string());
                Ok(EditReply::Info(format!("Image model set to {name}")))
            }
            "undo" => {
                let moved = self.history.undo().cloned();
                self.after_navigation(moved, "Nothing to undo.")
            }
            "redo" => {
                let moved = self.history.redo().cloned();
                self.after_navigation(moved, "Nothing to redo.")
            }
            "history" => {
                let current = self.history.current_version_id.clone();
                let lines: Vec<String> = self
                    .history
                    .lineage()
                    .into_iter()
                    .map(|version| {
                        let marker = if version.version_id == current { "*" } else { " " };
                        let label = if version.instruction.is_empty() {
                            version.operation.clone()
                        } else {
                            format!("{}: {}", version.operation, version.instruction)
                        };
                        format!("{marker} {} {label} ({})", version.version_id, version.image_path)
                    })
                    .collect();
                Ok(EditReply::Info(lines.join("\n")))
            }
            "cost" => {
                let entries = self.studio.ledger().entries()?;
                let summary = summarize(&entries, Some(&self.studio.session().user_id));
                Ok(EditReply::Info(format!(
                    "Session spend: ${:.4} | Your total: ${:.4} over {} calls ({} failed)",
                    self.spent_usd,
                    summary.total.cost_usd,
                    summary.total.calls,
                    summary.total.failed_calls
                )))
            }
            "save" => {
                let target = PathBuf::from(command.arg_str("path").unwrap_or_default());
                if let Some(parent) = target.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let current = self.current_image();
                std::fs::copy(&current, &target).with_context(|| {
                    format!("failed copying {} to {}", current.display(), target.display())
                })?;
                Ok(EditReply::Info(format!("Saved {}", target.display())))
            }
            "open" => {
                let path = PathBuf::from(command.arg_str("path").unwrap_or_default());
                if !path.is_file() {
                    return Ok(EditReply::Invalid(format!("image not found: {}", path.display())));
                }
                self.history =
                    EditHistory::new(self.dir.join(HISTORY_FILE), path.to_string_lossy().to_string());
                self.history.save()?;
                self.mask = None;
                Ok(EditReply::Info(format!("Opened {}", path.display())))
            }
            other => Ok(EditReply::Invalid(format!("Unknown command: {other}"))),
        }
    }

    fn run_retouch(&mut self, selection: Selection, instruction: &str) -> Result<EditReply> {
        let mut settings = map_object(json!({ "selection": selection.kind() }));
        if let Selection::Point(hotspot) = &selection {
            settings.insert("point".to_string(), json!([hotspot.x, hotspot.y]));
        }
        self.run_generation("retouch", instruction, settings, |studio, image, opts| {
            studio.retouch(image, &selection, instruction, opts)
        })
    }

    fn run_generation<F>(
        &mut self,
        operation: &str,
        instruction: &str,
        mut settings: Map<String, Value>,
        call: F,
    ) -> Result<EditReply>
    where
        F: FnOnce(&Studio, &Path, &OpOptions) -> Result<StudioOutput>,
    {
        let opts = OpOptions {
            model: self.model.clone(),
            output_dir: Some(self.dir.clone()),
            ..OpOptions::default()
        };
        let source = self.current_image();
        let output = match call(self.studio, &source, &opts) {
            Ok(output) => output,
            Err(err) => return Ok(EditReply::Failed(error_chain_text(&err, 2048))),
        };
        self.spent_usd += output.cost_usd;
        settings.insert("model".to_string(), Value::String(output.model.clone()));

        let version = self.history.add_version(
            operation,
            instruction,
            settings,
            output.image_path.to_string_lossy().to_string(),
        );
        self.history.save()?;
        if self
            .mask
            .as_ref()
            .is_some_and(|mask| Some(mask.dimensions()) != output.width.zip(output.height))
        {
            self.mask = None;
        }
        self.studio.events().emit(
            "edit_applied",
            map_object(json!({
                "session_id": self.history.session_id,
                "version_id": version.version_id,
                "parent_version_id": version.parent_version_id,
                "operation": operation,
                "image_path": version.image_path,
                "cost_usd": output.cost_usd,
            })),
        )?;
        Ok(EditReply::Version {
            version,
            output: Some(output),
        })
    }

    fn after_navigation(&mut self, moved: Option<EditVersion>, empty: &str) -> Result<EditReply> {
        let Some(version) = moved else {
            return Ok(EditReply::Invalid(empty.to_string()));
        };
        self.history.save()?;
        self.mask = None;
        Ok(EditReply::Version {
            version,
            output: None,
        })
    }

    fn current_dims(&self) -> Result<(u32, u32)> {
        let path = self.current_image();
        image::image_dimensions(&path)
            .with_context(|| format!("failed reading {}", path.display()))
    }
}

fn stroke_points(value: Option<&Value>) -> Vec<Point> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let pair = item.as_array()?;
                    Some(Point::new(pair.first()?.as_f64()?, pair.get(1)?.as_f64()?))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use image::{DynamicImage, Luma, GrayImage, Rgb, RgbImage};
    use lookbook_contracts::commands::parse_command;
    use lookbook_contracts::events::read_events;
    use lookbook_contracts::identity::Session;
    use serde_json::Value;

    use super::{EditReply, EditSession, HISTORY_FILE};
    use crate::config::StudioConfig;
    use crate::studio::Studio;

    fn studio(root: &Path) -> anyhow::Result<Studio> {
        let mut config = StudioConfig::local(root.join("home"));
        config.image_model = Some("dryrun-image-1".to_string());
        Studio::new(&config, Session::local(), root.join("out"), root.join("out/events.jsonl"))
    }

    fn source(root: &Path) -> anyhow::Result<std::path::PathBuf> {
        let path = root.join("look.png");
        DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 80, Rgb([90, 90, 90]))).save(&path)?;
        Ok(path)
    }

    fn run(session: &mut EditSession<'_>, line: &str) -> anyhow::Result<EditReply> {
        session.execute(&parse_command(line))
    }

    #[test]
    fn edits_create_versions_and_undo_redo_moves_between_them() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let studio = studio(temp.path())?;
        let image = source(temp.path())?;
        let mut session = EditSession::open(&studio, Some(&image), temp.path().join("session"))?;

        let first = run(&mut session, "make the shirt navy")?;
        assert!(matches!(&first, EditReply::Version { version, output: Some(_) } if version.version_id == "v1"));
        let second = run(&mut session, "/point 10 12 remove the tag")?;
        assert!(matches!(&second, EditReply::Version { version, .. } if version.version_id == "v2"));

        assert!(matches!(run(&mut session, "/undo")?, EditReply::Version { version, .. } if version.version_id == "v1"));
        assert!(matches!(run(&mut session, "/redo")?, EditReply::Version { version, .. } if version.version_id == "v2"));
        assert!(matches!(run(&mut session, "/redo")?, EditReply::Invalid(_)));

        let EditReply::Info(history) = run(&mut session, "/history")? else {
            anyhow::bail!("expected history listing");
        };
        assert_eq!(history.lines().count(), 3);
        assert!(history.lines().last().unwrap_or_default().starts_with("* v2 retouch: remove the tag"));

        let resumed = EditSession::open(&studio, None, temp.path().join("session"))?;
        assert_eq!(resumed.history().current_version_id, "v2");
        assert!(temp.path().join("session").join(HISTORY_FILE).is_file());
        Ok(())
    }

    #[test]
    fn brush_builds_mask_then_apply_consumes_it() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let studio = studio(temp.path())?;
        let image = source(temp.path())?;
        let mut session = EditSession::open(&studio, Some(&image), temp.path().join("session"))?;

        assert!(matches!(run(&mut session, "/apply recolour")?, EditReply::Invalid(_)));
        assert!(matches!(run(&mut session, "/brush 5,5 30,5 r=4")?, EditReply::Info(_)));
        let coverage = session.mask().map(|mask| mask.coverage()).unwrap_or_default();
        assert!(coverage > 0.0);

        let applied = run(&mut session, "/apply recolour to sage green")?;
        assert!(matches!(applied, EditReply::Version { .. }));
        assert!(session.mask().is_none());

        let events = read_events(studio.events().path())?;
        let applied_events: Vec<&Value> = events
            .iter()
            .filter(|row| row.get("type").and_then(Value::as_str) == Some("edit_applied"))
            .collect();
        assert_eq!(applied_events.len(), 1);
        assert_eq!(applied_events[0]["operation"], "retouch");
        Ok(())
    }

    #[test]
    fn uploaded_mask_and_canvas_commands() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let studio = studio(temp.path())?;
        let image = source(temp.path())?;
        let mask_path = temp.path().join("mask.png");
        DynamicImage::ImageLuma8(GrayImage::from_pixel(32, 40, Luma([255]))).save(&mask_path)?;
        let mut session = EditSession::open(&studio, Some(&image), temp.path().join("session"))?;

        let masked = run(&mut session, &format!("/mask {} soften wrinkles", mask_path.display()))?;
        assert!(matches!(masked, EditReply::Version { .. }));

        let cropped = run(&mut session, "/crop 0 0 400 300")?;
        let EditReply::Version { output: Some(output), .. } = cropped else {
            anyhow::bail!("expected crop version");
        };
        assert_eq!(output.operation, "crop");

        let resized = run(&mut session, "/resize 50x60")?;
        let EditReply::Version { output: Some(output), .. } = resized else {
            anyhow::bail!("expected resize version");
        };
        assert_eq!((output.width, output.height), (Some(50), Some(60)));

        assert!(matches!(run(&mut session, "/point 500 1 fix")?, EditReply::Invalid(_)));
        assert!(matches!(run(&mut session, "/model nope")?, EditReply::Invalid(_)));
        assert!(matches!(run(&mut session, "/frobnicate")?, EditReply::Invalid(_)));

        let saved = temp.path().join("final").join("look.png");
        run(&mut session, &format!("/save {}", saved.display()))?;
        assert!(saved.is_file());

        let EditReply::Info(cost) = run(&mut session, "/cost")? else {
            anyhow::bail!("expected cost line");
        };
        assert!(cost.contains("over 3 calls"));
        Ok(())
    }
}
