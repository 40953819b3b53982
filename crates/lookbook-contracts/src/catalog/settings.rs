use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::sheet::{value_as_text, SheetRow};
use crate::aspect::snap_aspect_ratio;

pub const MAX_VARIATIONS: u32 = 8;

const DEFAULT_ASPECT_RATIO: &str = "3:4";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOperation {
    ModelPhoto,
    Pose,
    Expand,
    Edit,
}

impl BatchOperation {
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "model_photo" | "model" | "on_model" | "generate" => Some(Self::ModelPhoto),
            "pose" | "pose_variation" | "poses" => Some(Self::Pose),
            "expand" | "outpaint" | "extend" => Some(Self::Expand),
            "edit" | "retouch" => Some(Self::Edit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelPhoto => "model_photo",
            Self::Pose => "pose",
            Self::Expand => "expand",
            Self::Edit => "edit",
        }
    }
}

impl fmt::Display for BatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingSource {
    Override,
    Sheet,
    Default,
    Builtin,
}

impl fmt::Display for SettingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Override => "override",
            Self::Sheet => "sheet",
            Self::Default => "default",
            Self::Builtin => "builtin",
        };
        f.write_str(label)
    }
}

/// One layer of batch settings. Every field is optional so layers can be
/// stacked: per-item override, sheet row, then global default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemSettings {
    pub operation: Option<String>,
    pub prompt: Option<String>,
    pub model_description: Option<String>,
    pub pose: Option<String>,
    pub background: Option<String>,
    pub aspect_ratio: Option<String>,
    pub variations: Option<u32>,
    pub image_model: Option<String>,
    pub image_size: Option<String>,
}

const COLUMN_ALIASES: &[(&str, &[&str])] = &[
    ("operation", &["operation", "op", "mode", "task"]),
    ("prompt", &["prompt", "instructions", "extra_prompt", "notes"]),
    (
        "model_description",
        &["model_description", "model", "model_type", "talent"],
    ),
    ("pose", &["pose", "poses"]),
    ("background", &["background", "bg", "backdrop", "setting"]),
    ("aspect_ratio", &["aspect_ratio", "ratio", "aspect", "format"]),
    (
        "variations",
        &["variations", "count", "num_images", "images", "n"],
    ),
    ("image_model", &["image_model", "ai_model", "engine"]),
    ("image_size", &["image_size", "resolution"]),
];

impl ItemSettings {
    /// Splits a sheet row into a settings layer and the leftover product
    /// context columns (title, colour, ...).
    pub fn from_row(row: &SheetRow) -> (Self, Map<String, Value>, Vec<String>) {
        let mut settings = Self::default();
        let mut context = row.columns.clone();
        let mut warnings = Vec::new();

        for (field, aliases) in COLUMN_ALIASES {
            let Some(column) = aliases
                .iter()
                .find(|alias| context.get(**alias).and_then(value_as_text).is_some())
            else {
                continue;
            };
            let Some(text) = context.remove(*column).as_ref().and_then(value_as_text) else {
                continue;
            };
            match *field {
                "operation" => settings.operation = Some(text),
                "prompt" => settings.prompt = Some(text),
                "model_description" => settings.model_description = Some(text),
                "pose" => settings.pose = Some(text),
                "background" => settings.background = Some(text),
                "aspect_ratio" => settings.aspect_ratio = Some(text),
                "variations" => match text.parse::<f64>() {
                    Ok(value) if value.is_finite() && value >= 0.0 => {
                        settings.variations = Some(value.round() as u32)
                    }
                    _ => warnings.push(format!(
                        "SKU {}: variations '{text}' is not a number; ignored.",
                        row.sku
                    )),
                },
                "image_model" => settings.image_model = Some(text),
                "image_size" => settings.image_size = Some(text),
                _ => {}
            }
        }

        context.retain(|_, value| !matches!(value, Value::Null));
        (settings, context, warnings)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSettings {
    pub operation: BatchOperation,
    pub prompt: Option<String>,
    pub model_description: Option<String>,
    pub pose: Option<String>,
    pub background: Option<String>,
    pub aspect_ratio: String,
    pub variations: u32,
    pub image_model: Option<String>,
    pub image_size: Option<String>,
    pub context: Map<String, Value>,
    pub sources: BTreeMap<String, SettingSource>,
    pub warnings: Vec<String>,
}

impl ResolvedSettings {
    pub fn source_of(&self, field: &str) -> Option<SettingSource> {
        self.sources.get(field).copied()
    }
}

/// Resolves every field independently, highest layer first. A value that
/// fails validation is reported and the next layer is consulted.
pub fn resolve_settings(
    sku: &str,
    item_override: Option<&ItemSettings>,
    row: Option<&SheetRow>,
    defaults: &ItemSettings,
) -> ResolvedSettings {
    let empty = ItemSettings::default();
    let (row_settings, context, mut warnings) = match row {
        Some(row) => ItemSettings::from_row(row),
        None => (ItemSettings::default(), Map::new(), Vec::new()),
    };
    let layers: [(SettingSource, &ItemSettings); 3] = [
        (SettingSource::Override, item_override.unwrap_or(&empty)),
        (SettingSource::Sheet, &row_settings),
        (SettingSource::Default, defaults),
    ];
    let mut sources = BTreeMap::new();
    let mut cascade = Cascade {
        sku,
        sources: &mut sources,
        warnings: &mut warnings,
    };

    let operation = cascade
        .pick("operation", &layers, |layer| layer.operation.clone(), |raw| {
            BatchOperation::parse(raw)
                .map(|op| (op, None))
                .ok_or_else(|| format!("unknown operation '{raw}'"))
        })
        .unwrap_or_else(|| {
            cascade.builtin("operation");
            BatchOperation::ModelPhoto
        });

    let aspect_ratio = cascade
        .pick(
            "aspect_ratio",
            &layers,
            |layer| layer.aspect_ratio.clone(),
            |raw| {
                snap_aspect_ratio(raw)
                    .map(|snapped| (snapped.ratio, snapped.warning))
                    .ok_or_else(|| format!("unrecognised aspect ratio '{raw}'"))
            },
        )
        .unwrap_or_else(|| {
            cascade.builtin("aspect_ratio");
            DEFAULT_ASPECT_RATIO.to_string()
        });

    let variations = cascade
        .pick("variations", &layers, |layer| layer.variations, |count| {
            match *count {
                0 => Err("variations must be at least 1".to_string()),
                n if n > MAX_VARIATIONS => Ok((
                    MAX_VARIATIONS,
                    Some(format!("variations {n} clamped to {MAX_VARIATIONS}.")),
                )),
                n => Ok((n, None)),
            }
        })
        .unwrap_or_else(|| {
            cascade.builtin("variations");
            1
        });

    let image_size = cascade.pick(
        "image_size",
        &layers,
        |layer| layer.image_size.clone(),
        |raw| {
            let normalized = raw.trim().to_ascii_uppercase();
            if matches!(normalized.as_str(), "1K" | "2K" | "4K") {
                Ok((normalized, None))
            } else {
                Err(format!("image size '{raw}' is not 1K, 2K or 4K"))
            }
        },
    );

    let prompt = cascade.pick_text("prompt", &layers, |layer| layer.prompt.clone());
    let model_description = cascade.pick_text("model_description", &layers, |layer| {
        layer.model_description.clone()
    });
    let pose = cascade.pick_text("pose", &layers, |layer| layer.pose.clone());
    let background = cascade.pick_text("background", &layers, |layer| layer.background.clone());
    let image_model = cascade.pick_text("image_model", &layers, |layer| layer.image_model.clone());

    ResolvedSettings {
        operation,
        prompt,
        model_description,
        pose,
        background,
        aspect_ratio,
        variations,
        image_model,
        image_size,
        context,
        sources,
        warnings,
    }
}

struct Cascade<'a> {
    sku: &'a str,
    sources: &'a mut BTreeMap<String, SettingSource>,
    warnings: &'a mut Vec<String>,
}

impl Cascade<'_> {
    fn pick<R, T>(
        &mut self,
        field: &str,
        layers: &[(SettingSource, &ItemSettings)],
        get: impl Fn(&ItemSettings) -> Option<R>,
        validate: impl Fn(&R) -> Result<(T, Option<String>), String>,
    ) -> Option<T> {
        for (source, layer) in layers {
            let Some(raw) = get(layer) else {
                continue;
            };
            match validate(&raw) {
                Ok((value, warning)) => {
                    if let Some(warning) = warning {
                        self.warn(format!("SKU {}: {warning}", self.sku));
                    }
                    self.sources.insert(field.to_string(), *source);
                    return Some(value);
                }
                Err(reason) => {
                    self.warn(format!(
                        "SKU {}: {field} from {source}: {reason}; falling back.",
                        self.sku
                    ));
                }
            }
        }
        None
    }

    fn pick_text(
        &mut self,
        field: &str,
        layers: &[(SettingSource, &ItemSettings)],
        get: impl Fn(&ItemSettings) -> Option<String>,
    ) -> Option<String> {
        self.pick(field, layers, get, |raw| {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                Err("empty value".to_string())
            } else {
                Ok((trimmed.to_string(), None))
            }
        })
    }

    fn builtin(&mut self, field: &str) {
        self.sources.insert(field.to_string(), SettingSource::Builtin);
    }

    fn warn(&mut self, message: String) {
        if !self.warnings.contains(&message) {
            self.warnings.push(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::*;
    use crate::catalog::MetadataSheet;

    fn sheet(value: Value) -> MetadataSheet {
        let rows: Vec<Map<String, Value>> = value
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|row| row.as_object().cloned())
            .collect();
        MetadataSheet::from_rows(rows)
    }

    fn defaults() -> ItemSettings {
        ItemSettings {
            operation: Some("model_photo".to_string()),
            background: Some("plain studio grey".to_string()),
            aspect_ratio: Some("3:4".to_string()),
            variations: Some(1),
            ..ItemSettings::default()
        }
    }

    #[test]
    fn override_beats_row_beats_default_per_field() {
        let sheet = sheet(json!([
            { "sku": "TS1", "Background": "beach", "Ratio": "4:5", "Title": "Linen shirt" }
        ]));
        let item_override = ItemSettings {
            aspect_ratio: Some("1:1".to_string()),
            ..ItemSettings::default()
        };
        let resolved = resolve_settings("TS1", Some(&item_override), sheet.get("TS1"), &defaults());

        assert_eq!(resolved.aspect_ratio, "1:1");
        assert_eq!(resolved.source_of("aspect_ratio"), Some(SettingSource::Override));
        assert_eq!(resolved.background.as_deref(), Some("beach"));
        assert_eq!(resolved.source_of("background"), Some(SettingSource::Sheet));
        assert_eq!(resolved.operation, BatchOperation::ModelPhoto);
        assert_eq!(resolved.source_of("operation"), Some(SettingSource::Default));
        assert_eq!(resolved.context.get("title"), Some(&json!("Linen shirt")));
        assert!(resolved.context.get("background").is_none());
        assert!(resolved.warnings.is_empty());
    }

    #[test]
    fn invalid_values_fall_through_with_warning() {
        let sheet = sheet(json!([{ "sku": "TS1", "operation": "teleport", "count": "0" }]));
        let item_override = ItemSettings {
            aspect_ratio: Some("enormous".to_string()),
            ..ItemSettings::default()
        };
        let resolved = resolve_settings("TS1", Some(&item_override), sheet.get("TS1"), &defaults());

        assert_eq!(resolved.operation, BatchOperation::ModelPhoto);
        assert_eq!(resolved.aspect_ratio, "3:4");
        assert_eq!(resolved.source_of("aspect_ratio"), Some(SettingSource::Default));
        assert_eq!(resolved.variations, 1);
        assert_eq!(resolved.warnings.len(), 3);
    }

    #[test]
    fn clamps_variations_and_snaps_ratio() {
        let sheet = sheet(json!([{ "sku": "TS1", "variations": 20, "aspect": "1080x1350" }]));
        let resolved = resolve_settings("TS1", None, sheet.get("TS1"), &defaults());
        assert_eq!(resolved.variations, MAX_VARIATIONS);
        assert_eq!(resolved.aspect_ratio, "4:5");
        assert_eq!(resolved.warnings.len(), 2);
    }

    #[test]
    fn builtin_fills_gaps_when_no_layer_has_a_value() {
        let resolved = resolve_settings("X", None, None, &ItemSettings::default());
        assert_eq!(resolved.operation, BatchOperation::ModelPhoto);
        assert_eq!(resolved.source_of("operation"), Some(SettingSource::Builtin));
        assert_eq!(resolved.aspect_ratio, "3:4");
        assert_eq!(resolved.variations, 1);
        assert!(resolved.pose.is_none());
        assert!(resolved.source_of("pose").is_none());
    }

    #[test]
    fn operation_aliases() {
        assert_eq!(BatchOperation::parse("Outpaint"), Some(BatchOperation::Expand));
        assert_eq!(BatchOperation::parse("pose-variation"), Some(BatchOperation::Pose));
        assert_eq!(BatchOperation::parse("on model"), Some(BatchOperation::ModelPhoto));
        assert_eq!(BatchOperation::parse("nope"), None);
    }
}
