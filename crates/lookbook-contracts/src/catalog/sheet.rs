use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context};
use serde_json::{Map, Value};

pub const SKU_COLUMNS: &[&str] = &["sku", "style", "style_code", "product_id", "article"];

#[derive(Debug, Clone, PartialEq)]
pub struct SheetRow {
    pub sku: String,
    /// Column names normalised to lower snake case; the SKU column is removed.
    pub columns: Map<String, Value>,
}

impl SheetRow {
    pub fn text(&self, column: &str) -> Option<String> {
        value_as_text(self.columns.get(column)?)
    }
}

/// Product metadata rows keyed by SKU. Rows arrive already parsed from the
/// uploaded spreadsheet as JSON objects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataSheet {
    rows: BTreeMap<String, SheetRow>,
    pub warnings: Vec<String>,
}

impl MetadataSheet {
    pub fn from_rows(rows: Vec<Map<String, Value>>) -> Self {
        let mut sheet = Self::default();
        for (idx, row) in rows.into_iter().enumerate() {
            let mut columns = Map::new();
            for (key, value) in row {
                let normalized = normalize_column(&key);
                if normalized.is_empty() {
                    continue;
                }
                columns.insert(normalized, value);
            }

            let sku_column = SKU_COLUMNS
                .iter()
                .find(|column| {
                    columns
                        .get(**column)
                        .and_then(value_as_text)
                        .is_some()
                })
                .copied();
            let Some(sku_column) = sku_column else {
                sheet
                    .warnings
                    .push(format!("Row {} has no SKU column; skipped.", idx + 1));
                continue;
            };
            let sku = columns
                .remove(sku_column)
                .as_ref()
                .and_then(value_as_text)
                .map(|value| value.to_ascii_uppercase())
                .unwrap_or_default();

            if sheet.rows.contains_key(&sku) {
                sheet.warnings.push(format!(
                    "Duplicate row for SKU {sku} (row {}); later row wins.",
                    idx + 1
                ));
            }
            sheet.rows.insert(sku.clone(), SheetRow { sku, columns });
        }
        sheet
    }

    /// Accepts a top-level array of row objects or `{ "rows": [...] }`.
    pub fn load_json(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading metadata {}", path.display()))?;
        let parsed: Value = serde_json::from_str(&raw)
            .with_context(|| format!("invalid metadata JSON {}", path.display()))?;
        let rows = match parsed {
            Value::Array(rows) => rows,
            Value::Object(mut map) => match map.remove("rows") {
                Some(Value::Array(rows)) => rows,
                _ => bail!("metadata {} has no rows array", path.display()),
            },
            _ => bail!("metadata {} must be an array of rows", path.display()),
        };
        Ok(Self::from_rows(
            rows.into_iter()
                .filter_map(|row| match row {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
        ))
    }

    pub fn get(&self, sku: &str) -> Option<&SheetRow> {
        self.rows.get(&sku.trim().to_ascii_uppercase())
    }

    pub fn skus(&self) -> impl Iterator<Item = &str> {
        self.rows.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn normalize_column(raw: &str) -> String {
    let mut out = String::new();
    for ch in raw.trim().chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    out.trim_end_matches('_').to_string()
}

pub(crate) fn value_as_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        return None;
    }
    Some(text)
}
