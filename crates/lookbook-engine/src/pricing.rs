//! Cost arithmetic over request shapes. Prices come from the bundled table
//! merged with `pricing_overrides.json` under the lookbook home directory.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::util::parse_value_to_f64;

const DEFAULT_PRICING_TABLES_JSON: &str = include_str!("../resources/default_pricing.json");

#[derive(Debug, Clone, Default)]
pub struct PricingTables {
    rows: BTreeMap<String, Map<String, Value>>,
}

/// What a call sends and receives, which is all the ledger needs to price it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestShape {
    pub input_images: u32,
    pub text_chars: u64,
    pub output_images: u32,
    pub image_size: Option<String>,
    pub output_dims: Option<(u32, u32)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostEstimate {
    pub size_tier: Option<String>,
    pub input_text_tokens: u64,
    pub input_tokens: u64,
    pub cost_per_image_usd: f64,
    pub input_cost_usd: f64,
    pub output_cost_usd: f64,
    pub total_usd: f64,
}

impl PricingTables {
    pub fn bundled() -> Self {
        let mut tables = Self::default();
        tables.merge_json(DEFAULT_PRICING_TABLES_JSON);
        tables
    }

    /// Bundled table overlaid field by field with `override_path` when it exists.
    pub fn load(override_path: Option<&Path>) -> Self {
        let mut tables = Self::bundled();
        if let Some(path) = override_path {
            if let Ok(raw) = std::fs::read_to_string(path) {
                tables.merge_json(&raw);
            }
        }
        tables
    }

    pub fn merge_json(&mut self, raw: &str) {
        let Ok(payload) = serde_json::from_str::<Value>(raw) else {
            return;
        };
        let Some(table) = payload.as_object() else {
            return;
        };
        for (pricing_key, row_value) in table {
            let Some(row) = row_value.as_object() else {
                continue;
            };
            let entry = self.rows.entry(pricing_key.to_string()).or_default();
            for (field, field_value) in row {
                entry.insert(field.to_string(), field_value.clone());
            }
        }
    }

    pub fn row(&self, pricing_key: &str) -> Option<&Map<String, Value>> {
        self.rows.get(pricing_key.trim())
    }

    /// Absolute per-tier price wins over a tier multiplier on the base price.
    pub fn cost_per_image(&self, pricing_key: &str, tier: Option<&str>) -> Option<f64> {
        let row = self.row(pricing_key)?;
        let base_cost = row.get("cost_per_image_usd").and_then(parse_value_to_f64)?;
        let Some(tier) = tier else {
            return Some(base_cost);
        };
        if let Some(cost) = row
            .get("cost_per_image_usd_by_image_size")
            .and_then(Value::as_object)
            .and_then(|abs_map| abs_map.get(tier))
            .and_then(parse_value_to_f64)
        {
            return Some(cost);
        }
        if let Some(multiplier) = row
            .get("cost_multipliers_by_image_size")
            .and_then(Value::as_object)
            .and_then(|mult_map| mult_map.get(tier))
            .and_then(parse_value_to_f64)
        {
            return Some(base_cost * multiplier);
        }
        Some(base_cost)
    }

    pub fn estimate(&self, pricing_key: Option<&str>, shape: &RequestShape) -> CostEstimate {
        let size_tier = resolve_image_size_tier(shape.image_size.as_deref(), shape.output_dims);
        let input_text_tokens = text_tokens_for_chars(shape.text_chars);
        let Some(row) = pricing_key.and_then(|key| self.row(key)) else {
            return CostEstimate {
                size_tier,
                input_text_tokens,
                input_tokens: input_text_tokens,
                ..CostEstimate::default()
            };
        };
        let tokens_per_input_image = row
            .get("tokens_per_input_image")
            .and_then(parse_value_to_f64)
            .unwrap_or(0.0)
            .max(0.0) as u64;
        let input_cost_per_1m = row
            .get("input_cost_per_1m_tokens_usd")
            .and_then(parse_value_to_f64)
            .unwrap_or(0.0);
        let cost_per_image_usd = pricing_key
            .and_then(|key| self.cost_per_image(key, size_tier.as_deref()))
            .unwrap_or(0.0);

        let input_tokens = u64::from(shape.input_images) * tokens_per_input_image + input_text_tokens;
        let input_cost_usd = input_tokens as f64 * input_cost_per_1m / 1_000_000.0;
        let output_cost_usd = f64::from(shape.output_images) * cost_per_image_usd;
        CostEstimate {
            size_tier,
            input_text_tokens,
            input_tokens,
            cost_per_image_usd,
            input_cost_usd,
            output_cost_usd,
            total_usd: input_cost_usd + output_cost_usd,
        }
    }

    pub fn latency_per_image(&self, latency_key: Option<&str>, measured_latency: f64) -> f64 {
        latency_key
            .and_then(|key| self.row(key))
            .and_then(|row| row.get("latency_per_image_s"))
            .and_then(parse_value_to_f64)
            .unwrap_or(measured_latency)
    }
}

pub fn estimate_tokens(text: &str) -> u64 {
    text_tokens_for_chars(text.chars().count() as u64)
}

fn text_tokens_for_chars(chars: u64) -> u64 {
    chars.div_ceil(4)
}

/// An explicit `1K|2K|4K` wins; otherwise the longest output side picks
/// 4K at 3600px and 2K at 1800px. Smaller outputs have no tier.
pub fn resolve_image_size_tier(image_size: Option<&str>, dims: Option<(u32, u32)>) -> Option<String> {
    if let Some(raw) = image_size {
        let normalized = raw.trim().to_ascii_uppercase();
        if matches!(normalized.as_str(), "1K" | "2K" | "4K") {
            return Some(normalized);
        }
    }
    let (width, height) = dims?;
    let longest = width.max(height);
    if longest >= 3600 {
        return Some("4K".to_string());
    }
    if longest >= 1800 {
        return Some("2K".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{estimate_tokens, resolve_image_size_tier, PricingTables, RequestShape};

    fn close(left: f64, right: f64) -> bool {
        (left - right).abs() < 1e-12
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn size_tier_prefers_explicit_value() {
        assert_eq!(resolve_image_size_tier(Some("4k"), Some((512, 512))).as_deref(), Some("4K"));
        assert_eq!(resolve_image_size_tier(None, Some((1800, 900))).as_deref(), Some("2K"));
        assert_eq!(resolve_image_size_tier(None, Some((3000, 3600))).as_deref(), Some("4K"));
        assert_eq!(resolve_image_size_tier(Some("huge"), Some((1024, 1024))), None);
        assert_eq!(resolve_image_size_tier(None, None), None);
    }

    #[test]
    fn estimate_combines_input_and_output_cost() {
        let tables = PricingTables::bundled();
        let estimate = tables.estimate(
            Some("google-gemini-2.5-flash-image"),
            &RequestShape {
                input_images: 2,
                text_chars: 400,
                output_images: 1,
                image_size: None,
                output_dims: None,
            },
        );
        assert_eq!(estimate.input_text_tokens, 100);
        assert_eq!(estimate.input_tokens, 2 * 258 + 100);
        assert!(close(estimate.input_cost_usd, 616.0 * 0.30 / 1_000_000.0));
        assert!(close(estimate.output_cost_usd, 0.039));
        assert!(close(estimate.total_usd, estimate.input_cost_usd + 0.039));
    }

    #[test]
    fn tier_prices_and_multipliers() {
        let mut tables = PricingTables::bundled();
        assert_eq!(
            tables.cost_per_image("google-gemini-3-pro-image-preview", Some("4K")),
            Some(0.24)
        );
        tables.merge_json(
            r#"{"custom": {"cost_per_image_usd": 0.1, "cost_multipliers_by_image_size": {"2K": 1.5}}}"#,
        );
        let cost = tables.cost_per_image("custom", Some("2K")).unwrap_or_default();
        assert!(close(cost, 0.15));
        assert_eq!(tables.cost_per_image("custom", Some("4K")), Some(0.1));
        assert_eq!(tables.cost_per_image("missing", None), None);
    }

    #[test]
    fn overrides_merge_field_by_field() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("pricing_overrides.json");
        std::fs::write(
            &path,
            r#"{"google-gemini-2.5-flash-image": {"cost_per_image_usd": 0.05}}"#,
        )?;
        let tables = PricingTables::load(Some(&path));
        let row = tables
            .row("google-gemini-2.5-flash-image")
            .cloned()
            .unwrap_or_default();
        assert_eq!(row["cost_per_image_usd"], serde_json::json!(0.05));
        assert_eq!(row["tokens_per_input_image"], serde_json::json!(258));
        Ok(())
    }

    #[test]
    fn unknown_pricing_key_costs_nothing() {
        let estimate = PricingTables::bundled().estimate(
            None,
            &RequestShape {
                input_images: 1,
                text_chars: 8,
                output_images: 1,
                ..RequestShape::default()
            },
        );
        assert_eq!(estimate.input_tokens, 2);
        assert_eq!(estimate.total_usd, 0.0);
    }
}
