//! Prompt builders. Each returns the ordered part list sent to the
//! provider: input images first, then the instruction text.

use serde_json::{Map, Value};

use crate::canvas::{CropRect, Hotspot};
use crate::data_url::DataUrl;
use crate::provider::PromptPart;

/// A source image with the label it is recorded under in receipts.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub source: String,
    pub image: DataUrl,
    pub dims: (u32, u32),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelBrief {
    pub model_description: Option<String>,
    pub pose: Option<String>,
    pub background: Option<String>,
    pub extra_prompt: Option<String>,
    /// Product columns such as title, colour or category.
    pub context: Map<String, Value>,
}

const PRESERVE_GARMENT: &str = "Reproduce the garment exactly as photographed: same colour, \
fabric texture, pattern, print placement, logos, stitching and proportions. Do not invent \
design details.";

pub fn model_photo(garments: &[SourceImage], brief: &ModelBrief) -> Vec<PromptPart> {
    let mut parts: Vec<PromptPart> = garments
        .iter()
        .map(|garment| PromptPart::image("garment", &garment.source, garment.image.clone()))
        .collect();

    let mut lines = vec![format!(
        "Create a professional e-commerce fashion photograph of a model wearing the garment shown in the {} reference image{}.",
        garments.len(),
        if garments.len() == 1 { "" } else { "s" }
    )];
    lines.push(PRESERVE_GARMENT.to_string());
    lines.push(format!(
        "Model: {}.",
        brief
            .model_description
            .as_deref()
            .unwrap_or("a professional fashion model with a natural expression")
    ));
    lines.push(format!(
        "Pose: {}.",
        brief
            .pose
            .as_deref()
            .unwrap_or("standing naturally, facing the camera, full garment visible")
    ));
    lines.push(format!(
        "Background: {}.",
        brief
            .background
            .as_deref()
            .unwrap_or("clean seamless light-grey studio backdrop with soft even lighting")
    ));
    let context = context_lines(&brief.context);
    if !context.is_empty() {
        lines.push(format!("Product details: {}.", context.join("; ")));
    }
    if let Some(extra) = brief.extra_prompt.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
        lines.push(format!("Additional direction: {extra}"));
    }
    parts.push(PromptPart::text(lines.join("\n")));
    parts
}

pub fn retouch_whole(image: &SourceImage, instruction: &str) -> Vec<PromptPart> {
    vec![
        PromptPart::image("source", &image.source, image.image.clone()),
        PromptPart::text(format!(
            "Edit this product photograph: {}\nKeep everything not mentioned unchanged, including the garment design, the model's identity and the framing.",
            instruction.trim()
        )),
    ]
}

pub fn retouch_point(image: &SourceImage, hotspot: Hotspot, instruction: &str) -> Vec<PromptPart> {
    vec![
        PromptPart::image("source", &image.source, image.image.clone()),
        PromptPart::text(format!(
            "The image is {}x{} pixels. Apply this edit only to the object at pixel ({}, {}), \
measured from the top-left corner: {}\nLeave the rest of the photograph untouched.",
            image.dims.0,
            image.dims.1,
            hotspot.x,
            hotspot.y,
            instruction.trim()
        )),
    ]
}

pub fn retouch_mask(image: &SourceImage, mask: DataUrl, instruction: &str) -> Vec<PromptPart> {
    vec![
        PromptPart::image("source", &image.source, image.image.clone()),
        PromptPart::image("mask", "mask.png", mask),
        PromptPart::text(format!(
            "The second image is a mask the same size as the first. Change only the region that \
is white in the mask; black areas must stay pixel-identical. Edit: {}",
            instruction.trim()
        )),
    ]
}

pub fn expand(padded: &SourceImage, original: CropRect) -> Vec<PromptPart> {
    vec![
        PromptPart::image("padded_canvas", &padded.source, padded.image.clone()),
        PromptPart::text(format!(
            "This {}x{} canvas contains the original photograph at x={}, y={}, {}x{} pixels; the \
flat grey border around it is empty. Extend the scene into the border seamlessly, matching \
lighting, perspective, background and any cropped parts of the model or garment. Do not alter \
the original region.",
            padded.dims.0,
            padded.dims.1,
            original.x,
            original.y,
            original.width,
            original.height
        )),
    ]
}

pub fn pose_variation(image: &SourceImage, pose: &str) -> Vec<PromptPart> {
    vec![
        PromptPart::image("source", &image.source, image.image.clone()),
        PromptPart::text(format!(
            "Show the same model wearing the same outfit in a new pose: {}.\n{} Keep the model's \
identity, hair, lighting and background consistent with the reference.",
            pose.trim().trim_end_matches('.'),
            PRESERVE_GARMENT
        )),
    ]
}

pub fn refine(image: &SourceImage, note: &str) -> Vec<PromptPart> {
    vec![
        PromptPart::image("source", &image.source, image.image.clone()),
        PromptPart::text(format!(
            "{} Restore fine detail and sharpness without changing composition, colours or \
content. Output the same framing.",
            note.trim()
        )),
    ]
}

fn context_lines(context: &Map<String, Value>) -> Vec<String> {
    context
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                Value::String(text) => text.trim().to_string(),
                Value::Number(number) => number.to_string(),
                Value::Bool(flag) => flag.to_string(),
                _ => return None,
            };
            if text.is_empty() {
                return None;
            }
            Some(format!("{}: {text}", key.replace('_', " ")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::*;

    fn source(name: &str) -> SourceImage {
        SourceImage {
            source: name.to_string(),
            image: DataUrl::new("image/png", vec![0]),
            dims: (800, 1000),
        }
    }

    fn text_of(parts: &[PromptPart]) -> String {
        match parts.last() {
            Some(PromptPart::Text(text)) => text.clone(),
            _ => String::new(),
        }
    }

    #[test]
    fn model_photo_lists_garments_then_brief() {
        let mut context = Map::new();
        context.insert("product_title".to_string(), json!("Linen shirt"));
        context.insert("colour".to_string(), json!("Sand"));
        context.insert("tags".to_string(), json!(["a"]));
        let brief = ModelBrief {
            model_description: Some("tall woman in her 30s".to_string()),
            background: None,
            pose: None,
            extra_prompt: Some("  golden hour  ".to_string()),
            context,
        };
        let parts = model_photo(&[source("front.png"), source("back.png")], &brief);
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[0], PromptPart::Image { role, source, .. } if role == "garment" && source == "front.png"));

        let text = text_of(&parts);
        assert!(text.contains("2 reference images"));
        assert!(text.contains("Model: tall woman in her 30s."));
        assert!(text.contains("studio backdrop"));
        assert!(text.contains("Product details: colour: Sand; product title: Linen shirt."));
        assert!(text.contains("Additional direction: golden hour"));
    }

    #[test]
    fn point_prompt_names_pixel_and_size() {
        let parts = retouch_point(&source("a.png"), Hotspot { x: 12, y: 40 }, "remove stain ");
        let text = text_of(&parts);
        assert!(text.contains("800x1000"));
        assert!(text.contains("pixel (12, 40)"));
        assert!(text.contains("remove stain\n"));
    }

    #[test]
    fn mask_prompt_sends_mask_after_image() {
        let parts = retouch_mask(&source("a.png"), DataUrl::new("image/png", vec![1]), "navy collar");
        assert!(matches!(&parts[1], PromptPart::Image { role, .. } if role == "mask"));
        assert!(text_of(&parts).ends_with("Edit: navy collar"));
    }

    #[test]
    fn expand_prompt_describes_original_box() {
        let parts = expand(
            &source("padded.png"),
            CropRect {
                x: 100,
                y: 0,
                width: 600,
                height: 1000,
            },
        );
        assert!(text_of(&parts).contains("x=100, y=0, 600x1000"));
    }
}
