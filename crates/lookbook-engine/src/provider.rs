use std::collections::BTreeMap;

use anyhow::Result;
use image::{DynamicImage, Rgb, RgbImage};
use lookbook_contracts::aspect::dims_for_ratio;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::data_url::DataUrl;
use crate::util::map_object;

/// One ordered piece of a multimodal prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptPart {
    Text(String),
    Image {
        role: String,
        source: String,
        image: DataUrl,
    },
}

impl PromptPart {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn image(role: &str, source: impl Into<String>, image: DataUrl) -> Self {
        Self::Image {
            role: role.to_string(),
            source: source.into(),
            image,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationCall {
    pub model: String,
    pub parts: Vec<PromptPart>,
    pub aspect_ratio: Option<String>,
    pub image_size: Option<String>,
    pub provider_options: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

impl GenerationCall {
    /// Every text part joined with blank lines.
    pub fn prompt_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                PromptPart::Text(text) => Some(text.as_str()),
                PromptPart::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn input_images(&self) -> impl Iterator<Item = (&str, &str, &DataUrl)> {
        self.parts.iter().filter_map(|part| match part {
            PromptPart::Image {
                role,
                source,
                image,
            } => Some((role.as_str(), source.as_str(), image)),
            PromptPart::Text(_) => None,
        })
    }

    pub fn input_image_count(&self) -> u32 {
        self.input_images().count() as u32
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub image: DataUrl,
    pub text: Option<String>,
    pub provider_request: Map<String, Value>,
    pub provider_response: Map<String, Value>,
    pub warnings: Vec<String>,
}

pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, call: &GenerationCall) -> Result<GenerationOutcome>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Box<dyn GenerationProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: GenerationProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn GenerationProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// Offline provider: a solid colour derived from the prompt, sized from the
/// requested aspect ratio and size tier.
pub struct DryrunProvider;

impl DryrunProvider {
    fn longest_side(image_size: Option<&str>) -> u32 {
        match image_size.map(|value| value.trim().to_ascii_uppercase()).as_deref() {
            Some("2K") => 2048,
            Some("4K") => 4096,
            _ => 1024,
        }
    }
}

impl GenerationProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, call: &GenerationCall) -> Result<GenerationOutcome> {
        let ratio = call.aspect_ratio.as_deref().unwrap_or("1:1");
        let longest = Self::longest_side(call.image_size.as_deref());
        let (width, height) = dims_for_ratio(ratio, longest);
        let prompt = call.prompt_text();
        let (r, g, b) = color_from_prompt(&prompt, call.input_image_count() as u64);
        let canvas = RgbImage::from_pixel(width, height, Rgb([r, g, b]));
        let image = DataUrl::from_image(&DynamicImage::ImageRgb8(canvas))?;

        Ok(GenerationOutcome {
            image,
            text: None,
            provider_request: map_object(json!({
                "endpoint": "dryrun-native",
                "payload": {
                    "model": call.model,
                    "prompt": prompt,
                    "aspect_ratio": ratio,
                    "image_size": call.image_size,
                    "input_images": call.input_image_count(),
                }
            })),
            provider_response: map_object(json!({
                "status": "ok",
                "width": width,
                "height": height,
            })),
            warnings: Vec::new(),
        })
    }
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
