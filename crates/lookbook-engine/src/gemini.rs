use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

use crate::data_url::DataUrl;
use crate::provider::{GenerationCall, GenerationOutcome, GenerationProvider, PromptPart};
use crate::util::{map_object, push_unique_warning, truncate_text, value_as_f64};

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiProvider {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new(api_base: Option<&str>, api_key: Option<String>) -> Self {
        Self {
            api_base: api_base
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string()),
            api_key: api_key.filter(|value| !value.trim().is_empty()),
            http: HttpClient::new(),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_parts(call: &GenerationCall) -> Vec<Value> {
        call.parts
            .iter()
            .map(|part| match part {
                PromptPart::Text(text) => json!({ "text": text }),
                PromptPart::Image { image, .. } => json!({
                    "inlineData": {
                        "mimeType": image.mime,
                        "data": image.base64(),
                    }
                }),
            })
            .collect()
    }

    fn resolve_image_size(call: &GenerationCall) -> Option<String> {
        call.provider_options
            .get("image_size")
            .and_then(Value::as_str)
            .or(call.image_size.as_deref())
            .map(|value| value.trim().to_ascii_uppercase())
            .filter(|value| matches!(value.as_str(), "1K" | "2K" | "4K"))
    }

    fn default_safety_settings() -> Vec<Value> {
        [
            "HARM_CATEGORY_HARASSMENT",
            "HARM_CATEGORY_HATE_SPEECH",
            "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            "HARM_CATEGORY_DANGEROUS_CONTENT",
        ]
        .into_iter()
        .map(|category| {
            json!({
                "category": category,
                "threshold": "BLOCK_ONLY_HIGH",
            })
        })
        .collect()
    }

    pub fn build_payload(call: &GenerationCall) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            Value::Array(vec![json!({
                "role": "user",
                "parts": Self::build_parts(call),
            })]),
        );

        let mut generation_config = Map::new();
        generation_config.insert("candidateCount".to_string(), Value::Number(1.into()));
        generation_config.insert(
            "responseModalities".to_string(),
            json!(["IMAGE", "TEXT"]),
        );
        let aspect_ratio = call
            .provider_options
            .get("aspect_ratio")
            .and_then(Value::as_str)
            .or(call.aspect_ratio.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let mut image_config = Map::new();
        if let Some(aspect_ratio) = aspect_ratio {
            image_config.insert(
                "aspectRatio".to_string(),
                Value::String(aspect_ratio.to_string()),
            );
        }
        if let Some(image_size) = Self::resolve_image_size(call) {
            image_config.insert("imageSize".to_string(), Value::String(image_size));
        }
        if !image_config.is_empty() {
            generation_config.insert("imageConfig".to_string(), Value::Object(image_config));
        }
        payload.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );

        let safety_settings = call
            .provider_options
            .get("safety_settings")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_else(Self::default_safety_settings);
        payload.insert("safetySettings".to_string(), Value::Array(safety_settings));
        payload
    }

    fn request_timeout_seconds(call: &GenerationCall) -> f64 {
        value_as_f64(call.provider_options.get("request_timeout"), 90.0, 15.0, 300.0)
    }

    fn transport_retry_count(call: &GenerationCall) -> usize {
        value_as_f64(call.provider_options.get("transport_retries"), 2.0, 0.0, 4.0).round()
            as usize
    }

    fn retry_backoff_seconds(call: &GenerationCall) -> f64 {
        value_as_f64(call.provider_options.get("retry_backoff"), 1.2, 0.1, 10.0)
    }

    fn post_with_transport_retries(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
        timeout_s: f64,
        max_retries: usize,
        retry_backoff_s: f64,
        warnings: &mut Vec<String>,
    ) -> Result<HttpResponse> {
        let mut attempt = 0;
        loop {
            let response = self
                .http
                .post(endpoint)
                .query(&[("key", api_key)])
                .timeout(Duration::from_secs_f64(timeout_s))
                .json(payload)
                .send();

            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    let err = anyhow::Error::new(raw)
                        .context(format!("Gemini request failed ({endpoint})"));
                    if !is_retryable_transport_error(&err) || attempt >= max_retries {
                        return Err(err);
                    }
                    push_unique_warning(
                        warnings,
                        format!(
                            "Gemini transport retry {}/{} after transient request failure.",
                            attempt + 1,
                            max_retries
                        ),
                    );
                    let delay_s = retry_backoff_s * (attempt as f64 + 1.0);
                    thread::sleep(Duration::from_secs_f64(delay_s));
                    attempt += 1;
                }
            }
        }
    }
}

/// First inline image of any candidate. Without one, the error names the
/// prompt block reason, then a candidate finish reason, then whatever text
/// the model replied with.
pub fn parse_generate_response(payload: &Value) -> Result<(DataUrl, Option<String>)> {
    let candidates = payload
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut texts = Vec::new();
    let mut finish_reason: Option<String> = None;

    for candidate in &candidates {
        if finish_reason.is_none() {
            finish_reason = candidate
                .get("finishReason")
                .and_then(Value::as_str)
                .filter(|reason| !matches!(*reason, "" | "STOP"))
                .map(str::to_string);
        }
        let parts = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if !text.trim().is_empty() {
                    texts.push(text.trim().to_string());
                }
            }
            let Some(inline) = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
            else {
                continue;
            };
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let bytes = BASE64
                .decode(data.as_bytes())
                .context("Gemini image base64 decode failed")?;
            let mime = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            let text = (!texts.is_empty()).then(|| texts.join("\n"));
            return Ok((DataUrl::new(mime, bytes), text));
        }
    }

    if let Some(block_reason) = payload
        .get("promptFeedback")
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str)
    {
        bail!("Gemini blocked the prompt ({block_reason})");
    }
    if let Some(finish_reason) = finish_reason {
        bail!("Gemini returned no image (finish reason {finish_reason})");
    }
    if !texts.is_empty() {
        bail!(
            "Gemini returned text instead of an image: {}",
            truncate_text(&texts.join(" "), 512)
        );
    }
    bail!("Gemini returned no image");
}

impl GenerationProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, call: &GenerationCall) -> Result<GenerationOutcome> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(&call.model);
        let mut warnings = Vec::new();
        let payload = Self::build_payload(call);
        let payload_value = Value::Object(payload.clone());

        let response = self.post_with_transport_retries(
            &endpoint,
            api_key,
            &payload_value,
            Self::request_timeout_seconds(call),
            Self::transport_retry_count(call),
            Self::retry_backoff_seconds(call),
            &mut warnings,
        )?;
        let response_payload = response_json_or_error("Gemini", response)?;
        let (image, text) = parse_generate_response(&response_payload)?;

        Ok(GenerationOutcome {
            image,
            text: text.clone(),
            provider_request: map_object(json!({
                "endpoint": endpoint,
                "payload": payload,
            })),
            provider_response: map_object(json!({
                "candidates": response_payload
                    .get("candidates")
                    .and_then(Value::as_array)
                    .map(|rows| rows.len())
                    .unwrap_or(0),
                "text": text,
                "usage_metadata": response_payload.get("usageMetadata").cloned().unwrap_or(Value::Null),
            })),
            warnings,
        })
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{parse_generate_response, GeminiProvider};
    use crate::data_url::DataUrl;
    use crate::provider::{GenerationCall, GenerationProvider, PromptPart};

    fn call() -> GenerationCall {
        let mut provider_options = Map::new();
        provider_options.insert("image_size".to_string(), json!("2k"));
        GenerationCall {
            model: "gemini-2.5-flash-image".to_string(),
            parts: vec![
                PromptPart::image("garment", "shirt.png", DataUrl::new("image/png", b"hi".to_vec())),
                PromptPart::text("Dress a model in this shirt."),
            ],
            aspect_ratio: Some("3:4".to_string()),
            image_size: None,
            provider_options,
            metadata: Map::new(),
        }
    }

    #[test]
    fn payload_keeps_part_order_and_image_config() {
        let payload = Value::Object(GeminiProvider::build_payload(&call()));
        let parts = &payload["contents"][0]["parts"];
        assert_eq!(parts[0]["inlineData"]["mimeType"], json!("image/png"));
        assert_eq!(parts[0]["inlineData"]["data"], json!("aGk="));
        assert_eq!(parts[1]["text"], json!("Dress a model in this shirt."));

        let config = &payload["generationConfig"];
        assert_eq!(config["candidateCount"], json!(1));
        assert_eq!(config["responseModalities"], json!(["IMAGE", "TEXT"]));
        assert_eq!(config["imageConfig"]["aspectRatio"], json!("3:4"));
        assert_eq!(config["imageConfig"]["imageSize"], json!("2K"));
        assert_eq!(payload["safetySettings"][0]["threshold"], json!("BLOCK_ONLY_HIGH"));
    }

    #[test]
    fn endpoint_uses_model_path() {
        let provider = GeminiProvider::new(Some("https://example.test/v1beta/"), None);
        assert_eq!(
            provider.endpoint_for_model("gemini-2.5-flash-image"),
            "https://example.test/v1beta/models/gemini-2.5-flash-image:generateContent"
        );
        assert_eq!(
            provider.endpoint_for_model("models/custom"),
            "https://example.test/v1beta/models/custom:generateContent"
        );
    }

    #[test]
    fn missing_key_fails_before_network() {
        let provider = GeminiProvider::new(None, Some("  ".to_string()));
        let err = provider.generate(&call()).err().map(|err| err.to_string());
        assert_eq!(err.as_deref(), Some("GEMINI_API_KEY or GOOGLE_API_KEY not set"));
    }

    #[test]
    fn response_image_is_extracted() -> anyhow::Result<()> {
        let payload = json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "Here you go." },
                    { "inline_data": { "mime_type": "image/jpeg", "data": "aGk=" } }
                ]},
                "finishReason": "STOP"
            }]
        });
        let (image, text) = parse_generate_response(&payload)?;
        assert_eq!(image.mime, "image/jpeg");
        assert_eq!(image.bytes, b"hi");
        assert_eq!(text.as_deref(), Some("Here you go."));
        Ok(())
    }

    #[test]
    fn missing_image_errors_follow_priority() {
        let message = |payload: Value| {
            parse_generate_response(&payload)
                .err()
                .map(|err| err.to_string())
                .unwrap_or_default()
        };

        assert_eq!(
            message(json!({
                "promptFeedback": { "blockReason": "SAFETY" },
                "candidates": [{ "finishReason": "OTHER", "content": { "parts": [{ "text": "no" }] } }]
            })),
            "Gemini blocked the prompt (SAFETY)"
        );
        assert_eq!(
            message(json!({
                "candidates": [{ "finishReason": "IMAGE_SAFETY", "content": { "parts": [{ "text": "no" }] } }]
            })),
            "Gemini returned no image (finish reason IMAGE_SAFETY)"
        );
        assert_eq!(
            message(json!({
                "candidates": [{ "finishReason": "STOP", "content": { "parts": [{ "text": "I cannot edit that." }] } }]
            })),
            "Gemini returned text instead of an image: I cannot edit that."
        );
        assert_eq!(message(json!({})), "Gemini returned no image");
    }
}
