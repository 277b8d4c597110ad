//! Gemini `generateContent` image client.

use crate::error::ProviderError;
use crate::provider::payload::GenerationPayload;
use crate::provider::poll::{poll_until, PollConfig, PollStatus};
use crate::provider::{
    parse_json_body, send_for_body, ApiCredentials, ImageProvider, RawArtifact,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, info};

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Finish reasons that mean the output was withheld by a safety filter.
const POLICY_FINISH_REASONS: [&str; 6] = [
    "SAFETY",
    "IMAGE_SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
    "RECITATION",
];

pub struct GeminiProvider {
    client: Client,
    model: String,
    endpoint: String,
    poll: PollConfig,
}

impl GeminiProvider {
    pub fn new(client: Client, model: String, endpoint: String, poll: PollConfig) -> Self {
        Self {
            client,
            model,
            endpoint,
            poll,
        }
    }

    /// "Pro" models accept an explicit output size.
    fn supports_image_size(&self) -> bool {
        self.model.contains("pro")
    }

    pub fn build_body(&self, payload: &GenerationPayload) -> Value {
        let mut parts = Vec::with_capacity(payload.images.len() * 2 + 1);
        for (index, image) in payload.images.iter().enumerate() {
            if let Some(tag) = payload.tag_for(image) {
                parts.push(json!({ "text": format!("Image {}: {}", index + 1, tag) }));
            }
            parts.push(json!({
                "inline_data": {
                    "mime_type": image.mime_type(),
                    "data": STANDARD.encode(&image.bytes),
                }
            }));
        }

        let (width, height) = payload.output_dimensions();
        let mut text = payload.prompt.clone();
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str(&format!(
            "CRITICAL OUTPUT SETTING: Generate image EXACTLY at {}x{} pixels.",
            width, height
        ));
        parts.push(json!({ "text": text }));

        let mut image_config = json!({ "aspectRatio": payload.aspect.label() });
        if self.supports_image_size() {
            image_config["imageSize"] = json!(payload.resolution.label());
        }

        json!({
            "contents": [{ "parts": parts }],
            "generationConfig": {
                "temperature": 0.8,
                "candidateCount": 1,
                "responseModalities": ["IMAGE"],
                "imageConfig": image_config,
            }
        })
    }

    async fn wait_for_operation(
        &self,
        name: &str,
        credentials: &ApiCredentials,
    ) -> Result<Value, ProviderError> {
        let url = format!("{}/{}", self.endpoint, name.trim_start_matches('/'));
        info!(operation = name, "Polling long-running operation");
        poll_until(&self.poll, |_| {
            let request = self
                .client
                .get(&url)
                .header(API_KEY_HEADER, credentials.api_key());
            async move {
                let body = send_for_body(request).await?;
                let operation = parse_json_body(&body)?;
                if operation.get("done").and_then(Value::as_bool).unwrap_or(false) {
                    Ok(PollStatus::Ready(operation))
                } else {
                    Ok(PollStatus::Pending)
                }
            }
        })
        .await
    }
}

#[async_trait]
impl ImageProvider for GeminiProvider {
    async fn generate(
        &self,
        payload: &GenerationPayload,
        credentials: &ApiCredentials,
    ) -> Result<Vec<RawArtifact>, ProviderError> {
        if credentials.is_empty() {
            return Err(ProviderError::AuthFailure("API key is not set".to_string()));
        }

        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
        let start = Instant::now();
        debug!(
            model = %self.model,
            images = payload.images.len(),
            image_bytes = payload.total_image_bytes(),
            aspect = payload.aspect.label(),
            resolution = payload.resolution.label(),
            "Sending Gemini generation request"
        );

        let request = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, credentials.api_key())
            .json(&self.build_body(payload));
        let body = send_for_body(request).await?;
        let mut response = parse_json_body(&body)?;

        if let Some(name) = pending_operation_name(&response) {
            let operation = self.wait_for_operation(&name, credentials).await?;
            response = operation_result(operation)?;
        }

        let artifacts = parse_generate_response(&response)?;
        info!(
            model = %self.model,
            images = artifacts.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Gemini generation completed"
        );
        Ok(artifacts)
    }

    fn provider_name(&self) -> &str {
        "gemini"
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Name of an unfinished long-running operation, if the response is one.
fn pending_operation_name(response: &Value) -> Option<String> {
    if response.get("candidates").is_some() || response.get("promptFeedback").is_some() {
        return None;
    }
    let name = response.get("name")?.as_str()?;
    let done = response.get("done").and_then(Value::as_bool).unwrap_or(false);
    (!done).then(|| name.to_string())
}

/// Unwrap a finished operation into its response object.
fn operation_result(mut operation: Value) -> Result<Value, ProviderError> {
    if let Some(error) = operation.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("operation failed")
            .to_string();
        let code = error.get("code").and_then(Value::as_u64).unwrap_or(0);
        return Err(match code {
            // google.rpc.Code values
            3 | 5 | 9 | 11 => ProviderError::InvalidRequest(message),
            7 | 16 => ProviderError::AuthFailure(message),
            8 => ProviderError::RateLimited {
                message,
                retry_after: None,
            },
            _ => ProviderError::Transient(message),
        });
    }
    operation
        .get_mut("response")
        .map(Value::take)
        .ok_or_else(|| {
            ProviderError::InvalidRequest("operation finished without a response".to_string())
        })
}

/// Extract images from a `generateContent` response body.
pub fn parse_generate_response(response: &Value) -> Result<Vec<RawArtifact>, ProviderError> {
    if let Some(reason) = response
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
    {
        return Err(ProviderError::ContentPolicyRejected(format!(
            "Blocked by {}",
            reason
        )));
    }

    let candidate = response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| {
            ProviderError::InvalidRequest(
                "No image generated. The model may have rejected the request.".to_string(),
            )
        })?;

    let mut artifacts = Vec::new();
    let parts = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for part in parts {
        let Some(inline) = part.get("inline_data").or_else(|| part.get("inlineData")) else {
            continue;
        };
        let Some(data) = inline
            .get("data")
            .or_else(|| inline.get("bytes"))
            .and_then(Value::as_str)
            .filter(|d| !d.is_empty())
        else {
            continue;
        };
        let bytes = STANDARD.decode(data).map_err(|e| {
            ProviderError::Transient(format!("Undecodable image data in response: {}", e))
        })?;
        let mime_type = inline
            .get("mime_type")
            .or_else(|| inline.get("mimeType"))
            .and_then(Value::as_str)
            .map(str::to_string);
        artifacts.push(RawArtifact::new(bytes, mime_type));
    }

    if !artifacts.is_empty() {
        return Ok(artifacts);
    }

    if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
        if POLICY_FINISH_REASONS.contains(&reason) {
            return Err(ProviderError::ContentPolicyRejected(format!(
                "Generation stopped: {}",
                reason
            )));
        }
    }

    let text: Vec<&str> = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        Err(ProviderError::InvalidRequest(
            "No image data found in API response".to_string(),
        ))
    } else {
        Err(ProviderError::InvalidRequest(format!(
            "Model replied with text instead of an image: {}",
            text.join(" ").chars().take(200).collect::<String>()
        )))
    }
}
