//! Seedream client (OpenAI images-style `images/generations`).

use crate::error::ProviderError;
use crate::provider::payload::GenerationPayload;
use crate::provider::{
    parse_json_body, send_for_body, ApiCredentials, ImageProvider, RawArtifact,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
pub struct SeedreamRequest {
    pub model: String,
    pub prompt: String,
    pub size: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub image: Vec<String>,
    pub response_format: &'static str,
    pub watermark: bool,
    pub sequential_image_generation: &'static str,
}

pub struct SeedreamProvider {
    client: Client,
    model: String,
    endpoint: String,
}

impl SeedreamProvider {
    pub fn new(client: Client, model: String, endpoint: String) -> Self {
        Self {
            client,
            model,
            endpoint,
        }
    }

    /// The aspect policy travels as an explicit `WIDTHxHEIGHT` size.
    pub fn build_request(&self, payload: &GenerationPayload) -> SeedreamRequest {
        let (width, height) = payload.output_dimensions();
        let image = payload
            .images
            .iter()
            .map(|img| format!("data:{};base64,{}", img.mime_type(), STANDARD.encode(&img.bytes)))
            .collect();

        SeedreamRequest {
            model: self.model.clone(),
            prompt: payload.prompt.clone(),
            size: format!("{}x{}", width, height),
            image,
            response_format: "b64_json",
            watermark: false,
            sequential_image_generation: "disabled",
        }
    }
}

#[async_trait]
impl ImageProvider for SeedreamProvider {
    async fn generate(
        &self,
        payload: &GenerationPayload,
        credentials: &ApiCredentials,
    ) -> Result<Vec<RawArtifact>, ProviderError> {
        if credentials.is_empty() {
            return Err(ProviderError::AuthFailure("API key is not set".to_string()));
        }

        let url = format!("{}/images/generations", self.endpoint);
        let start = Instant::now();
        debug!(
            model = %self.model,
            images = payload.images.len(),
            resolution = payload.resolution.label(),
            aspect = %payload.aspect,
            "Sending Seedream generation request"
        );

        let request = self
            .client
            .post(&url)
            .bearer_auth(credentials.api_key())
            .json(&self.build_request(payload));
        let body = send_for_body(request).await?;
        let artifacts = parse_images_response(&parse_json_body(&body)?)?;

        info!(
            model = %self.model,
            images = artifacts.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Seedream generation completed"
        );
        Ok(artifacts)
    }

    fn provider_name(&self) -> &str {
        "seedream"
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Extract images from `data[].b64_json`. A data-URL prefix is tolerated.
pub fn parse_images_response(response: &Value) -> Result<Vec<RawArtifact>, ProviderError> {
    if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let code = error.get("code").and_then(Value::as_str).unwrap_or_default();
        return Err(if code.contains("Sensitive") || code.contains("Policy") {
            ProviderError::ContentPolicyRejected(message)
        } else {
            ProviderError::InvalidRequest(message)
        });
    }

    let entries = response
        .get("data")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut artifacts = Vec::new();
    for entry in entries {
        let Some(encoded) = entry.get("b64_json").and_then(Value::as_str) else {
            continue;
        };
        let (mime_type, data) = split_data_url(encoded);
        let bytes = STANDARD.decode(data.trim()).map_err(|e| {
            ProviderError::Transient(format!("Undecodable image data in response: {}", e))
        })?;
        artifacts.push(RawArtifact::new(bytes, mime_type));
    }

    if artifacts.is_empty() {
        return Err(ProviderError::InvalidRequest(
            "No image data found in API response".to_string(),
        ));
    }
    Ok(artifacts)
}

fn split_data_url(value: &str) -> (Option<String>, &str) {
    match value.find("base64,") {
        Some(idx) => {
            let mime = value[..idx]
                .strip_prefix("data:")
                .map(|m| m.trim_end_matches(';').to_string())
                .filter(|m| !m.is_empty());
            (mime, &value[idx + "base64,".len()..])
        }
        None => (None, value),
    }
}
