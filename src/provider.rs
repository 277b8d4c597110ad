//! Image Provider Abstraction
//!
//! Uniform interface over hosted image-generation models. A provider receives a
//! fully composed [`GenerationPayload`] and returns raw image bytes, or a
//! [`ProviderError`] classified for the scheduler's retry policy.

use crate::artifact::{ImageFormat, MediaDescriptor};
use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub mod gemini;
pub mod payload;
pub mod poll;
pub mod scripted;
pub mod seedream;

pub use gemini::GeminiProvider;
pub use payload::{GenerationPayload, ImageRole, InputImage, PayloadImage};
pub use poll::PollConfig;
pub use scripted::{ScriptStep, ScriptedProvider};
pub use seedream::SeedreamProvider;

/// Environment variable holding the provider API key.
pub const API_KEY_ENV: &str = "ATELIER_API_KEY";

/// Provider credentials. The key never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredentials {
    api_key: String,
}

impl ApiCredentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }

    /// Read the key from `ATELIER_API_KEY`.
    pub fn from_env() -> Option<Self> {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(Self::new)
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn is_empty(&self) -> bool {
        self.api_key.trim().is_empty()
    }
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Image bytes as returned by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawArtifact {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

impl RawArtifact {
    pub fn new(bytes: Vec<u8>, mime_type: Option<String>) -> Self {
        Self { bytes, mime_type }
    }

    /// Descriptor from the bytes, falling back to the reported mime type.
    pub fn descriptor(&self) -> MediaDescriptor {
        let mut descriptor = MediaDescriptor::sniffed(&self.bytes);
        if descriptor.format == ImageFormat::Unknown {
            if let Some(mime) = &self.mime_type {
                descriptor.format = ImageFormat::from_mime_type(mime);
            }
        }
        descriptor
    }
}

/// Image generation provider trait
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Run one generation attempt. Polls internally when the provider completes
    /// asynchronously.
    async fn generate(
        &self,
        payload: &GenerationPayload,
        credentials: &ApiCredentials,
    ) -> Result<Vec<RawArtifact>, ProviderError>;

    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    #[default]
    Gemini,
    Seedream,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Gemini => "gemini",
            ProviderType::Seedream => "seedream",
        }
    }

    pub fn default_endpoint(&self) -> &'static str {
        match self {
            ProviderType::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            ProviderType::Seedream => "https://ark.cn-beijing.volces.com/api/v3",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderType::Gemini => "gemini-2.5-flash-image",
            ProviderType::Seedream => "doubao-seedream-4-0-250828",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub provider_type: ProviderType,

    /// Model identifier; the provider type's default when empty.
    #[serde(default)]
    pub model: String,

    /// Base URL override.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default)]
    pub poll: PollConfig,
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: ProviderType::default(),
            model: String::new(),
            endpoint: None,
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            poll: PollConfig::default(),
        }
    }
}

impl ProviderConfig {
    pub fn model_name(&self) -> &str {
        if self.model.trim().is_empty() {
            self.provider_type.default_model()
        } else {
            &self.model
        }
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint
            .as_deref()
            .unwrap_or_else(|| self.provider_type.default_endpoint())
            .trim_end_matches('/')
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(endpoint) = &self.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(format!("endpoint '{}' must be an http(s) URL", endpoint));
            }
        }
        if self.request_timeout_secs == 0 {
            return Err("request_timeout_secs must be greater than 0".to_string());
        }
        self.poll.validate()
    }
}

/// Construct the provider client for a configuration.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn ImageProvider>, ProviderError> {
    config.validate().map_err(ProviderError::InvalidRequest)?;
    let client = build_provider_http_client(config)?;
    let provider: Arc<dyn ImageProvider> = match config.provider_type {
        ProviderType::Gemini => Arc::new(GeminiProvider::new(
            client,
            config.model_name().to_string(),
            config.endpoint().to_string(),
            config.poll.clone(),
        )),
        ProviderType::Seedream => Arc::new(SeedreamProvider::new(
            client,
            config.model_name().to_string(),
            config.endpoint().to_string(),
        )),
    };
    debug!(
        provider = provider.provider_name(),
        model = provider.model_name(),
        "Created image provider"
    );
    Ok(provider)
}

pub(crate) fn build_provider_http_client(config: &ProviderConfig) -> Result<Client, ProviderError> {
    Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
        .map_err(|e| ProviderError::InvalidRequest(format!("Failed to create HTTP client: {}", e)))
}

/// Map a transport-level reqwest failure.
pub(crate) fn map_transport_error(error: reqwest::Error) -> ProviderError {
    if let Some(status) = error.status() {
        map_status(status, &HeaderMap::new(), &error.to_string())
    } else if error.is_timeout() {
        ProviderError::Transient(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        ProviderError::Transient(format!("Connection error: {}", error))
    } else if error.is_decode() {
        ProviderError::Transient(format!("Undecodable response body: {}", error))
    } else {
        ProviderError::Transient(format!("HTTP error: {}", error))
    }
}

/// Classify a non-success HTTP status.
pub(crate) fn map_status(status: StatusCode, headers: &HeaderMap, body: &str) -> ProviderError {
    let message = error_message_from_body(body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string()
    });
    let message = format!("HTTP {}: {}", status.as_u16(), message);

    match status.as_u16() {
        429 => ProviderError::RateLimited {
            message,
            retry_after: parse_retry_after(headers),
        },
        401 | 403 => ProviderError::AuthFailure(message),
        // Some providers report a bad key as a plain 400.
        400 if body.contains("API_KEY_INVALID") => ProviderError::AuthFailure(message),
        408 => ProviderError::Transient(message),
        400 | 404 | 413 | 422 => ProviderError::InvalidRequest(message),
        s if (500..600).contains(&s) => ProviderError::Transient(message),
        s if (400..500).contains(&s) => ProviderError::InvalidRequest(message),
        _ => ProviderError::Transient(message),
    }
}

/// Send a prepared request and return the response body on success.
pub(crate) async fn send_for_body(request: reqwest::RequestBuilder) -> Result<String, ProviderError> {
    let response = request.send().await.map_err(map_transport_error)?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await.map_err(map_transport_error)?;
    if !status.is_success() {
        return Err(map_status(status, &headers, &body));
    }
    Ok(body)
}

pub(crate) fn parse_json_body(body: &str) -> Result<serde_json::Value, ProviderError> {
    serde_json::from_str(body)
        .map_err(|e| ProviderError::Transient(format!("Undecodable response body: {}", e)))
}

/// `Retry-After` as delay seconds or an HTTP date.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<f64>() {
        if seconds.is_finite() && seconds >= 0.0 {
            return Some(Duration::from_secs_f64(seconds));
        }
        return None;
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Extract `error.message` from a JSON error body, or a short excerpt of text.
pub(crate) fn error_message_from_body(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        let message = value
            .pointer("/error/message")
            .or_else(|| value.get("message"))
            .and_then(|m| m.as_str());
        if let Some(message) = message {
            return Some(message.to_string());
        }
    }
    Some(trimmed.chars().take(200).collect())
}
