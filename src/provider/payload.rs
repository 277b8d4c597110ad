//! Provider-neutral payload composition.
//!
//! Images are ordered primary first, then references in submitted order, and
//! the prompt text comes last. With prompt optimization enabled every image
//! carries a role tag and the prompt starts with a legend explaining the roles.

use crate::artifact::{ImageFormat, MediaDescriptor};
use crate::error::ProviderError;
use crate::request::{AspectRatio, DimensionPolicy, GenerationRequest, ResolutionTier};
use crate::types::ArtifactRef;

/// Upper bound on the summed size of all input images.
pub const MAX_TOTAL_IMAGE_BYTES: usize = 20 * 1024 * 1024;

const LEGEND_WITH_ORIGINAL: &str =
    "The first image is the original render, the others are references.";
const LEGEND_REFERENCES_ONLY: &str = "All images are references.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRole {
    Original,
    Reference,
}

impl ImageRole {
    pub fn tag(&self) -> &'static str {
        match self {
            ImageRole::Original => "original/render",
            ImageRole::Reference => "reference",
        }
    }
}

/// An input image loaded from the artifact store.
#[derive(Debug, Clone)]
pub struct InputImage {
    pub artifact: ArtifactRef,
    pub bytes: Vec<u8>,
    pub descriptor: MediaDescriptor,
}

#[derive(Debug, Clone)]
pub struct PayloadImage {
    pub artifact: ArtifactRef,
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    pub role: ImageRole,
}

impl PayloadImage {
    /// Mime type sent upstream; unknown formats are declared as PNG.
    pub fn mime_type(&self) -> &'static str {
        match self.format {
            ImageFormat::Unknown => ImageFormat::Png.mime_type(),
            other => other.mime_type(),
        }
    }
}

/// Everything a provider needs for one attempt.
#[derive(Debug, Clone)]
pub struct GenerationPayload {
    pub images: Vec<PayloadImage>,
    pub prompt: String,
    pub aspect: AspectRatio,
    pub resolution: ResolutionTier,
    /// Whether images carry role tags.
    pub tagged: bool,
}

impl GenerationPayload {
    /// Compose a payload from a request and its loaded input images.
    ///
    /// `inputs` must be in `request.input_images()` order.
    pub fn compose(
        request: &GenerationRequest,
        inputs: Vec<InputImage>,
    ) -> Result<Self, ProviderError> {
        let expected: Vec<ArtifactRef> = request.input_images().copied().collect();
        let actual: Vec<ArtifactRef> = inputs.iter().map(|i| i.artifact).collect();
        if expected != actual {
            return Err(ProviderError::InvalidRequest(
                "input images do not match the request".to_string(),
            ));
        }

        let total: usize = inputs.iter().map(|i| i.bytes.len()).sum();
        if total > MAX_TOTAL_IMAGE_BYTES {
            return Err(ProviderError::InvalidRequest(format!(
                "Total image size {} bytes exceeds the limit of 20MB",
                total
            )));
        }

        let aspect = match request.dimension {
            DimensionPolicy::Fixed(ratio) => ratio,
            DimensionPolicy::Adaptive => request
                .primary
                .and_then(|_| inputs.first())
                .and_then(|primary| primary.descriptor.dimensions())
                .map(|(w, h)| AspectRatio::nearest(w, h))
                .unwrap_or(AspectRatio::Square),
        };

        let has_primary = request.primary.is_some();
        let images: Vec<PayloadImage> = inputs
            .into_iter()
            .enumerate()
            .map(|(index, input)| PayloadImage {
                artifact: input.artifact,
                format: match input.descriptor.format {
                    ImageFormat::Unknown => ImageFormat::sniff(&input.bytes),
                    known => known,
                },
                bytes: input.bytes,
                role: if index == 0 && has_primary {
                    ImageRole::Original
                } else {
                    ImageRole::Reference
                },
            })
            .collect();

        let prompt = compose_prompt(request, has_primary, !images.is_empty());

        Ok(Self {
            images,
            prompt,
            aspect,
            resolution: request.resolution,
            tagged: request.optimize_prompt,
        })
    }

    pub fn total_image_bytes(&self) -> usize {
        self.images.iter().map(|i| i.bytes.len()).sum()
    }

    /// Target output size in pixels.
    pub fn output_dimensions(&self) -> (u32, u32) {
        self.aspect.dimensions(self.resolution)
    }

    /// Role tag for an image, when tagging is enabled.
    pub fn tag_for(&self, image: &PayloadImage) -> Option<&'static str> {
        self.tagged.then(|| image.role.tag())
    }
}

fn compose_prompt(request: &GenerationRequest, has_primary: bool, has_images: bool) -> String {
    let mut sections: Vec<String> = Vec::new();

    if request.optimize_prompt && has_images {
        let legend = if has_primary {
            LEGEND_WITH_ORIGINAL
        } else {
            LEGEND_REFERENCES_ONLY
        };
        sections.push(legend.to_string());
    }

    let prompt = request.prompt.trim();
    if !prompt.is_empty() {
        sections.push(prompt.to_string());
    }

    if let Some(negative) = request.negative_prompt.as_deref().map(str::trim) {
        if !negative.is_empty() {
            sections.push(format!("Avoid: {}", negative));
        }
    }

    sections.join("\n\n")
}
