//! Generation request value type, its options, and validation.

use crate::error::ValidationError;
use crate::types::ArtifactRef;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Maximum number of reference images per request.
pub const MAX_REFERENCES: usize = 10;

/// Maximum prompt length in characters.
pub const MAX_PROMPT_CHARS: usize = 8_000;

/// Aspect ratios offered to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "2:3")]
    R2x3,
    #[serde(rename = "3:2")]
    R3x2,
    #[serde(rename = "3:4")]
    R3x4,
    #[serde(rename = "4:3")]
    R4x3,
    #[serde(rename = "4:5")]
    R4x5,
    #[serde(rename = "5:4")]
    R5x4,
    #[serde(rename = "9:16")]
    R9x16,
    #[serde(rename = "16:9")]
    R16x9,
    #[serde(rename = "21:9")]
    R21x9,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 10] = [
        AspectRatio::Square,
        AspectRatio::R2x3,
        AspectRatio::R3x2,
        AspectRatio::R3x4,
        AspectRatio::R4x3,
        AspectRatio::R4x5,
        AspectRatio::R5x4,
        AspectRatio::R9x16,
        AspectRatio::R16x9,
        AspectRatio::R21x9,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::R2x3 => "2:3",
            AspectRatio::R3x2 => "3:2",
            AspectRatio::R3x4 => "3:4",
            AspectRatio::R4x3 => "4:3",
            AspectRatio::R4x5 => "4:5",
            AspectRatio::R5x4 => "5:4",
            AspectRatio::R9x16 => "9:16",
            AspectRatio::R16x9 => "16:9",
            AspectRatio::R21x9 => "21:9",
        }
    }

    /// (width, height) terms of the ratio.
    pub fn terms(&self) -> (u32, u32) {
        match self {
            AspectRatio::Square => (1, 1),
            AspectRatio::R2x3 => (2, 3),
            AspectRatio::R3x2 => (3, 2),
            AspectRatio::R3x4 => (3, 4),
            AspectRatio::R4x3 => (4, 3),
            AspectRatio::R4x5 => (4, 5),
            AspectRatio::R5x4 => (5, 4),
            AspectRatio::R9x16 => (9, 16),
            AspectRatio::R16x9 => (16, 9),
            AspectRatio::R21x9 => (21, 9),
        }
    }

    pub fn value(&self) -> f64 {
        let (w, h) = self.terms();
        w as f64 / h as f64
    }

    /// Supported ratio closest to `width / height`, compared on a log scale so
    /// that 2:1 and 1:2 are equally far from 1:1.
    pub fn nearest(width: u32, height: u32) -> AspectRatio {
        if width == 0 || height == 0 {
            return AspectRatio::Square;
        }
        let target = (width as f64 / height as f64).ln();
        let mut best = AspectRatio::Square;
        let mut best_distance = f64::MAX;
        for ratio in Self::ALL {
            let distance = (ratio.value().ln() - target).abs();
            if distance < best_distance {
                best = ratio;
                best_distance = distance;
            }
        }
        best
    }

    /// Pixel size at the given tier, long edge fixed by the tier.
    pub fn dimensions(&self, tier: ResolutionTier) -> (u32, u32) {
        let (w, h) = self.terms();
        let long = tier.long_edge();
        if w >= h {
            (long, (long as u64 * h as u64 / w as u64) as u32)
        } else {
            ((long as u64 * w as u64 / h as u64) as u32, long)
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|r| r.label() == trimmed)
            .ok_or_else(|| format!("unsupported aspect ratio '{}'", s))
    }
}

/// How the output dimensions are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "ratio", rename_all = "snake_case")]
pub enum DimensionPolicy {
    /// Follow the primary image's ratio.
    Adaptive,
    Fixed(AspectRatio),
}

impl Default for DimensionPolicy {
    fn default() -> Self {
        DimensionPolicy::Adaptive
    }
}

impl FromStr for DimensionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "adaptive" => Ok(DimensionPolicy::Adaptive),
            other => other.parse().map(DimensionPolicy::Fixed),
        }
    }
}

/// Output resolution tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResolutionTier {
    #[serde(rename = "1K")]
    #[default]
    OneK,
    #[serde(rename = "2K")]
    TwoK,
    #[serde(rename = "4K")]
    FourK,
}

impl ResolutionTier {
    pub fn label(&self) -> &'static str {
        match self {
            ResolutionTier::OneK => "1K",
            ResolutionTier::TwoK => "2K",
            ResolutionTier::FourK => "4K",
        }
    }

    pub fn long_edge(&self) -> u32 {
        match self {
            ResolutionTier::OneK => 1024,
            ResolutionTier::TwoK => 2048,
            ResolutionTier::FourK => 4096,
        }
    }
}

impl fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ResolutionTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "1K" | "1024" => Ok(ResolutionTier::OneK),
            "2K" | "2048" => Ok(ResolutionTier::TwoK),
            "4K" | "4096" => Ok(ResolutionTier::FourK),
            _ => Err(format!("unsupported resolution tier '{}'", s)),
        }
    }
}

/// A user-issued generation request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Absent for text-to-image.
    pub primary: Option<ArtifactRef>,
    /// Reference images in submitted order.
    pub references: Vec<ArtifactRef>,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub dimension: DimensionPolicy,
    pub resolution: ResolutionTier,
    /// Tag the primary as the original render and the rest as references.
    pub optimize_prompt: bool,
}

impl GenerationRequest {
    pub fn builder() -> GenerationRequestBuilder {
        GenerationRequestBuilder::default()
    }

    /// All input images in payload order: primary first, then references.
    pub fn input_images(&self) -> impl Iterator<Item = &ArtifactRef> {
        self.primary.iter().chain(self.references.iter())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.references.len() > MAX_REFERENCES {
            return Err(ValidationError::TooManyReferences {
                count: self.references.len(),
                max: MAX_REFERENCES,
            });
        }

        if self.primary.is_none() && self.prompt.trim().is_empty() {
            return Err(ValidationError::MissingPrompt);
        }

        let len = self.prompt.chars().count();
        if len > MAX_PROMPT_CHARS {
            return Err(ValidationError::PromptTooLong {
                len,
                max: MAX_PROMPT_CHARS,
            });
        }

        let mut seen = HashSet::new();
        for image in self.input_images() {
            if !seen.insert(*image) {
                return Err(ValidationError::DuplicateReference(*image));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct GenerationRequestBuilder {
    primary: Option<ArtifactRef>,
    references: Vec<ArtifactRef>,
    prompt: String,
    negative_prompt: Option<String>,
    dimension: DimensionPolicy,
    resolution: ResolutionTier,
    optimize_prompt: bool,
}

impl GenerationRequestBuilder {
    pub fn primary(mut self, image: ArtifactRef) -> Self {
        self.primary = Some(image);
        self
    }

    pub fn reference(mut self, image: ArtifactRef) -> Self {
        self.references.push(image);
        self
    }

    pub fn references(mut self, images: impl IntoIterator<Item = ArtifactRef>) -> Self {
        self.references.extend(images);
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn negative_prompt(mut self, negative: impl Into<String>) -> Self {
        let negative = negative.into();
        self.negative_prompt = if negative.trim().is_empty() {
            None
        } else {
            Some(negative)
        };
        self
    }

    pub fn dimension(mut self, dimension: DimensionPolicy) -> Self {
        self.dimension = dimension;
        self
    }

    pub fn aspect(self, ratio: AspectRatio) -> Self {
        self.dimension(DimensionPolicy::Fixed(ratio))
    }

    pub fn resolution(mut self, resolution: ResolutionTier) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn optimize_prompt(mut self, enabled: bool) -> Self {
        self.optimize_prompt = enabled;
        self
    }

    /// Build without validating; `Orchestrator::submit` validates.
    pub fn build(self) -> GenerationRequest {
        GenerationRequest {
            primary: self.primary,
            references: self.references,
            prompt: self.prompt,
            negative_prompt: self.negative_prompt,
            dimension: self.dimension,
            resolution: self.resolution,
            optimize_prompt: self.optimize_prompt,
        }
    }
}
