//! Media descriptors and image format sniffing.

use crate::request::ResolutionTier;
use serde::{Deserialize, Serialize};

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];
const JPEG_SIGNATURE: [u8; 3] = [0xff, 0xd8, 0xff];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
    #[default]
    Unknown,
}

impl ImageFormat {
    /// Identify the format from magic bytes.
    pub fn sniff(bytes: &[u8]) -> ImageFormat {
        if bytes.starts_with(&PNG_SIGNATURE) {
            ImageFormat::Png
        } else if bytes.starts_with(&JPEG_SIGNATURE) {
            ImageFormat::Jpeg
        } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            ImageFormat::Webp
        } else {
            ImageFormat::Unknown
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Unknown => "application/octet-stream",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Webp => "webp",
            ImageFormat::Unknown => "bin",
        }
    }

    pub fn from_mime_type(mime: &str) -> ImageFormat {
        match mime.trim().to_ascii_lowercase().as_str() {
            "image/png" => ImageFormat::Png,
            "image/jpeg" | "image/jpg" => ImageFormat::Jpeg,
            "image/webp" => ImageFormat::Webp,
            _ => ImageFormat::Unknown,
        }
    }
}

/// Width and height from a PNG's IHDR chunk.
pub fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 24 || !bytes.starts_with(&PNG_SIGNATURE) || &bytes[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let height = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
    Some((width, height))
}

/// Describes the image stored behind an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub format: ImageFormat,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Tier the image was generated at, for generated artifacts.
    pub resolution: Option<ResolutionTier>,
}

impl MediaDescriptor {
    /// Descriptor derived purely from the bytes.
    pub fn sniffed(bytes: &[u8]) -> Self {
        Self::default().completed_from(bytes)
    }

    pub fn with_resolution(mut self, resolution: ResolutionTier) -> Self {
        self.resolution = Some(resolution);
        self
    }

    /// Fill fields the caller left empty from the bytes themselves.
    pub fn completed_from(mut self, bytes: &[u8]) -> Self {
        if self.format == ImageFormat::Unknown {
            self.format = ImageFormat::sniff(bytes);
        }
        if self.width.is_none() || self.height.is_none() {
            if let Some((w, h)) = png_dimensions(bytes) {
                self.width.get_or_insert(w);
                self.height.get_or_insert(h);
            }
        }
        self
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        Some((self.width?, self.height?))
    }
}

/// Minimal PNG header with the given dimensions. Enough for sniffing; not a
/// decodable image.
#[cfg(test)]
pub(crate) fn fake_png(width: u32, height: u32, tail: &[u8]) -> Vec<u8> {
    let mut bytes = PNG_SIGNATURE.to_vec();
    bytes.extend_from_slice(&13u32.to_be_bytes());
    bytes.extend_from_slice(b"IHDR");
    bytes.extend_from_slice(&width.to_be_bytes());
    bytes.extend_from_slice(&height.to_be_bytes());
    bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
    bytes.extend_from_slice(tail);
    bytes
}
