//! Artifact Store
//!
//! Content-addressed durable cache for generated and imported images. Artifacts
//! are named by the BLAKE3 hash of their bytes, so identical bytes always land in
//! the same file and are never written twice.

pub mod media;
pub mod store;

pub use media::{ImageFormat, MediaDescriptor};
pub use store::{ArtifactRecord, ArtifactStore};
