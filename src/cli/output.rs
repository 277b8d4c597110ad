//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::error::{ApiError, ProviderError, ValidationError};

/// Map domain errors to a single line for the terminal.
pub fn map_error(e: &ApiError) -> String {
    match e {
        ApiError::Validation(ValidationError::TooManyReferences { count, max }) => format!(
            "Too many reference images: {} given, at most {} allowed",
            count, max
        ),
        ApiError::Provider(ProviderError::AuthFailure(msg)) => format!(
            "Authentication failed: {} (check {})",
            msg,
            crate::provider::API_KEY_ENV
        ),
        other => other.to_string(),
    }
}
