use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, VectorizeError>;

/// Fatal errors that cross the `vectorize` boundary.
///
/// Stage degradations (a preprocessor substage or an optimizer transform
/// failing) never surface here — the pipeline logs them at warning level
/// and continues with the unmodified artifact.
#[derive(Debug, Error)]
pub enum VectorizeError {
    /// No decoder accepted the input bytes.
    #[error("cannot decode image data: {0}")]
    Decode(String),

    /// The decoded image has zero pixels.
    #[error("image has no pixels")]
    EmptyInput,

    /// The palette could not be built from the input.
    #[error("quantization failed: {0}")]
    Quantization(String),
}
