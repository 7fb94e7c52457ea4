//! Raster-to-SVG vectorization engine.
//!
//! Takes raw image bytes through a deterministic pipeline — decode, mode
//! detection, adaptive preprocessing, color quantization, contour tracing,
//! SVG assembly and optimization — and returns a compact SVG document whose
//! filled paths approximate the input's color regions, together with the
//! quantized raster, the palette, and the per-color masks.
//!
//! ```no_run
//! use rastervec::{vectorize, Settings};
//!
//! let bytes = std::fs::read("logo.png").unwrap();
//! let result = vectorize(&bytes, &Settings::default()).unwrap();
//! std::fs::write("logo.svg", result.svg).unwrap();
//! ```

pub mod decode;
pub mod detect;
pub mod engine;
pub mod error;
pub mod optimize;
pub mod preprocess;
pub mod quantize;
pub mod raster;
pub mod settings;
pub mod trace;

pub use engine::{vectorize, vectorize_with_progress, VectorizeResult};
pub use error::{Result, VectorizeError};
pub use settings::{Detail, Mode, QuantizeMethod, Settings};
