use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};

use image::{GrayImage, Luma};
use tracing::{debug, warn};

use crate::decode::decode_image;
use crate::detect::detect_mode;
use crate::error::{Result, VectorizeError};
use crate::optimize::optimize_svg;
use crate::preprocess::preprocess;
use crate::quantize::quantize;
use crate::raster::{bgr_to_hex, BgrImage};
use crate::settings::{Mode, Settings};
use crate::trace::{assemble_svg, trace_layer};

/// Everything a vectorization run hands back to the caller. Dimensions are
/// the post-preprocessing (possibly upscaled) ones the SVG viewBox uses.
#[derive(Debug)]
pub struct VectorizeResult {
    pub svg: String,
    pub quantized: BgrImage,
    pub palette: Vec<String>,
    pub masks: Vec<GrayImage>,
    pub width: u32,
    pub height: u32,
}

/// Vectorize raw image bytes with the given settings.
pub fn vectorize(image_bytes: &[u8], settings: &Settings) -> Result<VectorizeResult> {
    vectorize_with_progress(image_bytes, settings, |_, _| {})
}

/// Like [`vectorize`], reporting progress as `(percent, stage)` at fixed
/// stage boundaries. The callback is advisory: a panic inside it is
/// swallowed and never affects the pipeline.
pub fn vectorize_with_progress<F>(
    image_bytes: &[u8],
    settings: &Settings,
    mut progress: F,
) -> Result<VectorizeResult>
where
    F: FnMut(u8, &str),
{
    let mut report = |pct: u8, stage: &str| {
        let _ = catch_unwind(AssertUnwindSafe(|| progress(pct, stage)));
    };

    report(0, "loading");

    let decoded = decode_image(image_bytes)?;
    if decoded.bgr.width() == 0 || decoded.bgr.height() == 0 {
        return Err(VectorizeError::EmptyInput);
    }

    let mode = if settings.mode == Mode::Auto {
        let detected = detect_mode(&decoded.bgr, decoded.single_channel);
        debug!("auto-detected mode: {detected}");
        detected
    } else {
        settings.mode
    };

    report(10, "preprocessing");

    let (image, alpha) = preprocess(decoded.bgr, decoded.alpha, mode, settings);
    let (width, height) = image.dimensions();

    report(30, "quantizing");

    // Single-color fast path: skip quantization entirely.
    let unique: HashSet<[u8; 3]> = image.pixels().map(|p| p.0).collect();
    if unique.len() == 1 {
        let color = bgr_to_hex(*unique.iter().next().expect("one unique color"));
        let full_mask = GrayImage::from_pixel(width, height, Luma([255]));
        return Ok(finish_layers(
            image,
            vec![color],
            vec![full_mask],
            width,
            height,
            settings,
            &mut report,
        ));
    }

    let quantized = quantize(&image, alpha.as_ref(), settings.n_colors, settings.quantize_method)?;

    Ok(finish_layers(
        quantized.image,
        quantized.palette,
        quantized.masks,
        width,
        height,
        settings,
        &mut report,
    ))
}

/// Trace, assemble, and optimize a set of (color, mask) layers.
fn finish_layers(
    quantized: BgrImage,
    palette: Vec<String>,
    masks: Vec<GrayImage>,
    width: u32,
    height: u32,
    settings: &Settings,
    report: &mut impl FnMut(u8, &str),
) -> VectorizeResult {
    report(55, "tracing");

    let mut layers: Vec<(String, String)> = Vec::with_capacity(palette.len());
    for (i, (color, mask)) in palette.iter().zip(masks.iter()).enumerate() {
        // A misbehaving layer is skipped; the rest of the document stands.
        let traced = catch_unwind(AssertUnwindSafe(|| trace_layer(mask, color, settings)));
        match traced {
            Ok(Some(path_el)) => layers.push((color.clone(), path_el)),
            Ok(None) => {}
            Err(_) => warn!("tracing layer {i} failed, skipping"),
        }
    }

    report(80, "assembling");
    let svg_raw = assemble_svg(&layers, width, height, &settings.background);

    report(90, "optimizing");
    let svg = if settings.optimize {
        optimize_svg(&svg_raw, settings)
    } else {
        svg_raw
    };

    report(100, "done");

    VectorizeResult {
        svg,
        quantized,
        palette,
        masks,
        width,
        height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::png::PngEncoder;
    use image::{ExtendedColorType, ImageEncoder, Rgb, RgbImage};

    fn png_bytes(img: &RgbImage) -> Vec<u8> {
        let mut out = Vec::new();
        PngEncoder::new(&mut out)
            .write_image(img.as_raw(), img.width(), img.height(), ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    #[test]
    fn solid_image_takes_the_fast_path() {
        // RGB red on the wire becomes BGR internally and #ff0000 back out.
        let bytes = png_bytes(&RgbImage::from_pixel(10, 10, Rgb([255, 0, 0])));
        // CLAHE remaps luminance even on flat images, so pin it off to
        // assert the exact source color.
        let settings = Settings {
            upscale: false,
            clahe: false,
            ..Settings::default()
        };
        let result = vectorize(&bytes, &settings).unwrap();
        assert_eq!(result.palette, vec!["#ff0000"]);
        assert_eq!(result.masks.len(), 1);
        assert_eq!((result.width, result.height), (10, 10));
        assert!(result.svg.contains(r##"fill="#ff0000""##));
        assert_eq!(result.svg.matches("<path").count(), 1);
    }

    #[test]
    fn progress_hits_every_stage_boundary() {
        let bytes = png_bytes(&RgbImage::from_pixel(6, 6, Rgb([0, 128, 255])));
        let mut seen: Vec<(u8, String)> = Vec::new();
        vectorize_with_progress(&bytes, &Settings::default(), |pct, stage| {
            seen.push((pct, stage.to_string()));
        })
        .unwrap();
        let expected = [
            (0, "loading"),
            (10, "preprocessing"),
            (30, "quantizing"),
            (55, "tracing"),
            (80, "assembling"),
            (90, "optimizing"),
            (100, "done"),
        ];
        assert_eq!(seen.len(), expected.len());
        for ((pct, stage), (want_pct, want_stage)) in seen.iter().zip(expected.iter()) {
            assert_eq!((pct, stage.as_str()), (want_pct, *want_stage));
        }
    }

    #[test]
    fn panicking_progress_callback_is_swallowed() {
        let bytes = png_bytes(&RgbImage::from_pixel(4, 4, Rgb([1, 2, 3])));
        let result = vectorize_with_progress(&bytes, &Settings::default(), |_, _| {
            panic!("observer bug")
        });
        assert!(result.is_ok());
    }

    #[test]
    fn undecodable_bytes_error_out() {
        let err = vectorize(b"nope", &Settings::default()).unwrap_err();
        assert!(matches!(err, VectorizeError::Decode(_)));
    }
}
