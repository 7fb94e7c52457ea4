use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, Rgb, RgbImage};

use rastervec::{vectorize, Detail, Mode, Settings, VectorizeError};

fn png_bytes(img: &RgbImage) -> Vec<u8> {
    let mut out = Vec::new();
    PngEncoder::new(&mut out)
        .write_image(img.as_raw(), img.width(), img.height(), ExtendedColorType::Rgb8)
        .unwrap();
    out
}

/// The `d` attribute of the first `<path>` carrying the given fill.
fn path_data_for<'a>(svg: &'a str, fill: &str) -> Option<&'a str> {
    let needle = format!("fill=\"{fill}\"");
    let start = svg.find(&needle)?;
    let rest = &svg[start..];
    let end = rest.find("/>")?;
    Some(&rest[..end])
}

#[test]
fn solid_color_image_yields_one_full_path() {
    let bytes = png_bytes(&RgbImage::from_pixel(10, 10, Rgb([255, 0, 0])));
    // Upscaling would report a 40×40 viewBox and CLAHE remaps flat
    // luminance, so both are pinned off to observe the source verbatim.
    let settings = Settings {
        upscale: false,
        clahe: false,
        ..Settings::default()
    };
    let result = vectorize(&bytes, &settings).unwrap();

    assert!(result.svg.contains("fill=\"#ff0000\""));
    assert_eq!(result.svg.matches("<path").count(), 1);
    assert!(result.svg.contains("viewBox=\"0 0 10 10\""));
    assert_eq!(result.palette, vec!["#ff0000"]);
    assert_eq!(result.masks.len(), 1);
}

#[test]
fn two_tone_halves_split_into_two_even_layers() {
    let img = RgbImage::from_fn(32, 32, |x, _| {
        if x < 16 {
            Rgb([0, 0, 0])
        } else {
            Rgb([255, 255, 255])
        }
    });
    // Resampling filters would smear the hard edge into intermediate
    // grays; with the preprocessor off the palette recovery is exact.
    let settings = Settings {
        n_colors: 2,
        detail: Detail::Medium,
        upscale: false,
        denoise: false,
        bilateral: false,
        clahe: false,
        sharpen: false,
        ..Settings::default()
    };
    let result = vectorize(&png_bytes(&img), &settings).unwrap();

    let mut palette = result.palette.clone();
    palette.sort();
    assert_eq!(palette, vec!["#000000", "#ffffff"]);
    assert_eq!(result.svg.matches("<path").count(), 2);

    // Each mask covers exactly half of the raster.
    let half = (result.width * result.height / 2) as usize;
    for mask in &result.masks {
        let lit = mask.pixels().filter(|p| p[0] == 255).count();
        assert_eq!(lit, half);
    }
}

#[test]
fn repeated_runs_are_byte_identical() {
    let img = RgbImage::from_fn(16, 16, |x, _| {
        if x < 8 {
            Rgb([0, 0, 0])
        } else {
            Rgb([255, 255, 255])
        }
    });
    let bytes = png_bytes(&img);
    let a = vectorize(&bytes, &Settings::default()).unwrap();
    let b = vectorize(&bytes, &Settings::default()).unwrap();
    assert_eq!(a.svg, b.svg);
    assert_eq!(a.palette, b.palette);
}

#[test]
fn annulus_path_contains_outer_and_hole_subpaths() {
    // Green ring (inner r=10 clear, outer r=28) on white.
    let img = RgbImage::from_fn(64, 64, |x, y| {
        let dx = x as f64 - 32.0;
        let dy = y as f64 - 32.0;
        let d2 = dx * dx + dy * dy;
        if d2 <= 28.0 * 28.0 && d2 >= 10.0 * 10.0 {
            Rgb([0, 255, 0])
        } else {
            Rgb([255, 255, 255])
        }
    });
    // Preprocessor off: the two source colors survive quantization intact.
    let settings = Settings {
        detail: Detail::High,
        upscale: false,
        denoise: false,
        bilateral: false,
        clahe: false,
        sharpen: false,
        ..Settings::default()
    };
    let result = vectorize(&png_bytes(&img), &settings).unwrap();

    let green = path_data_for(&result.svg, "#00ff00").expect("green path present");
    assert!(
        green.matches('M').count() >= 2,
        "expected outer + hole subpaths in {green}"
    );
}

#[test]
fn checkerboard_keeps_both_layers() {
    let img = RgbImage::from_fn(8, 8, |x, y| {
        if (x + y) % 2 == 0 {
            Rgb([0, 0, 0])
        } else {
            Rgb([255, 255, 255])
        }
    });
    // Pixel-art mode: the nearest-neighbor upscale keeps every cell a
    // crisp 4×4 block above the min-area threshold.
    let settings = Settings {
        mode: Mode::PixelArt,
        ..Settings::default()
    };
    let result = vectorize(&png_bytes(&img), &settings).unwrap();

    assert_eq!(result.palette.len(), 2);
    for mask in &result.masks {
        assert!(mask.pixels().any(|p| p[0] == 255));
    }
    for fill in ["#000000", "#ffffff"] {
        let d = path_data_for(&result.svg, fill).expect("layer path present");
        assert!(d.contains("d=\""));
    }
}

#[test]
fn pixel_art_mode_preserves_colors_exactly() {
    // 4×4, three distinct colors.
    let colors = [[0u8, 0, 0], [255, 0, 0], [255, 255, 255]];
    let img = RgbImage::from_fn(4, 4, |x, y| Rgb(colors[((x + y * 4) % 3) as usize]));
    let settings = Settings {
        mode: Mode::PixelArt,
        ..Settings::default()
    };
    let result = vectorize(&png_bytes(&img), &settings).unwrap();

    assert_eq!(result.palette.len(), 3);
    assert_eq!((result.width, result.height), (16, 16));
    // No denoising in pixel-art mode: the quantized raster is exactly the
    // nearest-neighbor upscale of the input.
    for (x, y, px) in result.quantized.enumerate_pixels() {
        let src = img.get_pixel(x / 4, y / 4);
        // Quantized output is BGR.
        assert_eq!(px.0, [src[2], src[1], src[0]], "at ({x},{y})");
    }
}

#[test]
fn minified_output_has_no_stray_whitespace() {
    let bytes = png_bytes(&RgbImage::from_pixel(6, 6, Rgb([12, 34, 56])));
    let result = vectorize(&bytes, &Settings::default()).unwrap();
    assert!(!result.svg.contains('\n'));
    assert!(!result.svg.contains("< "));
    assert!(!result.svg.contains(" >"));
    assert!(!result.svg.contains(" = "));
    assert!(result.svg.starts_with("<?xml"));
}

#[test]
fn masks_partition_the_raster() {
    let img = RgbImage::from_fn(16, 16, |x, y| {
        if x < 8 && y < 8 {
            Rgb([200, 30, 30])
        } else if x >= 8 && y >= 8 {
            Rgb([30, 30, 200])
        } else {
            Rgb([240, 240, 240])
        }
    });
    let result = vectorize(&png_bytes(&img), &Settings::default()).unwrap();
    for y in 0..result.height {
        for x in 0..result.width {
            let lit = result
                .masks
                .iter()
                .filter(|m| m.get_pixel(x, y)[0] == 255)
                .count();
            assert_eq!(lit, 1, "pixel ({x},{y}) lit in {lit} masks");
        }
    }
}

#[test]
fn single_pixel_image_still_produces_a_path() {
    let bytes = png_bytes(&RgbImage::from_pixel(1, 1, Rgb([40, 80, 120])));
    let result = vectorize(&bytes, &Settings::default()).unwrap();
    // Upscaled 4×: the lone pixel becomes a traceable block.
    assert_eq!((result.width, result.height), (4, 4));
    assert!(result.svg.contains("viewBox=\"0 0 4 4\""));
    assert_eq!(result.svg.matches("<path").count(), 1);
}

#[test]
fn undecodable_input_surfaces_a_decode_error() {
    let err = vectorize(b"not an image at all", &Settings::default()).unwrap_err();
    assert!(matches!(err, VectorizeError::Decode(_)));
}
