use image::{DynamicImage, ImageFormat, Luma, Rgb};

use crate::error::{Result, VectorizeError};
use crate::raster::{AlphaImage, BgrImage};

/// A decoded raster, already split into color and opacity planes.
#[derive(Debug)]
pub struct Decoded {
    /// Color planes in BGR order.
    pub bgr: BgrImage,
    /// Opacity plane, present only when the source carried alpha.
    pub alpha: Option<AlphaImage>,
    /// The source was single-channel (drives the mode detector).
    pub single_channel: bool,
}

/// Formats accepted by the native decode pass. Everything else (WebP,
/// animated GIF, …) goes through the fallback pass.
const NATIVE_FORMATS: &[ImageFormat] = &[
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::Bmp,
    ImageFormat::Tiff,
];

/// Decode raw image bytes into BGR(A) planes.
///
/// Tries the native formats first, then a fallback decode that also covers
/// WebP and takes the first frame of multi-frame containers. Fails with
/// [`VectorizeError::Decode`] when no pass accepts the bytes.
pub fn decode_image(bytes: &[u8]) -> Result<Decoded> {
    let native = image::guess_format(bytes)
        .ok()
        .filter(|f| NATIVE_FORMATS.contains(f))
        .and_then(|f| image::load_from_memory_with_format(bytes, f).ok());

    let dynamic = match native {
        Some(img) => img,
        // Fallback: let the full codec set have a go. `load_from_memory`
        // yields the first frame of animated containers.
        None => image::load_from_memory(bytes)
            .map_err(|e| VectorizeError::Decode(e.to_string()))?,
    };

    Ok(split_planes(dynamic))
}

/// Split a decoded image into BGR color planes plus an optional alpha plane.
fn split_planes(img: DynamicImage) -> Decoded {
    let color = img.color();
    let single_channel = matches!(
        color,
        image::ColorType::L8 | image::ColorType::L16 | image::ColorType::La8 | image::ColorType::La16
    );

    if color.has_alpha() {
        let rgba = img.to_rgba8();
        let (w, h) = rgba.dimensions();
        let mut bgr = BgrImage::new(w, h);
        let mut alpha = AlphaImage::new(w, h);
        for (src, (dst, a)) in rgba
            .pixels()
            .zip(bgr.pixels_mut().zip(alpha.pixels_mut()))
        {
            *dst = Rgb([src[2], src[1], src[0]]);
            *a = Luma([src[3]]);
        }
        Decoded {
            bgr,
            alpha: Some(alpha),
            single_channel,
        }
    } else {
        let rgb = img.to_rgb8();
        let (w, h) = rgb.dimensions();
        let mut bgr = BgrImage::new(w, h);
        for (src, dst) in rgb.pixels().zip(bgr.pixels_mut()) {
            *dst = Rgb([src[2], src[1], src[0]]);
        }
        Decoded {
            bgr,
            alpha: None,
            single_channel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::png::PngEncoder;
    use image::{ExtendedColorType, ImageEncoder, RgbImage, RgbaImage};

    fn png_bytes_rgb(img: &RgbImage) -> Vec<u8> {
        let mut out = Vec::new();
        PngEncoder::new(&mut out)
            .write_image(img.as_raw(), img.width(), img.height(), ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    #[test]
    fn decodes_png_and_swaps_to_bgr() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 0, 255]));
        let decoded = decode_image(&png_bytes_rgb(&img)).unwrap();
        assert!(decoded.alpha.is_none());
        assert!(!decoded.single_channel);
        assert_eq!(decoded.bgr.get_pixel(0, 0).0, [0, 0, 255]);
        assert_eq!(decoded.bgr.get_pixel(1, 0).0, [255, 0, 0]);
    }

    #[test]
    fn separates_alpha_plane() {
        let mut img = RgbaImage::new(1, 1);
        img.put_pixel(0, 0, image::Rgba([10, 20, 30, 128]));
        let mut out = Vec::new();
        PngEncoder::new(&mut out)
            .write_image(img.as_raw(), 1, 1, ExtendedColorType::Rgba8)
            .unwrap();
        let decoded = decode_image(&out).unwrap();
        assert_eq!(decoded.bgr.get_pixel(0, 0).0, [30, 20, 10]);
        assert_eq!(decoded.alpha.unwrap().get_pixel(0, 0).0, [128]);
    }

    #[test]
    fn flags_single_channel_sources() {
        let gray = image::GrayImage::from_pixel(3, 3, Luma([99]));
        let mut out = Vec::new();
        PngEncoder::new(&mut out)
            .write_image(gray.as_raw(), 3, 3, ExtendedColorType::L8)
            .unwrap();
        let decoded = decode_image(&out).unwrap();
        assert!(decoded.single_channel);
        assert_eq!(decoded.bgr.get_pixel(1, 1).0, [99, 99, 99]);
    }

    #[test]
    fn rejects_garbage() {
        let err = decode_image(b"definitely not an image").unwrap_err();
        assert!(matches!(err, VectorizeError::Decode(_)));
    }
}
