use std::collections::HashSet;

use imageproc::edges::canny;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::raster::{bgr_to_gray, gray_mean_std, BgrImage};
use crate::settings::Mode;

// ── Constants ─────────────────────────────────────────────────────────────

/// Pixels sampled for the unique-color estimate.
const SAMPLE_LIMIT: usize = 10_000;
/// Sampling seed — arbitrary, but fixed so a run is deterministic.
const SAMPLE_SEED: u64 = 42;
/// Canny hysteresis thresholds for the edge-density estimate.
const CANNY_LOW: f32 = 50.0;
const CANNY_HIGH: f32 = 150.0;

/// Classify an image into a concrete vectorization mode from its statistics.
///
/// Decision chain, first match wins; the residual case collapses to
/// `Photo` so no downstream stage ever sees `Auto`.
pub fn detect_mode(image: &BgrImage, single_channel: bool) -> Mode {
    if single_channel {
        return Mode::LineArt;
    }

    let gray = bgr_to_gray(image);
    let unique_colors = sampled_unique_colors(image);
    let edge_density = edge_density(&gray);
    let (_, std_dev) = gray_mean_std(&gray);

    if unique_colors < 64 && edge_density < 0.05 {
        return Mode::Logo;
    }
    if unique_colors < 16 {
        return Mode::PixelArt;
    }
    if std_dev < 30.0 {
        return Mode::LineArt;
    }
    // unique_colors > 1000 and the residual case both resolve to photo.
    Mode::Photo
}

/// Count distinct colors over a random sample of at most [`SAMPLE_LIMIT`]
/// pixels. Sampling is without replacement and seeded.
fn sampled_unique_colors(image: &BgrImage) -> usize {
    let total = image.width() as usize * image.height() as usize;
    let mut seen: HashSet<[u8; 3]> = HashSet::new();

    if total <= SAMPLE_LIMIT {
        for px in image.pixels() {
            seen.insert(px.0);
        }
    } else {
        let mut rng = StdRng::seed_from_u64(SAMPLE_SEED);
        let w = image.width();
        for idx in rand::seq::index::sample(&mut rng, total, SAMPLE_LIMIT) {
            let x = (idx as u32) % w;
            let y = (idx as u32) / w;
            seen.insert(image.get_pixel(x, y).0);
        }
    }
    seen.len()
}

/// Fraction of pixels the Canny operator marks as edges.
fn edge_density(gray: &image::GrayImage) -> f64 {
    let edges = canny(gray, CANNY_LOW, CANNY_HIGH);
    let edge_count = edges.pixels().filter(|p| p[0] > 0).count();
    edge_count as f64 / (gray.width() as f64 * gray.height() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn single_channel_is_line_art() {
        let img = BgrImage::from_pixel(8, 8, Rgb([10, 10, 10]));
        assert_eq!(detect_mode(&img, true), Mode::LineArt);
    }

    #[test]
    fn flat_image_is_logo() {
        // One color, zero edges.
        let img = BgrImage::from_pixel(32, 32, Rgb([0, 128, 255]));
        assert_eq!(detect_mode(&img, false), Mode::Logo);
    }

    #[test]
    fn busy_few_color_image_is_pixel_art() {
        // Two colors in 4-px cells: a dense edge grid fails the logo edge
        // bound while the color count stays tiny.
        let img = BgrImage::from_fn(32, 32, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        assert_eq!(detect_mode(&img, false), Mode::PixelArt);
    }

    #[test]
    fn low_variance_many_colors_is_line_art() {
        // 128 distinct colors whose luma barely moves.
        let img = BgrImage::from_fn(32, 32, |x, y| Rgb([((x * 32 + y) % 128 * 2) as u8, 100, 100]));
        assert_eq!(detect_mode(&img, false), Mode::LineArt);
    }

    #[test]
    fn wide_gradient_is_photo() {
        let img = BgrImage::from_fn(64, 64, |x, y| {
            Rgb([((x * 17 + y * 3) % 256) as u8, (y * 4) as u8, (x * 4) as u8])
        });
        assert_eq!(detect_mode(&img, false), Mode::Photo);
    }
}
