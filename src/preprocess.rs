use anyhow::ensure;
use image::imageops::FilterType;
use image::{GrayImage, Luma, Rgb};
use imageproc::filter::{gaussian_blur_f32, laplacian_filter};
use rayon::prelude::*;
use tracing::warn;

use crate::raster::{bgr_to_gray, bgr_to_lab8, lab8_to_bgr, AlphaImage, BgrImage};
use crate::settings::{Mode, Settings};

// ── Constants ─────────────────────────────────────────────────────────────

/// Non-local-means patch diameter.
const NLM_TEMPLATE_WINDOW: u32 = 7;
/// Non-local-means search diameter.
const NLM_SEARCH_WINDOW: u32 = 21;
/// CLAHE grid: the image is split into GRID×GRID tiles.
const CLAHE_GRID: u32 = 8;
/// Gaussian sigma for the unsharp-mask blur.
const SHARPEN_SIGMA: f32 = 1.0;
/// Laplacian variance above which a photo counts as heavily noisy.
const HEAVY_NOISE_VARIANCE: f64 = 500.0;
/// Unique-gray ratio below which a photo counts as low-contrast.
const LOW_CONTRAST_RATIO: f64 = 0.3;

// ── Adaptive parameters ───────────────────────────────────────────────────

/// Per-invocation stage parameters derived from mode and image statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageParams {
    pub scale: u32,
    /// Nearest-neighbor upscaling (pixel art) instead of Lanczos.
    pub nearest: bool,
    pub denoise: bool,
    pub bilateral: bool,
    pub clahe: bool,
    pub sharpen: bool,
    /// Non-local-means filtering strength.
    pub h_lum: f32,
    pub bilateral_d: u32,
    pub bilateral_sigma_color: f64,
    pub bilateral_sigma_space: f64,
    pub clahe_clip: f32,
    pub sharpen_amount: f32,
}

/// Upscale factor from the longest side.
fn upscale_factor(longest: u32) -> u32 {
    if longest < 200 {
        4
    } else if longest < 500 {
        3
    } else if longest < 1000 {
        2
    } else {
        1
    }
}

/// Derive adaptive stage parameters from the image and the chosen mode.
pub fn analyse(image: &BgrImage, mode: Mode) -> StageParams {
    let longest = image.width().max(image.height());
    let scale = upscale_factor(longest);

    match mode {
        // Pixel art: hard nearest-neighbor upscale, nothing else.
        Mode::PixelArt => StageParams {
            scale,
            nearest: true,
            denoise: false,
            bilateral: false,
            clahe: false,
            sharpen: false,
            h_lum: 5.0,
            bilateral_d: 5,
            bilateral_sigma_color: 50.0,
            bilateral_sigma_space: 50.0,
            clahe_clip: 2.0,
            sharpen_amount: 0.5,
        },
        Mode::LineArt => StageParams {
            scale,
            nearest: false,
            denoise: true,
            bilateral: false,
            clahe: true,
            sharpen: true,
            h_lum: 4.0,
            bilateral_d: 7,
            bilateral_sigma_color: 75.0,
            bilateral_sigma_space: 75.0,
            clahe_clip: 3.0,
            sharpen_amount: 1.5,
        },
        Mode::Logo => StageParams {
            scale,
            nearest: false,
            denoise: true,
            bilateral: true,
            clahe: true,
            sharpen: true,
            h_lum: 5.0,
            bilateral_d: 9,
            bilateral_sigma_color: 75.0,
            bilateral_sigma_space: 75.0,
            clahe_clip: 2.0,
            sharpen_amount: 0.8,
        },
        // Photo (and anything unresolved): adapt to measured noise/contrast.
        Mode::Photo | Mode::Auto => {
            let gray = bgr_to_gray(image);
            let heavy_noise = laplacian_variance(&gray) > HEAVY_NOISE_VARIANCE;
            let low_contrast = unique_gray_ratio(&gray) < LOW_CONTRAST_RATIO;
            let is_photo = mode == Mode::Photo;

            let (h_lum, bilateral_sigma) = if heavy_noise { (10.0, 100.0) } else { (6.0, 75.0) };

            StageParams {
                scale,
                nearest: false,
                denoise: heavy_noise || is_photo,
                bilateral: true,
                clahe: low_contrast || is_photo,
                sharpen: true,
                h_lum,
                bilateral_d: 9,
                bilateral_sigma_color: bilateral_sigma,
                bilateral_sigma_space: bilateral_sigma,
                clahe_clip: 2.0,
                sharpen_amount: 1.0,
            }
        }
    }
}

/// Variance of the Laplacian response — low means blurry, high means
/// noisy or highly detailed.
fn laplacian_variance(gray: &GrayImage) -> f64 {
    let lap = laplacian_filter(gray);
    let n = (lap.width() as u64 * lap.height() as u64).max(1) as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for p in lap.pixels() {
        let v = p[0] as f64;
        sum += v;
        sum_sq += v * v;
    }
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

/// Fraction of the 256 gray levels that actually occur.
fn unique_gray_ratio(gray: &GrayImage) -> f64 {
    let mut seen = [false; 256];
    for p in gray.pixels() {
        seen[p[0] as usize] = true;
    }
    seen.iter().filter(|&&s| s).count() as f64 / 256.0
}

// ── Orchestration ─────────────────────────────────────────────────────────

/// Run the preprocessing chain: upscale → denoise → bilateral → CLAHE →
/// unsharp mask, each stage gated by both the settings toggle and the
/// adaptive parameters.
///
/// A failing stage is skipped: the error is logged at warning level and
/// the chain continues with the unmodified intermediate. The alpha plane
/// is never color-mutated — it is only resized to the output dimensions.
pub fn preprocess(
    image: BgrImage,
    alpha: Option<AlphaImage>,
    mode: Mode,
    settings: &Settings,
) -> (BgrImage, Option<AlphaImage>) {
    let params = analyse(&image, mode);

    let image = apply_stage("upscale", image, settings.upscale, |img| {
        upscale(img, &params)
    });
    let image = apply_stage("denoise", image, settings.denoise && params.denoise, |img| {
        nl_means(img, params.h_lum)
    });
    let image = apply_stage(
        "bilateral",
        image,
        settings.bilateral && params.bilateral,
        |img| {
            bilateral(
                img,
                params.bilateral_d,
                params.bilateral_sigma_color,
                params.bilateral_sigma_space,
            )
        },
    );
    let image = apply_stage("clahe", image, settings.clahe && params.clahe, |img| {
        clahe_lab(img, params.clahe_clip)
    });
    let image = apply_stage("sharpen", image, settings.sharpen && params.sharpen, |img| {
        unsharp_mask(img, params.sharpen_amount)
    });

    let alpha = alpha.map(|a| {
        if a.dimensions() == image.dimensions() {
            a
        } else {
            image::imageops::resize(&a, image.width(), image.height(), FilterType::Lanczos3)
        }
    });

    (image, alpha)
}

/// Degrade-to-identity wrapper: a stage that errors is skipped and the
/// previous intermediate flows on.
fn apply_stage(
    name: &str,
    image: BgrImage,
    enabled: bool,
    stage: impl FnOnce(&BgrImage) -> anyhow::Result<BgrImage>,
) -> BgrImage {
    if !enabled {
        return image;
    }
    match stage(&image) {
        Ok(out) => out,
        Err(err) => {
            warn!("preprocess stage '{name}' failed ({err}), keeping input");
            image
        }
    }
}

// ── Stages ────────────────────────────────────────────────────────────────

fn upscale(image: &BgrImage, params: &StageParams) -> anyhow::Result<BgrImage> {
    if params.scale <= 1 {
        return Ok(image.clone());
    }
    let w = image
        .width()
        .checked_mul(params.scale)
        .ok_or_else(|| anyhow::anyhow!("upscaled width overflows"))?;
    let h = image
        .height()
        .checked_mul(params.scale)
        .ok_or_else(|| anyhow::anyhow!("upscaled height overflows"))?;
    let filter = if params.nearest {
        FilterType::Nearest
    } else {
        FilterType::Lanczos3
    };
    Ok(image::imageops::resize(image, w, h, filter))
}

/// Non-local means denoising: every pixel becomes a similarity-weighted
/// average of search-window pixels, with similarity measured between the
/// surrounding patches rather than the pixels themselves.
fn nl_means(image: &BgrImage, h: f32) -> anyhow::Result<BgrImage> {
    let (w, ht) = image.dimensions();
    ensure!(w > 0 && ht > 0, "empty image");

    let t_rad = (NLM_TEMPLATE_WINDOW / 2) as i64;
    let s_rad = (NLM_SEARCH_WINDOW / 2) as i64;
    let patch_n = (NLM_TEMPLATE_WINDOW * NLM_TEMPLATE_WINDOW * 3) as f64;
    let h2 = (h as f64 * h as f64).max(1e-6);

    let clamp_x = |x: i64| x.clamp(0, w as i64 - 1) as u32;
    let clamp_y = |y: i64| y.clamp(0, ht as i64 - 1) as u32;

    // Mean squared patch distance between the patches centred at p and q.
    let patch_dist = |px: i64, py: i64, qx: i64, qy: i64| -> f64 {
        let mut acc = 0.0;
        for dy in -t_rad..=t_rad {
            for dx in -t_rad..=t_rad {
                let a = image.get_pixel(clamp_x(px + dx), clamp_y(py + dy));
                let b = image.get_pixel(clamp_x(qx + dx), clamp_y(qy + dy));
                for c in 0..3 {
                    let d = a[c] as f64 - b[c] as f64;
                    acc += d * d;
                }
            }
        }
        acc / patch_n
    };

    let rows: Vec<Vec<[u8; 3]>> = (0..ht as i64)
        .into_par_iter()
        .map(|y| {
            let mut row = Vec::with_capacity(w as usize);
            for x in 0..w as i64 {
                let mut weight_sum = 0.0f64;
                let mut acc = [0.0f64; 3];
                for qy in (y - s_rad)..=(y + s_rad) {
                    for qx in (x - s_rad)..=(x + s_rad) {
                        let weight = (-patch_dist(x, y, qx, qy) / h2).exp();
                        let q = image.get_pixel(clamp_x(qx), clamp_y(qy));
                        weight_sum += weight;
                        for c in 0..3 {
                            acc[c] += weight * q[c] as f64;
                        }
                    }
                }
                row.push([
                    (acc[0] / weight_sum).round().clamp(0.0, 255.0) as u8,
                    (acc[1] / weight_sum).round().clamp(0.0, 255.0) as u8,
                    (acc[2] / weight_sum).round().clamp(0.0, 255.0) as u8,
                ]);
            }
            row
        })
        .collect();

    Ok(from_rows(w, ht, &rows))
}

/// Edge-preserving bilateral filter over all three channels, weighting
/// neighbors by spatial distance and by BGR color distance.
fn bilateral(image: &BgrImage, d: u32, sigma_color: f64, sigma_space: f64) -> anyhow::Result<BgrImage> {
    let (w, h) = image.dimensions();
    ensure!(w > 0 && h > 0, "empty image");
    ensure!(d >= 1, "bilateral diameter must be positive");

    let radius = (d / 2) as i64;
    let inv_color = -0.5 / (sigma_color * sigma_color);
    let inv_space = -0.5 / (sigma_space * sigma_space);

    // Spatial weights only depend on the offset.
    let side = (2 * radius + 1) as usize;
    let mut spatial = vec![0.0f64; side * side];
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let idx = ((dy + radius) as usize) * side + (dx + radius) as usize;
            spatial[idx] = ((dy * dy + dx * dx) as f64 * inv_space).exp();
        }
    }

    let clamp_x = |x: i64| x.clamp(0, w as i64 - 1) as u32;
    let clamp_y = |y: i64| y.clamp(0, h as i64 - 1) as u32;

    let rows: Vec<Vec<[u8; 3]>> = (0..h as i64)
        .into_par_iter()
        .map(|y| {
            let mut row = Vec::with_capacity(w as usize);
            for x in 0..w as i64 {
                let center = image.get_pixel(x as u32, y as u32);
                let mut weight_sum = 0.0f64;
                let mut acc = [0.0f64; 3];
                for dy in -radius..=radius {
                    for dx in -radius..=radius {
                        let q = image.get_pixel(clamp_x(x + dx), clamp_y(y + dy));
                        let mut color_d2 = 0.0;
                        for c in 0..3 {
                            let diff = center[c] as f64 - q[c] as f64;
                            color_d2 += diff * diff;
                        }
                        let s_idx = ((dy + radius) as usize) * side + (dx + radius) as usize;
                        let weight = spatial[s_idx] * (color_d2 * inv_color).exp();
                        weight_sum += weight;
                        for c in 0..3 {
                            acc[c] += weight * q[c] as f64;
                        }
                    }
                }
                row.push([
                    (acc[0] / weight_sum).round().clamp(0.0, 255.0) as u8,
                    (acc[1] / weight_sum).round().clamp(0.0, 255.0) as u8,
                    (acc[2] / weight_sum).round().clamp(0.0, 255.0) as u8,
                ]);
            }
            row
        })
        .collect();

    Ok(from_rows(w, h, &rows))
}

/// CLAHE on the L channel of L*a*b*: tile histograms are clipped and the
/// excess redistributed, the per-tile tone mappings are applied with
/// bilinear interpolation between tile centres.
fn clahe_lab(image: &BgrImage, clip_limit: f32) -> anyhow::Result<BgrImage> {
    let (w, h) = image.dimensions();
    ensure!(w > 0 && h > 0, "empty image");

    // Split into L plane + (a, b) remainder.
    let mut l_plane = GrayImage::new(w, h);
    let mut ab: Vec<(u8, u8)> = Vec::with_capacity((w * h) as usize);
    for (x, y, px) in image.enumerate_pixels() {
        let lab = bgr_to_lab8(px.0);
        l_plane.put_pixel(x, y, Luma([lab[0]]));
        ab.push((lab[1], lab[2]));
    }

    let equalized = clahe_plane(&l_plane, clip_limit);

    let mut out = BgrImage::new(w, h);
    for (i, (x, y, px)) in out.enumerate_pixels_mut().enumerate() {
        let l = equalized.get_pixel(x, y)[0];
        let (a, b) = ab[i];
        *px = Rgb(lab8_to_bgr([l, a, b]));
    }
    Ok(out)
}

fn clahe_plane(plane: &GrayImage, clip_limit: f32) -> GrayImage {
    let w = plane.width();
    let h = plane.height();
    let tile_w = w.div_ceil(CLAHE_GRID).max(1);
    let tile_h = h.div_ceil(CLAHE_GRID).max(1);
    let tiles_x = w.div_ceil(tile_w);
    let tiles_y = h.div_ceil(tile_h);

    // Pre-compute the tone mapping for every tile.
    let maps: Vec<Vec<[u8; 256]>> = (0..tiles_y)
        .map(|ty| {
            (0..tiles_x)
                .map(|tx| tile_mapping(plane, tx, ty, tile_w, tile_h, clip_limit))
                .collect()
        })
        .collect();

    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let v = plane.get_pixel(x, y)[0];
            let mapped = bilinear_tile_lookup(&maps, v, x, y, tile_w, tile_h, tiles_x, tiles_y);
            out.put_pixel(x, y, Luma([mapped]));
        }
    }
    out
}

/// Clipped-histogram tone mapping for one tile.
fn tile_mapping(
    plane: &GrayImage,
    tx: u32,
    ty: u32,
    tile_w: u32,
    tile_h: u32,
    clip_limit: f32,
) -> [u8; 256] {
    let x0 = tx * tile_w;
    let y0 = ty * tile_h;
    let x1 = ((tx + 1) * tile_w).min(plane.width());
    let y1 = ((ty + 1) * tile_h).min(plane.height());
    let tile_area = ((x1 - x0) * (y1 - y0)).max(1) as u64;

    let mut hist = [0u64; 256];
    for py in y0..y1 {
        for px in x0..x1 {
            hist[plane.get_pixel(px, py)[0] as usize] += 1;
        }
    }

    // Clip and redistribute the excess uniformly.
    let clip = ((tile_area as f32 / 256.0) * clip_limit).max(1.0) as u64;
    let mut excess = 0u64;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let per_bin = excess / 256;
    let leftover = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += per_bin + u64::from(i < leftover);
    }

    // CDF → tone mapping.
    let mut mapping = [0u8; 256];
    let mut cdf = 0u64;
    for (i, &bin) in hist.iter().enumerate() {
        cdf += bin;
        mapping[i] = ((cdf * 255) / tile_area).min(255) as u8;
    }
    mapping
}

/// Bilinear interpolation between the four tile mappings nearest (x, y).
fn bilinear_tile_lookup(
    maps: &[Vec<[u8; 256]>],
    value: u8,
    x: u32,
    y: u32,
    tile_w: u32,
    tile_h: u32,
    tiles_x: u32,
    tiles_y: u32,
) -> u8 {
    let fx = (x as f32 - tile_w as f32 / 2.0) / tile_w as f32;
    let fy = (y as f32 - tile_h as f32 / 2.0) / tile_h as f32;

    let tx0 = (fx.floor() as i64).clamp(0, tiles_x as i64 - 1) as usize;
    let ty0 = (fy.floor() as i64).clamp(0, tiles_y as i64 - 1) as usize;
    let tx1 = (tx0 + 1).min(tiles_x as usize - 1);
    let ty1 = (ty0 + 1).min(tiles_y as usize - 1);

    let wx = (fx - tx0 as f32).clamp(0.0, 1.0);
    let wy = (fy - ty0 as f32).clamp(0.0, 1.0);

    let v00 = maps[ty0][tx0][value as usize] as f32;
    let v10 = maps[ty0][tx1][value as usize] as f32;
    let v01 = maps[ty1][tx0][value as usize] as f32;
    let v11 = maps[ty1][tx1][value as usize] as f32;

    let top = v00 + (v10 - v00) * wx;
    let bottom = v01 + (v11 - v01) * wx;
    (top + (bottom - top) * wy).round() as u8
}

/// Unsharp mask: `out = clip(image·(1+a) − blur(image, σ=1)·a)`.
fn unsharp_mask(image: &BgrImage, amount: f32) -> anyhow::Result<BgrImage> {
    ensure!(image.width() > 0 && image.height() > 0, "empty image");
    let blurred = gaussian_blur_f32(image, SHARPEN_SIGMA);
    let mut out = BgrImage::new(image.width(), image.height());
    for ((src, blur), dst) in image.pixels().zip(blurred.pixels()).zip(out.pixels_mut()) {
        let mut px = [0u8; 3];
        for c in 0..3 {
            let v = src[c] as f32 * (1.0 + amount) - blur[c] as f32 * amount;
            px[c] = v.round().clamp(0.0, 255.0) as u8;
        }
        *dst = Rgb(px);
    }
    Ok(out)
}

fn from_rows(w: u32, h: u32, rows: &[Vec<[u8; 3]>]) -> BgrImage {
    let mut out = BgrImage::new(w, h);
    for (y, row) in rows.iter().enumerate() {
        for (x, px) in row.iter().enumerate() {
            out.put_pixel(x as u32, y as u32, Rgb(*px));
        }
    }
    out
}
