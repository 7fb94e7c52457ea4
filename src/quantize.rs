use image::{GrayImage, Luma, Rgb};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::{Result, VectorizeError};
use crate::raster::{bgr_to_gray, bgr_to_hex, AlphaImage, BgrImage};
use crate::settings::QuantizeMethod;

// ── Constants ─────────────────────────────────────────────────────────────

/// Palette size bounds after clamping a request.
const K_MIN: u32 = 2;
const K_MAX: u32 = 64;
/// Upper bound for the auto-K histogram heuristic.
const AUTO_K_MAX: u32 = 32;

/// Clustering seed. Fixed so identical inputs produce identical palettes.
const CLUSTER_SEED: u64 = 42;

/// Mini-batch k-means: sample cap, batch size, restart count, iterations.
const KMEANS_SAMPLE: usize = 100_000;
const KMEANS_BATCH: usize = 10_000;
const KMEANS_RUNS: u64 = 3;
const KMEANS_MAX_ITER: u32 = 100;

/// OpenCV-style k-means used for the `octree` method.
const OCTREE_SAMPLE: usize = 50_000;
const OCTREE_RESTARTS: u64 = 5;
const OCTREE_MAX_ITER: u32 = 20;
const OCTREE_EPS: f64 = 1.0;

/// Palette entries covering less than this pixel fraction are pruned.
const MIN_COVERAGE: f64 = 0.001;
/// Palette pairs closer than this perceptual distance are merged.
const MERGE_DISTANCE: f64 = 15.0;

/// Quantization output: the repainted image, the hex palette, and one
/// binary mask per palette entry.
pub struct Quantized {
    pub image: BgrImage,
    pub palette: Vec<String>,
    pub masks: Vec<GrayImage>,
}

// ── Entry point ───────────────────────────────────────────────────────────

/// Quantize `image` to at most `n_colors` representative colors.
///
/// `n_colors == 0` requests automatic selection from the gray histogram;
/// anything else is clamped to 2..=64. The refined palette has no two
/// entries within perceptual distance 15 and no entry below 0.1% coverage
/// (unless a single entry remains). When `alpha` is present each mask is
/// intersected with it pixel-wise.
pub fn quantize(
    image: &BgrImage,
    alpha: Option<&AlphaImage>,
    n_colors: u32,
    method: QuantizeMethod,
) -> Result<Quantized> {
    let (w, h) = image.dimensions();
    let total = w as usize * h as usize;
    if total == 0 {
        return Err(VectorizeError::Quantization("image has zero pixels".into()));
    }

    let k = if n_colors == 0 {
        auto_k(image)
    } else {
        n_colors.clamp(K_MIN, K_MAX)
    } as usize;

    let pixels: Vec<[u8; 3]> = image.pixels().map(|p| p.0).collect();

    let palette = match method {
        QuantizeMethod::Kmeans => kmeans_palette(&pixels, k),
        QuantizeMethod::MedianCut => median_cut(&pixels, k),
        QuantizeMethod::Octree => octree_palette(&pixels, k),
    };
    if palette.is_empty() {
        return Err(VectorizeError::Quantization("empty palette".into()));
    }

    let labels = assign_labels(&pixels, &palette);
    let (palette, labels) = refine_palette(palette, labels, total);

    // Rebuild the quantized image and the per-entry masks.
    let mut quantized = BgrImage::new(w, h);
    for (px, &label) in quantized.pixels_mut().zip(labels.iter()) {
        *px = Rgb(palette[label as usize]);
    }

    let mut masks: Vec<GrayImage> = (0..palette.len())
        .map(|i| {
            let mut mask = GrayImage::new(w, h);
            for (dst, &label) in mask.pixels_mut().zip(labels.iter()) {
                *dst = Luma([if label as usize == i { 255 } else { 0 }]);
            }
            mask
        })
        .collect();

    if let Some(alpha) = alpha {
        for mask in &mut masks {
            for (dst, a) in mask.pixels_mut().zip(alpha.pixels()) {
                dst[0] = dst[0].min(a[0]);
            }
        }
    }

    let hex = palette.iter().map(|&c| bgr_to_hex(c)).collect();

    Ok(Quantized {
        image: quantized,
        palette: hex,
        masks,
    })
}

/// Estimate a palette size from the gray histogram: one color per eight
/// occupied bins, clamped to [2, 32].
fn auto_k(image: &BgrImage) -> u32 {
    let gray = bgr_to_gray(image);
    let mut occupied = [false; 256];
    for p in gray.pixels() {
        occupied[p[0] as usize] = true;
    }
    let bins = occupied.iter().filter(|&&b| b).count() as u32;
    (bins / 8).clamp(K_MIN, AUTO_K_MAX)
}

// ── Assignment ────────────────────────────────────────────────────────────

fn dist_sq(a: [u8; 3], b: [u8; 3]) -> i64 {
    let mut acc = 0i64;
    for c in 0..3 {
        let d = a[c] as i64 - b[c] as i64;
        acc += d * d;
    }
    acc
}

/// Assign every pixel to the nearest palette entry by squared Euclidean
/// distance in BGR space; ties break toward the lower index.
fn assign_labels(pixels: &[[u8; 3]], palette: &[[u8; 3]]) -> Vec<u32> {
    pixels
        .par_iter()
        .map(|&px| {
            let mut best = 0u32;
            let mut best_d = i64::MAX;
            for (i, &entry) in palette.iter().enumerate() {
                let d = dist_sq(px, entry);
                if d < best_d {
                    best_d = d;
                    best = i as u32;
                }
            }
            best
        })
        .collect()
}

// ── Mini-batch k-means (`kmeans`) ─────────────────────────────────────────

fn sample_pixels(pixels: &[[u8; 3]], cap: usize, rng: &mut StdRng) -> Vec<[f32; 3]> {
    if pixels.len() <= cap {
        pixels.iter().map(|&p| to_f32(p)).collect()
    } else {
        rand::seq::index::sample(rng, pixels.len(), cap)
            .iter()
            .map(|i| to_f32(pixels[i]))
            .collect()
    }
}

fn to_f32(p: [u8; 3]) -> [f32; 3] {
    [p[0] as f32, p[1] as f32, p[2] as f32]
}

fn dist_sq_f(a: [f32; 3], b: [f32; 3]) -> f64 {
    let mut acc = 0.0f64;
    for c in 0..3 {
        let d = a[c] as f64 - b[c] as f64;
        acc += d * d;
    }
    acc
}

fn nearest_center(point: [f32; 3], centers: &[[f32; 3]]) -> usize {
    let mut best = 0;
    let mut best_d = f64::INFINITY;
    for (i, &c) in centers.iter().enumerate() {
        let d = dist_sq_f(point, c);
        if d < best_d {
            best_d = d;
            best = i;
        }
    }
    best
}

/// k-means++ seeding: each new center is drawn with probability
/// proportional to its squared distance from the chosen set.
fn kmeans_pp_init(points: &[[f32; 3]], k: usize, rng: &mut StdRng) -> Vec<[f32; 3]> {
    let mut centers = Vec::with_capacity(k);
    centers.push(points[rng.gen_range(0..points.len())]);
    let mut dist: Vec<f64> = points.iter().map(|&p| dist_sq_f(p, centers[0])).collect();

    while centers.len() < k {
        let total: f64 = dist.iter().sum();
        let next = if total <= f64::EPSILON {
            // All remaining mass is on already-chosen colors.
            rng.gen_range(0..points.len())
        } else {
            let mut target = rng.gen::<f64>() * total;
            let mut idx = points.len() - 1;
            for (i, &d) in dist.iter().enumerate() {
                if target <= d {
                    idx = i;
                    break;
                }
                target -= d;
            }
            idx
        };
        let center = points[next];
        centers.push(center);
        for (d, &p) in dist.iter_mut().zip(points.iter()) {
            *d = d.min(dist_sq_f(p, center));
        }
    }
    centers
}

fn inertia(points: &[[f32; 3]], centers: &[[f32; 3]]) -> f64 {
    // Sequential sum: a parallel reduction would make the restart
    // comparison order-dependent and break byte determinism.
    points
        .iter()
        .map(|&p| dist_sq_f(p, centers[nearest_center(p, centers)]))
        .sum()
}

/// Mini-batch k-means over a bounded sample: three restarts, online
/// per-center learning-rate updates, best inertia wins.
fn kmeans_palette(pixels: &[[u8; 3]], k: usize) -> Vec<[u8; 3]> {
    let mut rng = StdRng::seed_from_u64(CLUSTER_SEED);
    let sample = sample_pixels(pixels, KMEANS_SAMPLE, &mut rng);
    if sample.is_empty() {
        return Vec::new();
    }
    let batch = KMEANS_BATCH.min(sample.len());

    let mut best: Option<(f64, Vec<[f32; 3]>)> = None;
    for run in 0..KMEANS_RUNS {
        let mut rng = StdRng::seed_from_u64(CLUSTER_SEED + run);
        let mut centers = kmeans_pp_init(&sample, k, &mut rng);
        let mut counts = vec![0u64; k];

        for _ in 0..KMEANS_MAX_ITER {
            for _ in 0..batch {
                let point = sample[rng.gen_range(0..sample.len())];
                let c = nearest_center(point, &centers);
                counts[c] += 1;
                let eta = 1.0 / counts[c] as f32;
                for ch in 0..3 {
                    centers[c][ch] += eta * (point[ch] - centers[c][ch]);
                }
            }
        }

        let score = inertia(&sample, &centers);
        if best.as_ref().map_or(true, |(s, _)| score < *s) {
            best = Some((score, centers));
        }
    }

    round_centers(&best.expect("at least one k-means run").1)
}

// ── Median cut (`median_cut`) ─────────────────────────────────────────────

/// Classical Heckbert median cut: repeatedly split the most populated box
/// at the median of its longest-range channel.
fn median_cut(pixels: &[[u8; 3]], k: usize) -> Vec<[u8; 3]> {
    let mut boxes: Vec<Vec<[u8; 3]>> = vec![pixels.to_vec()];

    while boxes.len() < k {
        // Pop the box with the most pixels.
        let largest_idx = boxes
            .iter()
            .enumerate()
            .max_by_key(|(_, b)| b.len())
            .map(|(i, _)| i)
            .expect("non-empty box list");
        let mut largest = boxes.swap_remove(largest_idx);
        if largest.len() < 2 {
            boxes.push(largest);
            break;
        }

        // Longest-range channel.
        let mut lo = [255u8; 3];
        let mut hi = [0u8; 3];
        for px in &largest {
            for c in 0..3 {
                lo[c] = lo[c].min(px[c]);
                hi[c] = hi[c].max(px[c]);
            }
        }
        let channel = (0..3)
            .max_by_key(|&c| hi[c] as i32 - lo[c] as i32)
            .unwrap_or(0);

        largest.sort_unstable_by_key(|px| px[channel]);
        let right = largest.split_off(largest.len() / 2);
        boxes.push(largest);
        boxes.push(right);
    }

    boxes.iter().map(|b| box_average(b)).collect()
}

fn box_average(pixels: &[[u8; 3]]) -> [u8; 3] {
    let n = pixels.len().max(1) as u64;
    let mut sums = [0u64; 3];
    for px in pixels {
        for c in 0..3 {
            sums[c] += px[c] as u64;
        }
    }
    [
        (sums[0] / n) as u8,
        (sums[1] / n) as u8,
        (sums[2] / n) as u8,
    ]
}

// ── OpenCV-style k-means (`octree`) ───────────────────────────────────────

/// The `octree` method is a k-means approximation kept under its
/// historical name: Lloyd iterations with k-means++ seeding, five
/// restarts, and an ε = 1.0 center-movement stop.
fn octree_palette(pixels: &[[u8; 3]], k: usize) -> Vec<[u8; 3]> {
    let mut rng = StdRng::seed_from_u64(CLUSTER_SEED);
    let sample = sample_pixels(pixels, OCTREE_SAMPLE, &mut rng);
    if sample.is_empty() {
        return Vec::new();
    }

    let mut best: Option<(f64, Vec<[f32; 3]>)> = None;
    for run in 0..OCTREE_RESTARTS {
        let mut rng = StdRng::seed_from_u64(CLUSTER_SEED + run);
        let mut centers = kmeans_pp_init(&sample, k, &mut rng);

        for _ in 0..OCTREE_MAX_ITER {
            let assignments: Vec<usize> = sample
                .par_iter()
                .map(|&p| nearest_center(p, &centers))
                .collect();

            let mut sums = vec![[0.0f64; 3]; centers.len()];
            let mut counts = vec![0u64; centers.len()];
            for (&p, &c) in sample.iter().zip(assignments.iter()) {
                counts[c] += 1;
                for ch in 0..3 {
                    sums[c][ch] += p[ch] as f64;
                }
            }

            let mut movement: f64 = 0.0;
            for (i, center) in centers.iter_mut().enumerate() {
                if counts[i] == 0 {
                    continue; // empty cluster keeps its center
                }
                let next = [
                    (sums[i][0] / counts[i] as f64) as f32,
                    (sums[i][1] / counts[i] as f64) as f32,
                    (sums[i][2] / counts[i] as f64) as f32,
                ];
                movement = movement.max(dist_sq_f(*center, next).sqrt());
                *center = next;
            }
            if movement < OCTREE_EPS {
                break;
            }
        }

        let score = inertia(&sample, &centers);
        if best.as_ref().map_or(true, |(s, _)| score < *s) {
            best = Some((score, centers));
        }
    }

    round_centers(&best.expect("at least one restart").1)
}

fn round_centers(centers: &[[f32; 3]]) -> Vec<[u8; 3]> {
    centers
        .iter()
        .map(|c| {
            [
                c[0].round().clamp(0.0, 255.0) as u8,
                c[1].round().clamp(0.0, 255.0) as u8,
                c[2].round().clamp(0.0, 255.0) as u8,
            ]
        })
        .collect()
}

// ── Refinement ────────────────────────────────────────────────────────────

/// Red-mean perceptual distance between two BGR colors.
pub fn perceptual_distance(a: [u8; 3], b: [u8; 3]) -> f64 {
    let dr = a[2] as f64 - b[2] as f64;
    let dg = a[1] as f64 - b[1] as f64;
    let db = a[0] as f64 - b[0] as f64;
    let r_mean = (a[2] as f64 + b[2] as f64) / 2.0;
    ((2.0 + r_mean / 256.0) * dr * dr
        + 4.0 * dg * dg
        + (2.0 + (255.0 - r_mean) / 256.0) * db * db)
        .sqrt()
}

/// Two refinement passes: drop entries below the coverage floor (pixels
/// move to the nearest survivor), then repeatedly collapse the first
/// palette pair closer than [`MERGE_DISTANCE`] until none qualifies or
/// only two entries remain.
fn refine_palette(
    palette: Vec<[u8; 3]>,
    mut labels: Vec<u32>,
    total: usize,
) -> (Vec<[u8; 3]>, Vec<u32>) {
    let mut counts = vec![0u64; palette.len()];
    for &l in &labels {
        counts[l as usize] += 1;
    }

    // Coverage pruning.
    let mut keep: Vec<usize> = (0..palette.len())
        .filter(|&i| counts[i] as f64 / total as f64 >= MIN_COVERAGE)
        .collect();
    if keep.is_empty() {
        let argmax = counts
            .iter()
            .enumerate()
            .max_by_key(|&(_, &c)| c)
            .map(|(i, _)| i)
            .unwrap_or(0);
        keep = vec![argmax];
    }

    let mut current: Vec<[u8; 3]>;
    if keep.len() < palette.len() {
        current = keep.iter().map(|&i| palette[i]).collect();
        // Old index → new index; dropped entries go to the nearest survivor.
        let remap: Vec<u32> = (0..palette.len())
            .map(|old| {
                if let Some(new) = keep.iter().position(|&kept| kept == old) {
                    new as u32
                } else {
                    assign_labels(&[palette[old]], &current)[0]
                }
            })
            .collect();
        for l in labels.iter_mut() {
            *l = remap[*l as usize];
        }
    } else {
        current = palette;
    }

    // Perceptual merging with in-place label compaction.
    'merge: while current.len() > 2 {
        for i in 0..current.len() {
            for j in (i + 1)..current.len() {
                if perceptual_distance(current[i], current[j]) < MERGE_DISTANCE {
                    let (i, j) = (i as u32, j as u32);
                    for l in labels.iter_mut() {
                        if *l == j {
                            *l = i;
                        } else if *l > j {
                            *l -= 1;
                        }
                    }
                    current.remove(j as usize);
                    continue 'merge;
                }
            }
        }
        break;
    }

    (current, labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn two_tone(w: u32, h: u32, a: [u8; 3], b: [u8; 3]) -> BgrImage {
        BgrImage::from_fn(w, h, |x, _| if x < w / 2 { Rgb(a) } else { Rgb(b) })
    }

    #[test]
    fn perceptual_distance_formula() {
        // BGR (0,0,0) vs (4,0,0): only the blue channel differs.
        let d = perceptual_distance([0, 0, 0], [4, 0, 0]);
        assert_relative_eq!(d, ((2.0 + 255.0 / 256.0) * 16.0f64).sqrt(), epsilon = 1e-12);
        // Identical colors are at distance zero.
        assert_eq!(perceptual_distance([9, 9, 9], [9, 9, 9]), 0.0);
    }

    #[test]
    fn ties_break_toward_lower_index() {
        let labels = assign_labels(&[[1, 0, 0]], &[[0, 0, 0], [2, 0, 0]]);
        assert_eq!(labels[0], 0);
    }

    #[test]
    fn two_tone_image_recovers_both_colors() {
        let img = two_tone(16, 16, [0, 0, 0], [255, 255, 255]);
        for method in [
            QuantizeMethod::Kmeans,
            QuantizeMethod::MedianCut,
            QuantizeMethod::Octree,
        ] {
            let q = quantize(&img, None, 2, method).unwrap();
            let mut palette = q.palette.clone();
            palette.sort();
            assert_eq!(palette, vec!["#000000", "#ffffff"], "{method:?}");
            assert_eq!(q.image, img, "{method:?}");
            // Masks partition the image.
            for (x, y, _) in img.enumerate_pixels() {
                let lit = q.masks.iter().filter(|m| m.get_pixel(x, y)[0] == 255).count();
                assert_eq!(lit, 1, "{method:?} at ({x},{y})");
            }
        }
    }

    #[test]
    fn requested_k_is_clamped() {
        let img = two_tone(8, 8, [10, 10, 10], [240, 240, 240]);
        let q = quantize(&img, None, 1, QuantizeMethod::Kmeans).unwrap();
        assert_eq!(q.palette.len(), 2);
    }

    #[test]
    fn auto_k_follows_histogram_occupancy() {
        // 64 gray levels → 64 occupied bins → K = 8.
        let img = BgrImage::from_fn(64, 64, |x, _| {
            let v = (x * 4) as u8;
            Rgb([v, v, v])
        });
        assert_eq!(auto_k(&img), 8);
        // Flat image → single bin → clamped up to 2.
        assert_eq!(auto_k(&BgrImage::from_pixel(4, 4, Rgb([7, 7, 7]))), 2);
    }

    #[test]
    fn low_coverage_entries_are_pruned() {
        // 2 of 2500 pixels (0.08%) in a second color.
        let mut img = BgrImage::from_pixel(50, 50, Rgb([200, 200, 200]));
        img.put_pixel(0, 0, Rgb([0, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 0, 0]));
        let q = quantize(&img, None, 2, QuantizeMethod::MedianCut).unwrap();
        assert_eq!(q.palette.len(), 1);
        assert_eq!(q.image.get_pixel(0, 0), q.image.get_pixel(10, 10));
    }

    #[test]
    fn close_palette_entries_merge() {
        // Entries 0 and 1 sit within perceptual distance 15 (d = 12),
        // entry 2 is far away: 1 collapses into 0 and 2 shifts down.
        let palette = vec![[100u8, 100, 100], [104, 104, 104], [255, 255, 255]];
        let labels = vec![0u32, 1, 2, 1, 0, 2];
        let (palette, labels) = refine_palette(palette, labels, 6);
        assert_eq!(palette, vec![[100, 100, 100], [255, 255, 255]]);
        assert_eq!(labels, vec![0, 0, 1, 0, 0, 1]);
    }

    #[test]
    fn refined_palette_has_no_close_pairs() {
        let img = BgrImage::from_fn(32, 32, |x, y| {
            Rgb([((x * 29 + y * 31) % 256) as u8, ((x * 7) % 256) as u8, ((y * 19) % 256) as u8])
        });
        let q = quantize(&img, None, 16, QuantizeMethod::Kmeans).unwrap();
        let entries: Vec<[u8; 3]> = q
            .palette
            .iter()
            .map(|h| crate::raster::hex_to_bgr(h).unwrap())
            .collect();
        if entries.len() > 2 {
            for i in 0..entries.len() {
                for j in (i + 1)..entries.len() {
                    assert!(
                        perceptual_distance(entries[i], entries[j]) >= MERGE_DISTANCE,
                        "entries {i} and {j} too close"
                    );
                }
            }
        }
    }

    #[test]
    fn alpha_masks_out_transparent_pixels() {
        let img = two_tone(8, 8, [0, 0, 0], [255, 255, 255]);
        let mut alpha = AlphaImage::from_pixel(8, 8, Luma([255]));
        alpha.put_pixel(0, 0, Luma([0]));
        let q = quantize(&img, Some(&alpha), 2, QuantizeMethod::Kmeans).unwrap();
        for mask in &q.masks {
            assert_eq!(mask.get_pixel(0, 0)[0], 0);
        }
        let lit = q.masks.iter().filter(|m| m.get_pixel(4, 4)[0] == 255).count();
        assert_eq!(lit, 1);
    }

    #[test]
    fn quantization_is_deterministic() {
        let img = BgrImage::from_fn(40, 40, |x, y| {
            Rgb([((x * 13 + y * 7) % 256) as u8, (x * 5 % 256) as u8, (y * 11 % 256) as u8])
        });
        let a = quantize(&img, None, 8, QuantizeMethod::Kmeans).unwrap();
        let b = quantize(&img, None, 8, QuantizeMethod::Kmeans).unwrap();
        assert_eq!(a.palette, b.palette);
        assert_eq!(a.image, b.image);
    }

    #[test]
    fn median_cut_splits_to_pure_boxes() {
        let colors = [[0u8, 0, 0], [0, 0, 255], [0, 255, 0], [255, 255, 255]];
        let img = BgrImage::from_fn(16, 16, |x, _| Rgb(colors[(x / 4 % 4) as usize]));
        let q = quantize(&img, None, 4, QuantizeMethod::MedianCut).unwrap();
        let mut palette = q.palette.clone();
        palette.sort();
        assert_eq!(palette, vec!["#000000", "#00ff00", "#ff0000", "#ffffff"]);
    }
}
