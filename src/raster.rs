use image::{GrayImage, ImageBuffer, Luma, Rgb, Rgba};

/// Three-channel 8-bit raster in **B, G, R** channel order.
///
/// The container is `image`'s generic 3-channel buffer; the `Rgb` in the
/// type name is layout only. Channel order is fixed as BGR throughout the
/// pipeline — conversions happen at the decode and export boundaries.
pub type BgrImage = ImageBuffer<Rgb<u8>, Vec<u8>>;

/// Four-channel 8-bit raster in **B, G, R, A** channel order.
pub type BgraImage = ImageBuffer<Rgba<u8>, Vec<u8>>;

/// Single-channel opacity plane. 0 = fully transparent.
pub type AlphaImage = GrayImage;

// ── Channel-aware helpers ─────────────────────────────────────────────────

/// Rec. 601 luma from a BGR pixel, matching the usual BGR→gray conversion.
#[inline]
pub fn bgr_luma(px: &Rgb<u8>) -> u8 {
    let b = px[0] as f32;
    let g = px[1] as f32;
    let r = px[2] as f32;
    (0.299 * r + 0.587 * g + 0.114 * b).round().min(255.0) as u8
}

/// Convert a BGR image to its grayscale plane.
pub fn bgr_to_gray(image: &BgrImage) -> GrayImage {
    let mut gray = GrayImage::new(image.width(), image.height());
    for (src, dst) in image.pixels().zip(gray.pixels_mut()) {
        *dst = Luma([bgr_luma(src)]);
    }
    gray
}

/// Mean and standard deviation of a grayscale plane.
pub fn gray_mean_std(gray: &GrayImage) -> (f64, f64) {
    let n = (gray.width() as u64 * gray.height() as u64).max(1) as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for p in gray.pixels() {
        let v = p[0] as f64;
        sum += v;
        sum_sq += v * v;
    }
    let mean = sum / n;
    let var = (sum_sq / n - mean * mean).max(0.0);
    (mean, var.sqrt())
}

// ── Hex codec ─────────────────────────────────────────────────────────────

/// Format a BGR triple as lowercase `#rrggbb`.
pub fn bgr_to_hex(bgr: [u8; 3]) -> String {
    format!("#{:02x}{:02x}{:02x}", bgr[2], bgr[1], bgr[0])
}

/// Parse `#rrggbb` (leading `#` optional) into a BGR triple.
pub fn hex_to_bgr(hex: &str) -> Option<[u8; 3]> {
    let hex = hex.strip_prefix('#').unwrap_or(hex);
    if hex.len() != 6 {
        return None;
    }
    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
    Some([b, g, r])
}

// ── 8-bit L*a*b* ──────────────────────────────────────────────────────────
//
// D65 sRGB → L*a*b* with the 8-bit scaling used by OpenCV:
// L ← L*255/100, a ← a+128, b ← b+128. Only the L plane is ever modified
// (CLAHE), so round-trip error stays in the luminance channel.

const XN: f64 = 0.950456;
const ZN: f64 = 1.088754;

fn srgb_to_linear(c: f64) -> f64 {
    if c > 0.04045 {
        ((c + 0.055) / 1.055).powf(2.4)
    } else {
        c / 12.92
    }
}

fn linear_to_srgb(c: f64) -> f64 {
    if c > 0.0031308 {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    } else {
        12.92 * c
    }
}

fn lab_f(t: f64) -> f64 {
    if t > 0.008856 {
        t.cbrt()
    } else {
        7.787 * t + 16.0 / 116.0
    }
}

/// BGR pixel → 8-bit (L, a, b).
pub fn bgr_to_lab8(bgr: [u8; 3]) -> [u8; 3] {
    let b = srgb_to_linear(bgr[0] as f64 / 255.0);
    let g = srgb_to_linear(bgr[1] as f64 / 255.0);
    let r = srgb_to_linear(bgr[2] as f64 / 255.0);

    let x = (0.412453 * r + 0.357580 * g + 0.180423 * b) / XN;
    let y = 0.212671 * r + 0.715160 * g + 0.072169 * b;
    let z = (0.019334 * r + 0.119193 * g + 0.950227 * b) / ZN;

    let l = if y > 0.008856 {
        116.0 * y.cbrt() - 16.0
    } else {
        903.3 * y
    };
    let a = 500.0 * (lab_f(x) - lab_f(y));
    let bb = 200.0 * (lab_f(y) - lab_f(z));

    [
        (l * 255.0 / 100.0).round().clamp(0.0, 255.0) as u8,
        (a + 128.0).round().clamp(0.0, 255.0) as u8,
        (bb + 128.0).round().clamp(0.0, 255.0) as u8,
    ]
}

/// 8-bit (L, a, b) → BGR pixel.
pub fn lab8_to_bgr(lab: [u8; 3]) -> [u8; 3] {
    let l = lab[0] as f64 * 100.0 / 255.0;
    let a = lab[1] as f64 - 128.0;
    let bb = lab[2] as f64 - 128.0;

    let fy = (l + 16.0) / 116.0;
    let fx = fy + a / 500.0;
    let fz = fy - bb / 200.0;

    let finv = |t: f64| {
        let t3 = t * t * t;
        if t3 > 0.008856 {
            t3
        } else {
            (t - 16.0 / 116.0) / 7.787
        }
    };

    let y = if l > 8.0 { fy * fy * fy } else { l / 903.3 };
    let x = finv(fx) * XN;
    let z = finv(fz) * ZN;

    let r = 3.240479 * x - 1.537150 * y - 0.498535 * z;
    let g = -0.969256 * x + 1.875992 * y + 0.041556 * z;
    let b = 0.055648 * x - 0.204043 * y + 1.057311 * z;

    let to8 = |c: f64| (linear_to_srgb(c.clamp(0.0, 1.0)) * 255.0).round().clamp(0.0, 255.0) as u8;
    [to8(b), to8(g), to8(r)]
}
