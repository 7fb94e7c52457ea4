use image::GrayImage;
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::point::Point;

use crate::settings::Settings;

// ── Geometry ──────────────────────────────────────────────────────────────

/// Enclosed area of a closed integer contour (shoelace formula).
fn contour_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut acc = 0i64;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        acc += a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64;
    }
    (acc.abs() as f64) / 2.0
}

/// Perpendicular distance from `p` to the segment (a, b); falls back to
/// point distance when the segment is degenerate.
fn perpendicular_distance(p: [f64; 2], a: [f64; 2], b: [f64; 2]) -> f64 {
    let vx = b[0] - a[0];
    let vy = b[1] - a[1];
    let len_sq = vx * vx + vy * vy;
    if len_sq == 0.0 {
        return ((p[0] - a[0]).powi(2) + (p[1] - a[1]).powi(2)).sqrt();
    }
    let t = ((p[0] - a[0]) * vx + (p[1] - a[1]) * vy) / len_sq;
    let px = a[0] + t * vx;
    let py = a[1] + t * vy;
    ((p[0] - px).powi(2) + (p[1] - py).powi(2)).sqrt()
}

/// Ramer-Douglas-Peucker simplification: keeps a subsequence of the input
/// whose perpendicular deviation from the dropped points stays within
/// `epsilon`.
fn rdp_simplify(points: &[[f64; 2]], epsilon: f64) -> Vec<[f64; 2]> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let mut keep = Vec::new();
    rdp_recurse(points, 0, points.len() - 1, epsilon, &mut keep);
    keep.sort_unstable();
    keep.dedup();
    keep.into_iter().map(|i| points[i]).collect()
}

fn rdp_recurse(points: &[[f64; 2]], start: usize, end: usize, epsilon: f64, keep: &mut Vec<usize>) {
    if end <= start + 1 {
        keep.push(start);
        keep.push(end);
        return;
    }
    let mut max_dist = 0.0;
    let mut max_idx = start;
    for i in (start + 1)..end {
        let d = perpendicular_distance(points[i], points[start], points[end]);
        if d > max_dist {
            max_dist = d;
            max_idx = i;
        }
    }
    if max_dist > epsilon {
        rdp_recurse(points, start, max_idx, epsilon, keep);
        rdp_recurse(points, max_idx, end, epsilon, keep);
    } else {
        keep.push(start);
        keep.push(end);
    }
}

/// Chaikin corner cutting on a closed polyline: each edge is replaced by
/// its 1/4 and 3/4 points.
fn chaikin_smooth(points: &[[f64; 2]], iterations: u32) -> Vec<[f64; 2]> {
    let mut pts = points.to_vec();
    for _ in 0..iterations {
        let n = pts.len();
        let mut next = Vec::with_capacity(n * 2);
        for i in 0..n {
            let p0 = pts[i];
            let p1 = pts[(i + 1) % n];
            next.push([0.75 * p0[0] + 0.25 * p1[0], 0.75 * p0[1] + 0.25 * p1[1]]);
            next.push([0.25 * p0[0] + 0.75 * p1[0], 0.25 * p0[1] + 0.75 * p1[1]]);
        }
        pts = next;
    }
    pts
}

/// Catmull-Rom derived cubic Bézier commands through the polyline, with
/// neighbor tangents clamped at the ends.
fn catmull_rom_beziers(points: &[[f64; 2]]) -> String {
    let n = points.len();
    let mut cmds = Vec::with_capacity(n.saturating_sub(1));
    for i in 0..n - 1 {
        let p0 = points[i.saturating_sub(1)];
        let p1 = points[i];
        let p2 = points[i + 1];
        let p3 = points[(i + 2).min(n - 1)];
        let c1 = [p1[0] + (p2[0] - p0[0]) / 6.0, p1[1] + (p2[1] - p0[1]) / 6.0];
        let c2 = [p2[0] - (p3[0] - p1[0]) / 6.0, p2[1] - (p3[1] - p1[1]) / 6.0];
        cmds.push(format!(
            "C {:.2} {:.2} {:.2} {:.2} {:.2} {:.2}",
            c1[0], c1[1], c2[0], c2[1], p2[0], p2[1]
        ));
    }
    cmds.join(" ")
}

/// Convert one contour into SVG path data (`M … Z`), or `None` when too
/// few points survive simplification.
fn contour_to_path(points: &[[f64; 2]], settings: &Settings) -> Option<String> {
    if points.len() < 3 {
        return None;
    }
    let pts = rdp_simplify(points, settings.detail.rdp_epsilon());
    if pts.len() < 3 {
        return None;
    }
    let pts = if settings.smooth {
        chaikin_smooth(&pts, settings.detail.chaikin_iterations())
    } else {
        pts
    };

    let mut path = format!("M {:.2} {:.2} ", pts[0][0], pts[0][1]);
    if settings.smooth && pts.len() > 3 {
        path.push_str(&catmull_rom_beziers(&pts));
    } else {
        let segments: Vec<String> = pts[1..]
            .iter()
            .map(|p| format!("L {:.2} {:.2}", p[0], p[1]))
            .collect();
        path.push_str(&segments.join(" "));
    }
    path.push_str(" Z");
    Some(path)
}

// ── Layer tracing ─────────────────────────────────────────────────────────

fn to_f64(points: &[Point<i32>]) -> Vec<[f64; 2]> {
    points.iter().map(|p| [p.x as f64, p.y as f64]).collect()
}

/// Trace one binary mask into a `<path>` element.
///
/// Every outer border above the area threshold becomes a subpath; each of
/// its hole borders is appended as a further subpath with reversed
/// traversal, so the `evenodd` fill rule renders the holes empty. Returns
/// `None` when nothing traceable remains.
pub fn trace_layer(mask: &GrayImage, color: &str, settings: &Settings) -> Option<String> {
    if mask.width() == 0 || mask.height() == 0 {
        return None;
    }

    let contours: Vec<Contour<i32>> = find_contours(mask);
    if contours.is_empty() {
        return None;
    }
    let min_area = settings.min_area as f64;

    let mut parts: Vec<String> = Vec::new();
    for (i, contour) in contours.iter().enumerate() {
        if contour.border_type != BorderType::Outer {
            continue;
        }
        if contour_area(&contour.points) < min_area {
            continue;
        }
        let Some(outer) = contour_to_path(&to_f64(&contour.points), settings) else {
            continue;
        };
        parts.push(outer);

        // Direct holes of this outer border, traversed in reverse.
        for hole in contours.iter().filter(|c| {
            c.border_type == BorderType::Hole && c.parent == Some(i)
        }) {
            if contour_area(&hole.points) < min_area {
                continue;
            }
            let mut reversed = to_f64(&hole.points);
            reversed.reverse();
            if let Some(hole_path) = contour_to_path(&reversed, settings) {
                parts.push(hole_path);
            }
        }
    }

    if parts.is_empty() {
        return None;
    }
    Some(format!(
        r#"<path fill="{}" fill-rule="evenodd" d="{}"/>"#,
        color,
        parts.join(" ")
    ))
}

// ── Document assembly ─────────────────────────────────────────────────────

/// Assemble a complete SVG document from traced layers.
pub fn assemble_svg(
    layers: &[(String, String)],
    width: u32,
    height: u32,
    background: &str,
) -> String {
    let mut lines = vec![
        r#"<?xml version="1.0" encoding="UTF-8"?>"#.to_string(),
        format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {width} {height}" width="{width}" height="{height}">"#
        ),
    ];

    if !background.is_empty() && background != "none" {
        lines.push(format!(
            r#"  <rect width="{width}" height="{height}" fill="{background}"/>"#
        ));
    }

    for (_, path_el) in layers {
        if !path_el.is_empty() {
            lines.push(format!("  {path_el}"));
        }
    }

    lines.push("</svg>".to_string());
    lines.join("\n")
}
