use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Vectorization mode. `Auto` is resolved to a concrete mode by the
/// detector before any downstream stage sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Auto,
    Photo,
    Logo,
    LineArt,
    PixelArt,
}

/// Palette construction algorithm.
///
/// `Octree` is a k-means approximation kept under its historical name for
/// external compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizeMethod {
    Kmeans,
    MedianCut,
    Octree,
}

/// Geometric fidelity of the traced outlines. Indexes the RDP tolerance
/// and the Chaikin iteration count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detail {
    Low,
    Medium,
    High,
    Ultra,
}

impl Detail {
    /// RDP perpendicular-distance tolerance in pixels.
    pub fn rdp_epsilon(self) -> f64 {
        match self {
            Detail::Low => 3.0,
            Detail::Medium => 1.5,
            Detail::High => 0.8,
            Detail::Ultra => 0.3,
        }
    }

    /// Chaikin corner-cutting passes.
    pub fn chaikin_iterations(self) -> u32 {
        match self {
            Detail::Low => 1,
            Detail::Medium => 2,
            Detail::High => 3,
            Detail::Ultra => 4,
        }
    }
}

/// Pipeline settings.
///
/// All fields are optional on the wire — absent keys take the documented
/// defaults, unknown keys are ignored. Construct with `Settings::default()`
/// and override fields, or deserialize from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mode: Mode,
    /// Target palette size, clamped to 2..=64. `0` requests auto-selection.
    pub n_colors: u32,
    pub quantize_method: QuantizeMethod,
    pub detail: Detail,
    /// Enable Chaikin smoothing and cubic Bézier fitting.
    pub smooth: bool,
    pub upscale: bool,
    pub denoise: bool,
    pub bilateral: bool,
    pub clahe: bool,
    pub sharpen: bool,
    /// Background fill as `#rrggbb`, or `"none"` for no background rect.
    pub background: String,
    /// Run the SVG optimizer on the assembled document.
    pub optimize: bool,
    /// Contours enclosing less than this area (px²) are discarded.
    pub min_area: u32,
    pub round_coords: bool,
    pub remove_comments: bool,
    pub minify: bool,
    pub merge_paths: bool,
    pub collapse_groups: bool,
    pub optimize_viewbox: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            mode: Mode::Auto,
            n_colors: 16,
            quantize_method: QuantizeMethod::Kmeans,
            detail: Detail::Medium,
            smooth: true,
            upscale: true,
            denoise: true,
            bilateral: true,
            clahe: true,
            sharpen: true,
            background: "none".to_string(),
            optimize: true,
            min_area: 4,
            round_coords: true,
            remove_comments: true,
            minify: true,
            merge_paths: true,
            collapse_groups: true,
            optimize_viewbox: true,
        }
    }
}

// ── FromStr for CLI parsing ───────────────────────────────────────────────

impl FromStr for Mode {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Mode::Auto),
            "photo" => Ok(Mode::Photo),
            "logo" => Ok(Mode::Logo),
            "line_art" => Ok(Mode::LineArt),
            "pixel_art" => Ok(Mode::PixelArt),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

impl FromStr for QuantizeMethod {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "kmeans" => Ok(QuantizeMethod::Kmeans),
            "median_cut" => Ok(QuantizeMethod::MedianCut),
            "octree" => Ok(QuantizeMethod::Octree),
            other => Err(format!("unknown quantize method '{other}'")),
        }
    }
}

impl FromStr for Detail {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(Detail::Low),
            "medium" => Ok(Detail::Medium),
            "high" => Ok(Detail::High),
            "ultra" => Ok(Detail::Ultra),
            other => Err(format!("unknown detail level '{other}'")),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Auto => "auto",
            Mode::Photo => "photo",
            Mode::Logo => "logo",
            Mode::LineArt => "line_art",
            Mode::PixelArt => "pixel_art",
        };
        f.write_str(s)
    }
}
