use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rastervec::{vectorize, vectorize_with_progress, Detail, Mode, QuantizeMethod, Settings};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input raster image (PNG, JPEG, BMP, TIFF, WebP, GIF).
    input: PathBuf,

    /// Output SVG path. Defaults to the input path with an .svg extension.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Vectorization mode: auto, photo, logo, line_art, pixel_art.
    #[arg(long, default_value = "auto")]
    mode: Mode,

    /// Target palette size, 2-64 (0 = auto-select).
    #[arg(long, default_value_t = 16)]
    colors: u32,

    /// Palette algorithm: kmeans, median_cut, octree.
    #[arg(long, default_value = "kmeans")]
    method: QuantizeMethod,

    /// Outline fidelity: low, medium, high, ultra.
    #[arg(long, default_value = "medium")]
    detail: Detail,

    /// Emit straight line segments instead of smoothed Bézier curves.
    #[arg(long)]
    no_smooth: bool,

    /// Skip the adaptive preprocessor (upscale, denoise, CLAHE, sharpen).
    #[arg(long)]
    no_preprocess: bool,

    /// Background fill as a hex color, or "none".
    #[arg(long, default_value = "none")]
    background: String,

    /// Discard traced contours enclosing less than this area in px².
    #[arg(long, default_value_t = 4)]
    min_area: u32,

    /// Skip the SVG optimizer and keep the raw assembled document.
    #[arg(long)]
    no_optimize: bool,

    /// Print progress at each pipeline stage boundary.
    #[arg(short, long)]
    progress: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let bytes = fs::read(&args.input)
        .with_context(|| format!("cannot read {}", args.input.display()))?;

    let preprocess = !args.no_preprocess;
    let settings = Settings {
        mode: args.mode,
        n_colors: args.colors,
        quantize_method: args.method,
        detail: args.detail,
        smooth: !args.no_smooth,
        upscale: preprocess,
        denoise: preprocess,
        bilateral: preprocess,
        clahe: preprocess,
        sharpen: preprocess,
        background: args.background.clone(),
        optimize: !args.no_optimize,
        min_area: args.min_area,
        ..Settings::default()
    };

    let result = if args.progress {
        vectorize_with_progress(&bytes, &settings, |pct, stage| {
            eprintln!("[{pct:>3}%] {stage}");
        })?
    } else {
        vectorize(&bytes, &settings)?
    };

    let output = args
        .output
        .unwrap_or_else(|| args.input.with_extension("svg"));
    fs::write(&output, result.svg.as_bytes())
        .with_context(|| format!("cannot write {}", output.display()))?;

    println!(
        "{} -> {} ({} colors, {}x{}, {} bytes)",
        args.input.display(),
        output.display(),
        result.palette.len(),
        result.width,
        result.height,
        result.svg.len(),
    );
    Ok(())
}
