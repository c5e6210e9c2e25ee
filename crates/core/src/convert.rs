//! File-level pixel conversions: the JSON→PNG post stage that follows room
//! generation, and the PNG→JSON pre stage that precedes regeneration.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::layout;
use crate::log_store::CommitGate;
use crate::pixel_codec::{self, PixelDocument};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of one JSON→PNG conversion, embedded in `post.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RasterReport {
    pub ok: bool,
    pub uuid: String,
    pub path_json: String,
    pub path_png: String,
    pub exists: bool,
    pub width: u32,
    pub height: u32,
    pub pixels_written: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelJsonFormat {
    /// Only the `{"0": [r,g,b], ...}` map.
    Simple,
    /// Map plus `metadata` with dimensions and source file.
    #[default]
    Metadata,
}

/// Waits up to `wait` for `export/serve/<uuid>.json`, then renders it to
/// `export/serve/<uuid>.png` through `gate`. Never fails; problems land in
/// `error`. Waiting stops early once the gate is closed.
pub fn json_to_png(base: &Path, uuid: &str, wait: Duration, gate: &CommitGate) -> RasterReport {
    let path_json = layout::pixel_json_path(base, uuid);
    let path_png = layout::raster_path(base, uuid);

    let mut report = RasterReport {
        uuid: uuid.to_string(),
        path_json: path_json.display().to_string(),
        path_png: path_png.display().to_string(),
        ..RasterReport::default()
    };

    if !wait_for_file(&path_json, wait, gate) {
        report.error = Some(format!(
            "pixel file not found after waiting {:.1}s: {}",
            wait.as_secs_f64(),
            path_json.display()
        ));
        return report;
    }
    report.exists = true;

    match render_pixel_file(&path_json, &path_png, gate) {
        Ok((width, height, pixels_written)) => {
            report.ok = true;
            report.width = width;
            report.height = height;
            report.pixels_written = pixels_written;
            info!(uuid, width, height, pixels_written, "pixel raster written");
        }
        Err(e) => report.error = Some(format!("{e:#}")),
    }
    report
}

fn wait_for_file(path: &Path, wait: Duration, gate: &CommitGate) -> bool {
    let deadline = Instant::now() + wait;
    loop {
        if path.is_file() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline || gate.is_closed() {
            return false;
        }
        debug!(path = %path.display(), "waiting for pixel file");
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

fn render_pixel_file(
    path_json: &Path,
    path_png: &Path,
    gate: &CommitGate,
) -> Result<(u32, u32, usize)> {
    let raw = fs::read(path_json)
        .with_context(|| format!("failed to read pixel file: {}", path_json.display()))?;
    let value: Value = serde_json::from_slice(&raw)
        .with_context(|| format!("invalid JSON in pixel file: {}", path_json.display()))?;
    let document = PixelDocument::from_value(&value)?;
    let raster = document.to_raster()?;

    let (width, height) = raster.dimensions();
    let pixels_written = document.pixels.len().min(width as usize * height as usize);
    gate.commit(path_png, &encode_png(&raster)?)?;
    Ok((width, height, pixels_written))
}

pub fn encode_png(raster: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    raster
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(buf)
}

pub fn decode_image_bytes(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).context("decode image from memory")
}

/// Summary of a PNG→JSON conversion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PixelExport {
    pub output: PathBuf,
    pub width: u32,
    pub height: u32,
    pub pixel_count: usize,
}

/// Decodes `input` and writes its pixels as JSON through `gate`. The output
/// defaults to `input` with a `.json` extension.
pub fn png_to_json(
    input: &Path,
    output: Option<&Path>,
    format: PixelJsonFormat,
    gate: &CommitGate,
) -> Result<PixelExport> {
    let bytes =
        fs::read(input).with_context(|| format!("failed to read image: {}", input.display()))?;
    let image = decode_image_bytes(&bytes)
        .with_context(|| format!("failed to decode image: {}", input.display()))?;
    let (width, height) = (image.width(), image.height());
    let (pixels, _) = pixel_codec::decode_dynamic(&image);

    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| input.with_extension("json"));
    let document = match format {
        PixelJsonFormat::Simple => Value::Object(pixel_codec::pixel_map(&pixels)),
        PixelJsonFormat::Metadata => {
            let source = input
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            pixel_codec::metadata_document(&pixels, width, height, &source)
        }
    };
    gate.commit_json(&output, &document)?;

    debug!(
        input = %input.display(),
        output = %output.display(),
        width,
        height,
        "pixel JSON written"
    );
    Ok(PixelExport {
        output,
        width,
        height,
        pixel_count: pixels.len(),
    })
}
