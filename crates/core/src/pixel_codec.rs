//! Conversion between flat pixel records and square RGB rasters.
//!
//! Pixel index `i` lives at raster coordinate `(i mod side, side - 1 - i div
//! side)`: origin at the bottom-left, X varies fastest, Y grows upward. The
//! engine exports its grid in that order, while image rows are stored
//! top-down, so both directions flip Y.

use image::{DynamicImage, Rgb, RgbImage};
use serde_json::{Map, Value};
use thiserror::Error;

pub type Color = [f64; 3];

const BLACK: Color = [0.0, 0.0, 0.0];

/// Largest raster side accepted from a pixel document.
pub const MAX_SIDE: u32 = 2048;
/// Index-map entries at or beyond this index are dropped.
pub const MAX_PIXELS: u64 = MAX_SIDE as u64 * MAX_SIDE as u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("total_prims {0} is not a perfect square")]
    NotPerfectSquare(u64),

    #[error("cannot build an empty raster (total_prims = 0)")]
    Empty,

    #[error("raster side {0} exceeds the supported size")]
    TooLarge(u64),

    #[error(
        "cannot infer dimensions: neither total_prims ({total_prims:?}) nor pixel count ({pixel_count}) is a perfect square"
    )]
    UnknownDimensions {
        total_prims: Option<u64>,
        pixel_count: usize,
    },

    #[error("invalid pixel document: {0}")]
    InvalidDocument(String),
}

/// Builds a `side x side` raster from `pixels`, where `side² == total_prims`.
///
/// Pixels beyond `total_prims` are ignored and missing ones stay black.
pub fn encode(pixels: &[Color], total_prims: u64) -> Result<RgbImage, CodecError> {
    let side = perfect_square_side(total_prims)?;
    let capacity = side as usize * side as usize;

    let mut raster = RgbImage::new(side, side);
    for (index, color) in pixels.iter().take(capacity).enumerate() {
        let (x, y) = raster_coordinate(index, side);
        raster.put_pixel(x, y, Rgb(color.map(to_channel)));
    }
    Ok(raster)
}

/// Exact inverse of [`encode`]: returns the pixels in index order together
/// with their count.
pub fn decode(raster: &RgbImage) -> (Vec<Color>, u64) {
    let (width, height) = raster.dimensions();
    let mut pixels = Vec::with_capacity(width as usize * height as usize);

    for y in (0..height).rev() {
        for x in 0..width {
            let Rgb(channels) = *raster.get_pixel(x, y);
            pixels.push(channels.map(from_channel));
        }
    }

    let total = pixels.len() as u64;
    (pixels, total)
}

/// Decodes any supported image, dropping alpha.
pub fn decode_dynamic(image: &DynamicImage) -> (Vec<Color>, u64) {
    decode(&image.to_rgb8())
}

pub fn raster_coordinate(index: usize, side: u32) -> (u32, u32) {
    let side = side as usize;
    let x = index % side;
    let y = side - 1 - index / side;
    (x as u32, y as u32)
}

pub fn perfect_square_side(total_prims: u64) -> Result<u32, CodecError> {
    if total_prims == 0 {
        return Err(CodecError::Empty);
    }
    let side = integer_sqrt(total_prims).ok_or(CodecError::NotPerfectSquare(total_prims))?;
    match u32::try_from(side) {
        Ok(side) if side <= MAX_SIDE => Ok(side),
        _ => Err(CodecError::TooLarge(side)),
    }
}

fn integer_sqrt(value: u64) -> Option<u64> {
    let guess = (value as f64).sqrt().round() as u64;
    // Float rounding can land one off for very large inputs.
    [guess.saturating_sub(1), guess, guess + 1]
        .into_iter()
        .find(|candidate| candidate.checked_mul(*candidate) == Some(value))
}

fn to_channel(component: f64) -> u8 {
    (component.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn from_channel(channel: u8) -> f64 {
    f64::from(channel) / 255.0
}

/// The on-disk pixel record exchanged with the engine.
///
/// Accepts `pixels` either as a list `[[r,g,b], ...]` or as an index map
/// `{"0": [r,g,b], ...}`; `total_prims` may sit at the top level or under
/// `metadata`. A bare index map with no `pixels` key is accepted as well.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelDocument {
    pub pixels: Vec<Color>,
    pub total_prims: Option<u64>,
}

impl PixelDocument {
    pub fn from_value(value: &Value) -> Result<Self, CodecError> {
        let object = value
            .as_object()
            .ok_or_else(|| CodecError::InvalidDocument("expected a JSON object".to_string()))?;

        let total_prims = object
            .get("total_prims")
            .or_else(|| object.get("metadata").and_then(|m| m.get("total_prims")))
            .and_then(parse_count);
        let limit = total_prims
            .filter(|total| *total > 0)
            .map_or(MAX_PIXELS, |total| total.min(MAX_PIXELS));

        let pixels = match object.get("pixels") {
            Some(raw) => normalize_pixels(raw, limit),
            None if !object.is_empty() && object.keys().all(|k| k.parse::<u64>().is_ok()) => {
                normalize_pixels(value, limit)
            }
            None => Vec::new(),
        };

        Ok(Self {
            pixels,
            total_prims,
        })
    }

    /// Side length from `total_prims` when it is a usable perfect square,
    /// falling back to the pixel count. An oversized `total_prims` is an
    /// error, not a fallback.
    pub fn side(&self) -> Result<u32, CodecError> {
        if let Some(total) = self.total_prims.filter(|total| *total > 0) {
            match perfect_square_side(total) {
                Ok(side) => return Ok(side),
                Err(too_large @ CodecError::TooLarge(_)) => return Err(too_large),
                Err(_) => {}
            }
        }

        let count = self.pixels.len() as u64;
        if count > 0 {
            if let Ok(side) = perfect_square_side(count) {
                return Ok(side);
            }
        }

        Err(CodecError::UnknownDimensions {
            total_prims: self.total_prims,
            pixel_count: self.pixels.len(),
        })
    }

    pub fn to_raster(&self) -> Result<RgbImage, CodecError> {
        let side = u64::from(self.side()?);
        encode(&self.pixels, side * side)
    }
}

/// Index maps are sparse; entries at or past `limit` are dropped so the
/// dense vector never outgrows the raster it feeds.
fn normalize_pixels(raw: &Value, limit: u64) -> Vec<Color> {
    match raw {
        Value::Array(items) => items.iter().map(parse_color).collect(),
        Value::Object(map) => {
            let mut indexed: Vec<(usize, Color)> = map
                .iter()
                .filter_map(|(key, value)| {
                    let index = key.parse::<u64>().ok().filter(|index| *index < limit)?;
                    Some((usize::try_from(index).ok()?, parse_color(value)))
                })
                .collect();
            let Some(max_index) = indexed.iter().map(|(index, _)| *index).max() else {
                return Vec::new();
            };
            indexed.sort_unstable_by_key(|(index, _)| *index);

            let mut pixels = vec![BLACK; max_index + 1];
            for (index, color) in indexed {
                pixels[index] = color;
            }
            pixels
        }
        _ => Vec::new(),
    }
}

fn parse_color(value: &Value) -> Color {
    let Some(items) = value.as_array() else {
        return BLACK;
    };
    if items.len() < 3 {
        return BLACK;
    }
    let mut color = BLACK;
    for (slot, item) in color.iter_mut().zip(items) {
        *slot = item.as_f64().unwrap_or(0.0);
    }
    color
}

fn parse_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `{"0": [r,g,b], "1": ...}` in index order.
pub fn pixel_map(pixels: &[Color]) -> Map<String, Value> {
    pixels
        .iter()
        .enumerate()
        .map(|(index, color)| (index.to_string(), serde_json::json!(color)))
        .collect()
}

pub fn metadata_document(pixels: &[Color], width: u32, height: u32, source_image: &str) -> Value {
    serde_json::json!({
        "metadata": {
            "total_prims": pixels.len(),
            "total_points": pixels.len(),
            "source_image": source_image,
            "width": width,
            "height": height,
        },
        "pixels": pixel_map(pixels),
    })
}
