/// Tiling module.
///
/// Lays a stack of frames out into grid images ("bundles"). A bundle holds
/// `tiles_per_file` frames in rows of `number_of_columns` tiles; frame `f`
/// lives in bundle `f / tiles_per_file`. The browser finds a frame inside a
/// bundle with the same arithmetic as `TileLayout::tile_top_left`.
use crate::error::{Error, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, RgbImage};
use ndarray::{Array3, ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileLayout {
    pub tile_width: u32,
    pub tile_height: u32,
    pub number_of_columns: u32,
    pub tiles_per_file: u32,
}

impl TileLayout {
    /// A layout is valid when every bundle is made of complete rows.
    pub fn new(
        tile_width: u32,
        tile_height: u32,
        number_of_columns: u32,
        tiles_per_file: u32,
    ) -> Result<TileLayout> {
        if number_of_columns == 0 || tiles_per_file == 0 {
            return Err(Error::Config(
                "tile columns and tiles per file must be positive".to_string(),
            ));
        }
        if tiles_per_file % number_of_columns != 0 {
            return Err(Error::Config(format!(
                "tiles per file ({}) must be a multiple of the column count ({})",
                tiles_per_file, number_of_columns
            )));
        }
        Ok(TileLayout {
            tile_width,
            tile_height,
            number_of_columns,
            tiles_per_file,
        })
    }

    /// Same grid shape, tiles sized for the given frames.
    pub fn for_frames(&self, tile_height: u32, tile_width: u32) -> Result<TileLayout> {
        TileLayout::new(
            tile_width,
            tile_height,
            self.number_of_columns,
            self.tiles_per_file,
        )
    }

    /// Pixel offset `(top, left)` of a frame's tile inside its bundle.
    pub fn tile_top_left(&self, frame: u32) -> (u32, u32) {
        let left = (frame % self.number_of_columns) * self.tile_width;
        let top = ((frame % self.tiles_per_file) / self.number_of_columns) * self.tile_height;
        (top, left)
    }

    pub fn bundle_index(&self, frame: u32) -> u32 {
        frame / self.tiles_per_file
    }

    pub fn bundle_count(&self, frames: u32) -> u32 {
        (frames + self.tiles_per_file - 1) / self.tiles_per_file
    }

    /// Frames `[start, stop)` held by a bundle of a stack with `frames` frames.
    pub fn bundle_frames(&self, bundle: u32, frames: u32) -> (u32, u32) {
        let start = (bundle * self.tiles_per_file).min(frames);
        let stop = ((bundle + 1) * self.tiles_per_file).min(frames);
        (start, stop)
    }

    /// `(width, height)` of a bundle image holding `count` frames.
    pub fn bundle_size(&self, count: u32) -> (u32, u32) {
        let rows = (count + self.number_of_columns - 1) / self.number_of_columns;
        (
            self.number_of_columns * self.tile_width,
            rows.max(1) * self.tile_height,
        )
    }
}

/// How labels are drawn on top of the grayscale frames.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum LabelOverlay {
    None,
    Fill { alpha: f64 },
    Outline,
}

impl LabelOverlay {
    pub fn from_name(name: &str, alpha: f64) -> LabelOverlay {
        match name.to_lowercase().as_str() {
            "fill" => LabelOverlay::Fill { alpha },
            "outline" => LabelOverlay::Outline,
            "none" => LabelOverlay::None,
            _ => {
                warn!("Unknown label overlay `{}`, drawing none", name);
                LabelOverlay::None
            }
        }
    }
}

/// Linearly rescale a stack to 0..=255 using its global min and max.
///
/// A constant (or empty) stack maps to all zeros. NaNs are treated as the
/// minimum.
pub fn normalize_to_u8(stack: ArrayView3<f64>) -> Array3<u8> {
    let (min, max) = stack
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;
    if !range.is_finite() || range <= 0.0 {
        return Array3::zeros(stack.raw_dim());
    }
    stack.mapv(|v| {
        if !v.is_finite() {
            return 0;
        }
        (((v - min) / range) * 255.0).round().max(0.0).min(255.0) as u8
    })
}

/// Palette used for label fills and outlines. Label `n` uses entry
/// `(n - 1) % len`.
const LABEL_PALETTE: [[u8; 3]; 12] = [
    [230, 25, 75],
    [60, 180, 75],
    [255, 225, 25],
    [0, 130, 200],
    [245, 130, 48],
    [145, 30, 180],
    [70, 240, 240],
    [240, 50, 230],
    [210, 245, 60],
    [250, 190, 212],
    [0, 128, 128],
    [170, 110, 40],
];

pub fn label_color(label: u32) -> [u8; 3] {
    if label == 0 {
        return [0, 0, 0];
    }
    LABEL_PALETTE[((label - 1) as usize) % LABEL_PALETTE.len()]
}

/// Is this pixel on the border of its label region (4-neighbourhood)?
fn is_outline(labels: &ArrayView2<u32>, row: usize, col: usize) -> bool {
    let label = labels[[row, col]];
    if label == 0 {
        return false;
    }
    let (rows, cols) = labels.dim();
    let neighbours = [
        (row.wrapping_sub(1), col),
        (row + 1, col),
        (row, col.wrapping_sub(1)),
        (row, col + 1),
    ];
    neighbours.iter().any(|&(r, c)| {
        if r >= rows || c >= cols {
            return true;
        }
        labels[[r, c]] != label
    })
}

/// Colorize one grayscale frame, optionally recoloring or outlining labels.
fn render_frame(
    frame: ArrayView2<u8>,
    labels: Option<ArrayView2<u32>>,
    overlay: LabelOverlay,
) -> Vec<[u8; 3]> {
    let (rows, cols) = frame.dim();
    let mut out = Vec::with_capacity(rows * cols);
    for row in 0..rows {
        for col in 0..cols {
            let gray = frame[[row, col]];
            let mut pixel = [gray, gray, gray];
            if let Some(labels) = labels.as_ref() {
                let label = labels[[row, col]];
                match overlay {
                    LabelOverlay::Fill { alpha } if label != 0 => {
                        let color = label_color(label);
                        for c in 0..3 {
                            let blended =
                                (1.0 - alpha) * gray as f64 + alpha * color[c] as f64;
                            pixel[c] = blended.round().max(0.0).min(255.0) as u8;
                        }
                    }
                    LabelOverlay::Outline if is_outline(labels, row, col) => {
                        pixel = label_color(label);
                    }
                    _ => (),
                }
            }
            out.push(pixel);
        }
    }
    out
}

/// Render one bundle of a normalized stack into an RGB grid image.
///
/// # Arguments
///
/// * `frames` - Normalized stack, `(frames, height, width)`
/// * `labels` - Optional label stack of the same shape
/// * `layout` - Grid layout; tile size must match the frames
/// * `bundle` - Which bundle to render
/// * `overlay` - How to draw the labels
///
pub fn render_bundle(
    frames: ArrayView3<u8>,
    labels: Option<ArrayView3<u32>>,
    layout: &TileLayout,
    bundle: u32,
    overlay: LabelOverlay,
) -> Result<RgbImage> {
    let (count, height, width) = frames.dim();
    if height != layout.tile_height as usize || width != layout.tile_width as usize {
        return Err(Error::BadRequest(format!(
            "frames are {}x{} but tiles are {}x{}",
            height, width, layout.tile_height, layout.tile_width
        )));
    }
    if let Some(labels) = labels.as_ref() {
        if labels.dim() != frames.dim() {
            return Err(Error::BadRequest(format!(
                "label stack {:?} doesn't match image stack {:?}",
                labels.dim(),
                frames.dim()
            )));
        }
    }
    let (start, stop) = layout.bundle_frames(bundle, count as u32);
    if start >= stop {
        return Err(Error::NotFound(format!("bundle {}", bundle)));
    }

    let (bundle_width, bundle_height) = layout.bundle_size(stop - start);
    let mut img = RgbImage::new(bundle_width, bundle_height);

    for frame in start..stop {
        let (top, left) = layout.tile_top_left(frame);
        let frame_labels = labels
            .as_ref()
            .map(|l| l.index_axis(Axis(0), frame as usize));
        let pixels = render_frame(
            frames.index_axis(Axis(0), frame as usize),
            frame_labels,
            overlay,
        );
        for (i, pixel) in pixels.into_iter().enumerate() {
            let x = left + (i % width) as u32;
            let y = top + (i / width) as u32;
            img.put_pixel(x, y, image::Rgb(pixel));
        }
    }
    Ok(img)
}

/// Encode an image as JPEG, carrying the layout JSON in a COM segment.
pub fn encode_jpeg(img: &RgbImage, layout: &TileLayout, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode(
        img.as_raw(),
        img.width(),
        img.height(),
        ColorType::Rgb8,
    )?;

    let comment = serde_json::to_vec(layout)?;
    let length = comment.len() + 2;
    if length > u16::MAX as usize || buf.len() < 2 {
        return Ok(buf);
    }
    // COM goes after SOI and the JFIF APP0 segment, which must come first.
    let at = match segment_at(&buf, 2) {
        Some((0xE0, _, end)) => end,
        _ => 2,
    };
    let mut segment = vec![0xFF, 0xFE, (length >> 8) as u8, (length & 0xFF) as u8];
    segment.extend_from_slice(&comment);
    buf.splice(at..at, segment);
    Ok(buf)
}

/// The marker segment starting at `at`: (marker, payload, end offset).
fn segment_at(jpeg: &[u8], at: usize) -> Option<(u8, &[u8], usize)> {
    if *jpeg.get(at)? != 0xFF {
        return None;
    }
    let marker = *jpeg.get(at + 1)?;
    let length = ((*jpeg.get(at + 2)? as usize) << 8) | *jpeg.get(at + 3)? as usize;
    if length < 2 {
        return None;
    }
    let end = at + 2 + length;
    Some((marker, jpeg.get(at + 4..end)?, end))
}

/// Pull the layout back out of a JPEG produced by `encode_jpeg`.
pub fn jpeg_comment(jpeg: &[u8]) -> Option<TileLayout> {
    let mut at = 2;
    // Header segments only: stop at start of scan.
    while let Some((marker, payload, end)) = segment_at(jpeg, at) {
        match marker {
            0xFE => return serde_json::from_slice(payload).ok(),
            0xDA => return None,
            _ => at = end,
        }
    }
    None
}

/// Encode an image as PNG with the layout (and frame range) in tEXt chunks.
pub fn encode_png(img: &RgbImage, layout: &TileLayout, frames: (u32, u32)) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut buf, img.width(), img.height());
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.add_text_chunk("tileWidth".to_string(), layout.tile_width.to_string())?;
        encoder.add_text_chunk("tileHeight".to_string(), layout.tile_height.to_string())?;
        encoder.add_text_chunk(
            "numberOfColumns".to_string(),
            layout.number_of_columns.to_string(),
        )?;
        encoder.add_text_chunk("tilesPerFile".to_string(), layout.tiles_per_file.to_string())?;
        encoder.add_text_chunk("frames".to_string(), format!("{}:{}", frames.0, frames.1))?;
        let mut writer = encoder.write_header()?;
        writer.write_image_data(img.as_raw())?;
        writer.finish()?;
    }
    Ok(buf)
}
