/// Label module.
///
/// Finds labeled regions in segmentation frames, computes their centroids,
/// and gives every tracked-cell measurement the label of the closest region
/// in its frame.
use crate::error::{Error, Result};
use crate::pb;
use crate::tiler::TileLayout;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use prost::Message;
use std::collections::{BTreeMap, VecDeque};

/// Centroid of one labeled region in one frame.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Centroid {
    pub label: u32,
    /// Mean column.
    pub x: f64,
    /// Mean row.
    pub y: f64,
    /// Number of pixels.
    pub area: u64,
}

/// 4-connected component labelling of the nonzero pixels of `mask`.
///
/// Components are numbered 1..=count in the order a raster scan first hits
/// them. Returns the label image and the component count.
pub fn label_connected(mask: ArrayView2<u32>) -> (Array2<u32>, u32) {
    let (rows, cols) = mask.dim();
    let mut labels = Array2::<u32>::zeros((rows, cols));
    let mut count = 0;
    let mut queue = VecDeque::new();

    for row in 0..rows {
        for col in 0..cols {
            if mask[[row, col]] == 0 || labels[[row, col]] != 0 {
                continue;
            }
            count += 1;
            labels[[row, col]] = count;
            queue.push_back((row, col));
            while let Some((r, c)) = queue.pop_front() {
                let neighbours = [
                    (r.wrapping_sub(1), c),
                    (r + 1, c),
                    (r, c.wrapping_sub(1)),
                    (r, c + 1),
                ];
                for &(nr, nc) in neighbours.iter() {
                    if nr < rows && nc < cols && mask[[nr, nc]] != 0 && labels[[nr, nc]] == 0 {
                        labels[[nr, nc]] = count;
                        queue.push_back((nr, nc));
                    }
                }
            }
        }
    }
    (labels, count)
}

/// Centroids of every nonzero label in a frame, ordered by label.
pub fn frame_centroids(labels: ArrayView2<u32>) -> Vec<Centroid> {
    // label -> (sum x, sum y, area)
    let mut sums: BTreeMap<u32, (f64, f64, u64)> = BTreeMap::new();
    for ((row, col), &label) in labels.indexed_iter() {
        if label == 0 {
            continue;
        }
        let entry = sums.entry(label).or_insert((0.0, 0.0, 0));
        entry.0 += col as f64;
        entry.1 += row as f64;
        entry.2 += 1;
    }
    sums.into_iter()
        .map(|(label, (sx, sy, area))| Centroid {
            label,
            x: sx / area as f64,
            y: sy / area as f64,
            area,
        })
        .collect()
}

/// A frame holding nothing but zeros and ones is a mask, not a label image.
fn is_mask(frame: &ArrayView2<u32>) -> bool {
    frame.iter().all(|&v| v <= 1)
}

/// Turn every mask frame of a stack into a connected-component label frame.
/// Frames that already carry labels are left alone.
pub fn resolve_labels(stack: ArrayView3<u32>) -> Array3<u32> {
    let mut out = stack.to_owned();
    for mut frame in out.axis_iter_mut(Axis(0)) {
        if is_mask(&frame.view()) {
            let (labeled, _) = label_connected(frame.view());
            frame.assign(&labeled);
        }
    }
    out
}

/// Per-frame centroids of a label stack `(frames, height, width)`.
pub fn stack_centroids(stack: ArrayView3<u32>) -> Vec<Vec<Centroid>> {
    stack
        .axis_iter(Axis(0))
        .map(|frame| {
            if is_mask(&frame) {
                let (labeled, _) = label_connected(frame);
                frame_centroids(labeled.view())
            } else {
                frame_centroids(frame)
            }
        })
        .collect()
}

/// Convert a float matrix coming out of MATLAB into a label stack.
pub fn to_label_stack(stack: ArrayView3<f64>) -> Array3<u32> {
    stack.mapv(|v| if v.is_finite() && v > 0.0 { v.round() as u32 } else { 0 })
}

/// One tracked-cell measurement: position and frame as stored in the table.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Measurement {
    pub x: f64,
    pub y: f64,
    pub frame: f64,
}

/// How table coordinates map onto label-stack indices.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CoordinateMapping {
    /// Frame ids count from 1 (MATLAB).
    pub one_based_frames: bool,
    /// x/y count pixels from 1 (MATLAB).
    pub one_based_pixels: bool,
}

impl Default for CoordinateMapping {
    fn default() -> Self {
        CoordinateMapping {
            one_based_frames: true,
            one_based_pixels: true,
        }
    }
}

impl CoordinateMapping {
    /// Map a measurement to `(frame index, x, y)` in label-stack space.
    pub fn remap(&self, m: &Measurement) -> Option<(usize, f64, f64)> {
        if !m.frame.is_finite() || !m.x.is_finite() || !m.y.is_finite() {
            return None;
        }
        let frame = m.frame.round() - if self.one_based_frames { 1.0 } else { 0.0 };
        if frame < 0.0 {
            return None;
        }
        let shift = if self.one_based_pixels { 1.0 } else { 0.0 };
        Some((frame as usize, m.x - shift, m.y - shift))
    }
}

/// Give each measurement the label of the nearest centroid in its frame.
///
/// Nearest is squared Euclidean distance; on ties the lower label wins.
/// Measurements whose frame is out of range, or whose frame has no labeled
/// regions, get label 0.
pub fn assign_labels(
    measurements: &[Measurement],
    centroids: &[Vec<Centroid>],
    mapping: CoordinateMapping,
) -> Vec<u32> {
    measurements
        .iter()
        .map(|m| {
            let (frame, x, y) = match mapping.remap(m) {
                Some(v) => v,
                None => return 0,
            };
            let candidates = match centroids.get(frame) {
                Some(c) => c,
                None => return 0,
            };
            let mut best: Option<(f64, u32)> = None;
            for c in candidates {
                let d = (c.x - x).powi(2) + (c.y - y).powi(2);
                best = match best {
                    Some((bd, bl)) if bd < d || (bd == d && bl <= c.label) => Some((bd, bl)),
                    _ => Some((d, c.label)),
                };
            }
            best.map(|(_, label)| label).unwrap_or(0)
        })
        .collect()
}

/// Run-length encode a frame in raster order.
fn run_length(frame: ArrayView2<u32>, index: u32) -> pb::LabelFrame {
    let mut run_labels: Vec<u32> = Vec::new();
    let mut run_lengths: Vec<u32> = Vec::new();
    for &label in frame.iter() {
        if run_labels.last() == Some(&label) {
            if let Some(len) = run_lengths.last_mut() {
                *len += 1;
            }
        } else {
            run_labels.push(label);
            run_lengths.push(1);
        }
    }
    pb::LabelFrame {
        frame: index,
        run_labels,
        run_lengths,
    }
}

/// Expand a run-length encoded frame back to a flat raster.
pub fn expand_runs(frame: &pb::LabelFrame) -> Vec<u32> {
    frame
        .run_labels
        .iter()
        .zip(frame.run_lengths.iter())
        .flat_map(|(&label, &len)| std::iter::repeat(label).take(len as usize))
        .collect()
}

/// Encode a label stack as one protobuf blob per bundle.
pub fn encode_label_bundles(stack: ArrayView3<u32>, layout: &TileLayout) -> Vec<Vec<u8>> {
    let frames = stack.len_of(Axis(0)) as u32;
    (0..layout.bundle_count(frames))
        .map(|bundle| {
            let (start, stop) = layout.bundle_frames(bundle, frames);
            let message = pb::LabelBundle {
                tile_width: layout.tile_width,
                tile_height: layout.tile_height,
                frames: (start..stop)
                    .map(|f| run_length(stack.index_axis(Axis(0), f as usize), f))
                    .collect(),
            };
            message.encode_to_vec()
        })
        .collect()
}

/// Rebuild a label stack from its bundles. The bundles together must hold
/// frames `0..n` without gaps.
pub fn decode_label_bundles(bundles: &[Vec<u8>]) -> Result<Array3<u32>> {
    let mut frames: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    let (mut width, mut height) = (0, 0);
    for bytes in bundles {
        let bundle = pb::LabelBundle::decode(bytes.as_slice())?;
        width = bundle.tile_width as usize;
        height = bundle.tile_height as usize;
        for frame in &bundle.frames {
            frames.insert(frame.frame, expand_runs(frame));
        }
    }
    let count = frames.len();
    if let Some((&last, _)) = frames.iter().next_back() {
        if last as usize + 1 != count {
            return Err(Error::BadRequest(format!(
                "label bundles hold {} frames up to frame {}",
                count, last
            )));
        }
    }
    let data: Vec<u32> = frames.into_iter().flat_map(|(_, raster)| raster).collect();
    Ok(Array3::from_shape_vec((count, height, width), data)?)
}
