//! Chamfer distance transform.
//!
//! Every non-zero pixel of an 8-bit mask receives its distance to the nearest
//! zero pixel, measured along paths of 3x3 or 5x5 neighbourhood moves with
//! per-move weights. Two raster passes over a padded fixed-point buffer
//! compute it: a forward pass over the already-visited half of the
//! neighbourhood and a backward pass over the other half.
//!
//! The labeled variant additionally carries, for every pixel, the label of
//! the seed region its distance was propagated from.

use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::image::{FloatImage, GrayImage, Image, LabelImage};

/// Fractional bits of the fixed-point distances.
pub const DIST_SHIFT: u32 = 16;
/// Fixed-point distance of pixels no seed reaches. Relaxation saturates, so
/// the border and unreached pixels never win a comparison.
pub const INIT_DIST: i32 = i32::MAX;

const FIXED_ONE: f64 = (1u32 << DIST_SHIFT) as f64;
const FIXED_SCALE: f32 = 1.0 / (1u32 << DIST_SHIFT) as f32;

/// Neighbourhood size of the propagation mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaskSize {
    Mask3x3,
    Mask5x5,
}

impl MaskSize {
    /// Map an aperture (3 or 5) to a mask size.
    pub fn from_aperture(aperture: u32) -> Result<Self> {
        match aperture {
            3 => Ok(Self::Mask3x3),
            5 => Ok(Self::Mask5x5),
            other => Err(Error::config(format!(
                "mask size should be 3 or 5, got {}",
                other
            ))),
        }
    }

    pub fn radius(&self) -> usize {
        match self {
            Self::Mask3x3 => 1,
            Self::Mask5x5 => 2,
        }
    }

    /// Distinct move weights: horizontal/vertical, diagonal, and for 5x5 the
    /// knight move.
    pub fn weight_count(&self) -> usize {
        self.radius() + 1
    }
}

/// Move weights used for propagation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Chessboard distance.
    Chebyshev,
    /// City-block distance.
    Manhattan,
    /// Chamfer approximation of the Euclidean distance.
    Euclidean,
    /// Caller-supplied weights: `[hv, diag]` or `[hv, diag, knight]`.
    Custom(Vec<f32>),
}

impl DistanceMetric {
    /// Floating-point move weights for `mask`, validated.
    pub fn weights(&self, mask: MaskSize) -> Result<Vec<f32>> {
        let weights = match (self, mask) {
            (Self::Chebyshev, MaskSize::Mask3x3) => vec![1.0, 1.0],
            (Self::Manhattan, MaskSize::Mask3x3) => vec![1.0, 2.0],
            (Self::Euclidean, MaskSize::Mask3x3) => vec![0.955, 1.3693],
            (Self::Chebyshev, MaskSize::Mask5x5) => vec![1.0, 1.0, 2.0],
            (Self::Manhattan, MaskSize::Mask5x5) => vec![1.0, 2.0, 3.0],
            (Self::Euclidean, MaskSize::Mask5x5) => vec![1.0, 1.4, 2.1969],
            (Self::Custom(w), mask) => {
                let needed = mask.weight_count();
                if w.len() < needed {
                    return Err(Error::config(format!(
                        "{:?} needs {} custom weights, got {}",
                        mask,
                        needed,
                        w.len()
                    )));
                }
                let w = w[..needed].to_vec();
                if let Some(bad) = w.iter().find(|v| !(v.is_finite() && **v > 0.0)) {
                    return Err(Error::config(format!(
                        "custom weights must be finite and positive, got {}",
                        bad
                    )));
                }
                check_two_pass(&w)?;
                w
            }
        };
        Ok(weights)
    }
}

/// Two raster passes reproduce the weighted-path distance only when a
/// shortest path never needs to turn back on itself: the diagonal may not
/// undercut the straight move, and for 5x5 two knight moves may not undercut
/// four straight moves nor a straight plus a knight move undercut a diagonal.
fn check_two_pass(weights: &[f32]) -> Result<()> {
    let f = FixedWeights::new(weights);
    let (hv, diag, long) = (f.hv as i64, f.diag as i64, f.long as i64);
    let ok = hv <= diag && (weights.len() < 3 || (2 * hv <= long && diag <= hv + long));
    if !ok {
        return Err(Error::config(format!(
            "custom weights {:?} need hv <= diag (and 2*hv <= knight, diag <= hv + knight for 5x5)",
            weights
        )));
    }
    Ok(())
}

/// Options for [`distance_transform`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceParams {
    pub metric: DistanceMetric,
    pub mask_size: MaskSize,
    /// Also label every pixel with its nearest zero region. Needs a 5x5 mask.
    pub labels: bool,
}

impl Default for DistanceParams {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::Euclidean,
            mask_size: MaskSize::Mask3x3,
            labels: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DistanceOutput {
    pub distances: FloatImage,
    pub labels: Option<LabelImage>,
}

/// Fixed-point move weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FixedWeights {
    hv: i32,
    diag: i32,
    long: i32,
}

impl FixedWeights {
    fn new(weights: &[f32]) -> Self {
        let fix = |w: f32| (w as f64 * FIXED_ONE).round() as i32;
        Self {
            hv: fix(weights[0]),
            diag: fix(weights[1]),
            long: weights.get(2).copied().map(fix).unwrap_or(0),
        }
    }

    /// Cheapest move; a pixel at or below it can not be improved.
    fn min(&self, mask: MaskSize) -> i32 {
        let min = self.hv.min(self.diag);
        match mask {
            MaskSize::Mask3x3 => min,
            MaskSize::Mask5x5 => min.min(self.long),
        }
    }

    /// Already-visited neighbours in raster order, as (dx, dy, weight). The
    /// backward pass uses the same list mirrored.
    fn causal(&self, mask: MaskSize) -> Vec<(isize, isize, i32)> {
        let mut moves = Vec::with_capacity(8);
        if mask == MaskSize::Mask5x5 {
            moves.extend([(-1, -2, self.long), (1, -2, self.long), (-2, -1, self.long)]);
        }
        moves.extend([(-1, -1, self.diag), (0, -1, self.hv), (1, -1, self.diag)]);
        if mask == MaskSize::Mask5x5 {
            moves.push((2, -1, self.long));
        }
        moves.push((-1, 0, self.hv));
        moves
    }
}

/// Padded working buffers of one transform call.
struct Propagation {
    border: usize,
    stride: usize,
    width: usize,
    height: usize,
    dist: Vec<i32>,
    labels: Option<Vec<i32>>,
}

impl Propagation {
    fn new(width: usize, height: usize, border: usize, seeds: Option<&LabelImage>) -> Self {
        let stride = width + 2 * border;
        let rows = height + 2 * border;
        let labels = seeds.map(|seeds| {
            let mut padded = vec![0; stride * rows];
            for y in 0..height {
                let start = (y + border) * stride + border;
                padded[start..start + width].copy_from_slice(seeds.row(y as u32));
            }
            padded
        });
        Self {
            border,
            stride,
            width,
            height,
            dist: vec![INIT_DIST; stride * rows],
            labels,
        }
    }

    #[inline]
    fn index(&self, x: usize, y: usize) -> usize {
        (y + self.border) * self.stride + x + self.border
    }

    fn offsets(&self, moves: &[(isize, isize, i32)]) -> Vec<(isize, i32)> {
        moves
            .iter()
            .map(|&(dx, dy, w)| (dy * self.stride as isize + dx, w))
            .collect()
    }

    fn forward(&mut self, mask: &GrayImage, moves: &[(isize, isize, i32)]) {
        let offsets = self.offsets(moves);

        for y in 0..self.height {
            let row = mask.row(y as u32);
            for (x, &px) in row.iter().enumerate() {
                let p = self.index(x, y);
                if px == 0 {
                    self.dist[p] = 0;
                    continue;
                }

                let mut best = INIT_DIST;
                let mut from = None;
                for &(off, w) in &offsets {
                    let q = (p as isize + off) as usize;
                    let t = self.dist[q].saturating_add(w);
                    if t < best {
                        best = t;
                        from = Some(q);
                    }
                }
                self.dist[p] = best;
                if let Some(labels) = self.labels.as_mut() {
                    let label = from.map_or(0, |q| labels[q]);
                    labels[p] = label;
                }
            }
        }
    }

    fn backward(&mut self, min_weight: i32, moves: &[(isize, isize, i32)], out: &mut FloatImage) {
        let mirrored: Vec<_> = moves.iter().map(|&(dx, dy, w)| (-dx, -dy, w)).collect();
        let offsets = self.offsets(&mirrored);

        for y in (0..self.height).rev() {
            for x in (0..self.width).rev() {
                let p = self.index(x, y);
                let mut best = self.dist[p];
                if best > min_weight {
                    let mut from = None;
                    for &(off, w) in &offsets {
                        let q = (p as isize + off) as usize;
                        let t = self.dist[q].saturating_add(w);
                        if t < best {
                            best = t;
                            from = Some(q);
                        }
                    }
                    self.dist[p] = best;
                    if let (Some(labels), Some(q)) = (self.labels.as_mut(), from) {
                        labels[p] = labels[q];
                    }
                }
                out.set(x as u32, y as u32, best as f32 * FIXED_SCALE);
            }
        }
    }

    fn write_labels(&self, out: &mut LabelImage) {
        if let Some(labels) = &self.labels {
            for y in 0..self.height {
                let start = self.index(0, y);
                out.row_mut(y as u32)
                    .copy_from_slice(&labels[start..start + self.width]);
            }
        }
    }
}

fn check_size<T>(what: &str, mask: &GrayImage, other: &Image<T>) -> Result<()>
where
    T: Copy + Default,
{
    if mask.dimensions() != other.dimensions() {
        return Err(Error::config(format!(
            "{} is {}x{}, mask is {}x{}",
            what,
            other.width(),
            other.height(),
            mask.width(),
            mask.height()
        )));
    }
    Ok(())
}

/// Distance transform into a caller-owned distance map of the mask's size.
pub fn distance_transform_into(
    mask: &GrayImage,
    metric: &DistanceMetric,
    mask_size: MaskSize,
    distances: &mut FloatImage,
) -> Result<()> {
    check_size("distance map", mask, distances)?;
    let weights = FixedWeights::new(&metric.weights(mask_size)?);
    debug!(
        "distance transform {}x{}, {:?} {:?}",
        mask.width(),
        mask.height(),
        mask_size,
        metric
    );

    let moves = weights.causal(mask_size);
    let mut state = Propagation::new(
        mask.width() as usize,
        mask.height() as usize,
        mask_size.radius(),
        None,
    );
    state.forward(mask, &moves);
    state.backward(weights.min(mask_size), &moves, distances);
    Ok(())
}

/// Labeled distance transform into caller-owned buffers.
///
/// `labels` must hold the seed label of every zero pixel of `mask` on entry;
/// on return every pixel carries the label of the seed it is nearest to (or
/// 0 when no seed is reachable). Only the 5x5 mask is supported.
pub fn distance_transform_labeled_into(
    mask: &GrayImage,
    metric: &DistanceMetric,
    mask_size: MaskSize,
    distances: &mut FloatImage,
    labels: &mut LabelImage,
) -> Result<()> {
    if mask_size != MaskSize::Mask5x5 {
        return Err(Error::config(
            "3x3 mask can not be used for the labeled distance transform, use 5x5",
        ));
    }
    check_size("distance map", mask, distances)?;
    check_size("label map", mask, labels)?;
    let weights = FixedWeights::new(&metric.weights(mask_size)?);
    debug!(
        "labeled distance transform {}x{}, {:?}",
        mask.width(),
        mask.height(),
        metric
    );

    let moves = weights.causal(mask_size);
    let mut state = Propagation::new(
        mask.width() as usize,
        mask.height() as usize,
        mask_size.radius(),
        Some(labels),
    );
    state.forward(mask, &moves);
    state.backward(weights.min(mask_size), &moves, distances);
    state.write_labels(labels);
    Ok(())
}

/// Label the 8-connected regions of zero pixels `1..=N` in raster order of
/// their first pixel. Non-zero pixels get 0. Returns the labels and `N`.
pub fn label_zero_components(mask: &GrayImage) -> (LabelImage, usize) {
    let (w, h) = (mask.width() as usize, mask.height() as usize);
    let mut labels = LabelImage::filled(mask.width(), mask.height(), 0);
    let src = mask.as_slice();
    let mut count = 0;
    let mut stack = Vec::new();

    for start in 0..w * h {
        if src[start] != 0 || labels.as_slice()[start] != 0 {
            continue;
        }
        count += 1;
        let label = count as i32;
        let out = labels.as_mut_slice();
        out[start] = label;
        stack.push(start);

        while let Some(p) = stack.pop() {
            let (x, y) = ((p % w) as isize, (p / w) as isize);
            for dy in -1..=1isize {
                for dx in -1..=1isize {
                    let (nx, ny) = (x + dx, y + dy);
                    if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                        continue;
                    }
                    let q = ny as usize * w + nx as usize;
                    if src[q] == 0 && out[q] == 0 {
                        out[q] = label;
                        stack.push(q);
                    }
                }
            }
        }
    }

    (labels, count)
}

/// Distance transform of `mask`, allocating the outputs.
pub fn distance_transform(mask: &GrayImage, params: &DistanceParams) -> Result<DistanceOutput> {
    let mut distances = FloatImage::filled(mask.width(), mask.height(), 0.0);

    if !params.labels {
        distance_transform_into(mask, &params.metric, params.mask_size, &mut distances)?;
        return Ok(DistanceOutput {
            distances,
            labels: None,
        });
    }

    if params.mask_size != MaskSize::Mask5x5 {
        return Err(Error::config(
            "3x3 mask can not be used for the labeled distance transform, use 5x5",
        ));
    }
    let (mut labels, regions) = label_zero_components(mask);
    debug!("{} zero regions seeded", regions);
    distance_transform_labeled_into(
        mask,
        &params.metric,
        params.mask_size,
        &mut distances,
        &mut labels,
    )?;
    Ok(DistanceOutput {
        distances,
        labels: Some(labels),
    })
}

/// Transform independent masks in parallel.
pub fn distance_transform_batch(
    masks: &[GrayImage],
    params: &DistanceParams,
) -> Result<Vec<DistanceOutput>> {
    masks
        .par_iter()
        .map(|mask| distance_transform(mask, params))
        .collect()
}
