//! Scale pyramid planning.
//!
//! Levels are generated at `scale = factor^order`, starting from the full
//! frame, until the scaled frame no longer holds a window or the scaled window
//! exceeds the maximum object size. Consecutive levels are packed side by side
//! into one integral buffer as long as their slots (`scaled width + 1` cells
//! each) fit within `integral_factor * (frame.width + 1)` cells. Each such
//! group is a [`PackingPass`] and is scanned in one parallel sweep.

use log::debug;

use crate::error::{Error, Result};
use crate::types::{Rect, Size};

/// One scale of the pyramid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PyramidLevel {
    pub order: u32,
    pub scale: f32,
    /// Frame resized by `1 / scale`.
    pub scaled_frame: Size,
    /// Window origins available in the scaled frame, clamped at zero.
    pub work_area: Size,
    /// Detection window mapped back to frame pixels.
    pub scaled_window: Size,
    feasible: bool,
}

impl PyramidLevel {
    fn new(order: u32, scale_factor: f32, frame: Size, window: Size, max_object: Size) -> Self {
        let scale = scale_factor.powi(order as i32);
        let scaled_frame = frame.shrunk(scale);
        let raw_work = scaled_frame - window + 1;
        let scaled_window = window.scaled(scale);
        let feasible =
            raw_work.width > 0 && raw_work.height > 0 && scaled_window.fits_within(max_object);

        Self {
            order,
            scale,
            scaled_frame,
            work_area: Size::new(raw_work.width.max(0), raw_work.height.max(0)),
            scaled_window,
            feasible,
        }
    }

    pub fn is_feasible(&self) -> bool {
        self.feasible
    }

    /// Sliding step in scaled pixels: dense up to 2x, every other pixel beyond.
    pub fn step(&self) -> usize {
        if self.scale <= 2.0 {
            1
        } else {
            2
        }
    }

    /// Window origins per row and per column at this level's step.
    pub fn grid(&self) -> (usize, usize) {
        let step = self.step();
        (
            (self.work_area.width as usize).div_ceil(step),
            (self.work_area.height as usize).div_ceil(step),
        )
    }

    pub fn window_count(&self) -> usize {
        let (cols, rows) = self.grid();
        cols * rows
    }

    /// Frame-space rectangle of the window whose origin is (`x`, `y`) in this
    /// level's scaled frame.
    pub fn candidate(&self, x: usize, y: usize) -> Rect {
        Rect::new(
            (x as f32 * self.scale).round() as i32,
            (y as f32 * self.scale).round() as i32,
            self.scaled_window.width,
            self.scaled_window.height,
        )
    }
}

/// A level placed inside a packing pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassLevel {
    pub level: PyramidLevel,
    /// Column offset of this level's integral slot.
    pub offset: usize,
    /// Index of this level's first window in the pass-wide numbering.
    pub first_window: usize,
    pub window_count: usize,
}

impl PassLevel {
    /// Scaled-frame origin of the `local`-th window of this level.
    pub fn window_origin(&self, local: usize) -> (usize, usize) {
        let step = self.level.step();
        let (cols, _) = self.level.grid();
        ((local % cols) * step, (local / cols) * step)
    }
}

/// Levels sharing one integral buffer, and the total number of windows the
/// evaluator has to scan for them.
#[derive(Debug, Clone, PartialEq)]
pub struct PackingPass {
    pub levels: Vec<PassLevel>,
    pub total_windows: usize,
}

impl PackingPass {
    /// Level owning the pass-wide window index `window`.
    pub fn locate(&self, window: usize) -> Option<(&PassLevel, usize)> {
        if window >= self.total_windows {
            return None;
        }
        let idx = self
            .levels
            .partition_point(|l| l.first_window <= window)
            .checked_sub(1)?;
        let level = &self.levels[idx];
        Some((level, window - level.first_window))
    }

    /// Integral columns used by this pass.
    pub fn width(&self) -> usize {
        self.levels
            .last()
            .map(|l| l.offset + l.level.scaled_frame.width as usize + 1)
            .unwrap_or(0)
    }
}

/// Plans pyramid levels and packing passes for one frame geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PyramidScheduler {
    frame: Size,
    window: Size,
    scale_factor: f32,
    max_object: Size,
    integral_factor: usize,
}

impl PyramidScheduler {
    /// `max_object` of `None` or an empty size means the whole frame.
    pub fn new(
        frame: Size,
        window: Size,
        scale_factor: f32,
        max_object: Option<Size>,
        integral_factor: usize,
    ) -> Result<Self> {
        if !(scale_factor.is_finite() && scale_factor > 1.0) {
            return Err(Error::config(format!(
                "scale factor must be greater than 1, got {}",
                scale_factor
            )));
        }
        if window.is_empty() {
            return Err(Error::config(format!("invalid window size {:?}", window)));
        }
        if frame.is_empty() {
            return Err(Error::config(format!("invalid frame size {:?}", frame)));
        }
        if integral_factor == 0 {
            return Err(Error::config("integral factor must be at least 1"));
        }

        let max_object = match max_object {
            Some(size) if !size.is_empty() => size,
            _ => frame,
        };

        Ok(Self {
            frame,
            window,
            scale_factor,
            max_object,
            integral_factor,
        })
    }

    pub fn frame(&self) -> Size {
        self.frame
    }

    pub fn max_object(&self) -> Size {
        self.max_object
    }

    pub fn level(&self, order: u32) -> PyramidLevel {
        PyramidLevel::new(
            order,
            self.scale_factor,
            self.frame,
            self.window,
            self.max_object,
        )
    }

    /// Every feasible level, in increasing order.
    pub fn levels(&self) -> Vec<PyramidLevel> {
        (0..)
            .map(|order| self.level(order))
            .take_while(PyramidLevel::is_feasible)
            .collect()
    }

    /// Integral buffer width available to one pass.
    pub fn buffer_width(&self) -> usize {
        self.integral_factor * (self.frame.width as usize + 1)
    }

    /// Group the feasible levels into packing passes.
    pub fn plan(&self) -> Vec<PackingPass> {
        let limit = self.buffer_width();
        let mut passes = Vec::new();
        let mut level = self.level(0);

        while level.is_feasible() {
            let mut acc = level.scaled_frame.width as usize + 1;
            let mut offset = 0;
            let mut pass = PackingPass {
                levels: Vec::new(),
                total_windows: 0,
            };

            while acc <= limit && level.is_feasible() {
                let window_count = level.window_count();
                pass.levels.push(PassLevel {
                    level,
                    offset,
                    first_window: pass.total_windows,
                    window_count,
                });
                pass.total_windows += window_count;

                offset = acc;
                level = self.level(level.order + 1);
                acc += level.scaled_frame.width as usize + 1;
            }

            debug!(
                "packing pass {}: levels {:?}, {} windows, {} of {} integral columns",
                passes.len(),
                pass.levels.iter().map(|l| l.level.order).collect::<Vec<_>>(),
                pass.total_windows,
                pass.width(),
                limit
            );
            passes.push(pass);
        }

        passes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(max_object: Option<Size>) -> PyramidScheduler {
        PyramidScheduler::new(Size::new(100, 100), Size::new(24, 24), 1.2, max_object, 4).unwrap()
    }

    #[test]
    fn first_infeasible_level_matches_direct_computation() {
        let s = scheduler(Some(Size::new(100, 100)));
        let expected = (0..)
            .find(|&order| (24.0 * 1.2f32.powi(order)).round() > 100.0)
            .unwrap();
        assert_eq!(expected, 8);

        let levels = s.levels();
        assert_eq!(levels.len(), 8);
        assert!(!s.level(8).is_feasible());
        assert_eq!(levels[0].scale, 1.0);
        assert_eq!(levels[0].work_area, Size::new(77, 77));
        assert_eq!(levels[7].scaled_window, Size::new(86, 86));
    }

    #[test]
    fn max_object_limits_levels() {
        let s = scheduler(Some(Size::new(40, 100)));
        // 24 * 1.2^2 = 34.56 fits, 24 * 1.2^3 = 41.47 does not.
        assert_eq!(s.levels().len(), 3);

        // Height is checked as well as width.
        let s = scheduler(Some(Size::new(100, 40)));
        assert_eq!(s.levels().len(), 3);

        // Empty size falls back to the frame.
        assert_eq!(scheduler(Some(Size::zero())).levels().len(), 8);
        assert_eq!(scheduler(None).levels().len(), 8);
    }

    #[test]
    fn step_switches_above_scale_two() {
        let s = scheduler(None);
        assert_eq!(s.level(3).step(), 1); // 1.728
        assert_eq!(s.level(4).step(), 2); // 2.0736

        let level = s.level(4);
        // scaled frame 48, work 25, step 2 -> 13 per axis
        assert_eq!(level.work_area, Size::new(25, 25));
        assert_eq!(level.window_count(), 13 * 13);
    }

    #[test]
    fn plan_packs_levels_within_integral_budget() {
        let passes = scheduler(None).plan();
        assert_eq!(passes.len(), 2);

        let offsets: Vec<usize> = passes[0].levels.iter().map(|l| l.offset).collect();
        assert_eq!(offsets, vec![0, 101, 185, 255, 314, 363]);
        assert_eq!(passes[0].width(), 404);

        let orders: Vec<u32> = passes[1].levels.iter().map(|l| l.level.order).collect();
        assert_eq!(orders, vec![6, 7]);
        assert_eq!(passes[1].levels[1].offset, 34);

        for pass in &passes {
            let sum: usize = pass.levels.iter().map(|l| l.level.window_count()).sum();
            assert_eq!(pass.total_windows, sum);
            assert!(pass.width() <= 4 * 101);
        }
    }

    #[test]
    fn locate_maps_pass_indices_to_levels() {
        let passes = scheduler(None).plan();
        let pass = &passes[0];

        let (level, local) = pass.locate(0).unwrap();
        assert_eq!((level.level.order, local), (0, 0));

        let (level, local) = pass.locate(77 * 77).unwrap();
        assert_eq!((level.level.order, local), (1, 0));

        let (level, local) = pass.locate(77 * 77 + 61).unwrap();
        assert_eq!(level.level.order, 1);
        // level 1 work area is 83 - 24 + 1 = 60 wide
        assert_eq!(level.window_origin(local), (1, 1));

        assert!(pass.locate(pass.total_windows).is_none());
    }

    #[test]
    fn candidate_maps_back_to_frame() {
        let s = scheduler(None);
        let level = s.level(1);
        let r = level.candidate(10, 5);
        assert_eq!(r, Rect::new(12, 6, 29, 29));
    }

    #[test]
    fn frame_smaller_than_window_has_no_levels() {
        let s = PyramidScheduler::new(Size::new(20, 20), Size::new(24, 24), 1.1, None, 4).unwrap();
        assert!(s.levels().is_empty());
        assert!(s.plan().is_empty());
    }

    #[test]
    fn rejects_bad_configuration() {
        let frame = Size::new(100, 100);
        let window = Size::new(24, 24);
        assert!(PyramidScheduler::new(frame, window, 1.0, None, 4).is_err());
        assert!(PyramidScheduler::new(frame, window, f32::NAN, None, 4).is_err());
        assert!(PyramidScheduler::new(frame, Size::zero(), 1.2, None, 4).is_err());
        assert!(PyramidScheduler::new(Size::zero(), window, 1.2, None, 4).is_err());
        assert!(PyramidScheduler::new(frame, window, 1.2, None, 0).is_err());
    }
}
