use serde::{Deserialize, Serialize};

use crate::image::IntegralView;
use crate::types::Size;

/// A local-binary-pattern feature: a 3x3 grid of `width x height` cells whose
/// top-left corner sits at (`x`, `y`) inside the detection window.
///
/// Coordinates are stored as bytes, so each component is at most 255.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbpFeature {
    pub x: u8,
    pub y: u8,
    pub width: u8,
    pub height: u8,
}

impl LbpFeature {
    pub const fn new(x: u8, y: u8, width: u8, height: u8) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build from integer rect components, saturating each into `0..=255`.
    pub fn from_rect(x: i32, y: i32, width: i32, height: i32) -> Self {
        let sat = |v: i32| v.clamp(0, u8::MAX as i32) as u8;
        Self::new(sat(x), sat(y), sat(width), sat(height))
    }

    /// Bottom-right extent of the 3x3 grid, relative to the window origin.
    pub fn extent(&self) -> Size {
        Size::new(
            self.x as i32 + 3 * self.width as i32,
            self.y as i32 + 3 * self.height as i32,
        )
    }

    /// Compute the 8-bit LBP code for the window whose top-left corner is
    /// (`wx`, `wy`) in the integral's image coordinates.
    ///
    /// Each neighbour cell whose sum is at least the centre cell's sum sets one
    /// bit, walking clockwise from the top-left cell (bit 7) to the left cell
    /// (bit 0).
    #[inline]
    pub fn code(&self, integral: &IntegralView<'_>, wx: usize, wy: usize) -> u8 {
        let x0 = wx + self.x as usize;
        let y0 = wy + self.y as usize;
        let w = self.width as usize;
        let h = self.height as usize;

        // 4x4 grid of integral corners.
        let mut p = [[0u32; 4]; 4];
        for (r, row) in p.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = integral.at(x0 + c * w, y0 + r * h);
            }
        }
        let cell = |r: usize, c: usize| -> u32 {
            p[r + 1][c + 1]
                .wrapping_sub(p[r][c + 1])
                .wrapping_sub(p[r + 1][c])
                .wrapping_add(p[r][c])
        };

        let center = cell(1, 1);
        let bit = |r: usize, c: usize, mask: u8| if cell(r, c) >= center { mask } else { 0 };

        bit(0, 0, 128)
            | bit(0, 1, 64)
            | bit(0, 2, 32)
            | bit(1, 2, 16)
            | bit(2, 2, 8)
            | bit(2, 1, 4)
            | bit(2, 0, 2)
            | bit(1, 0, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{GrayImage, PackedIntegral};

    fn integral_of(img: &GrayImage) -> PackedIntegral {
        let mut packed = PackedIntegral::new(img.dimensions(), 1);
        packed.integrate(img, 0).unwrap();
        packed
    }

    #[test]
    fn saturating_construction() {
        let f = LbpFeature::from_rect(-4, 300, 2, 255);
        assert_eq!(f, LbpFeature::new(0, 255, 2, 255));
        assert_eq!(LbpFeature::new(1, 2, 3, 4).extent(), Size::new(10, 14));
    }

    #[test]
    fn flat_patch_sets_every_bit() {
        let img = GrayImage::filled(6, 6, 50);
        let packed = integral_of(&img);
        let f = LbpFeature::new(0, 0, 2, 2);
        assert_eq!(f.code(&packed.view(0), 0, 0), 0xFF);
    }

    #[test]
    fn bright_centre_clears_every_bit() {
        // 3x3 cells of 1x1 pixels, centre brighter than all neighbours.
        let img = GrayImage::from_fn(3, 3, |x, y| if x == 1 && y == 1 { 200 } else { 10 });
        let packed = integral_of(&img);
        let f = LbpFeature::new(0, 0, 1, 1);
        assert_eq!(f.code(&packed.view(0), 0, 0), 0);
    }

    #[test]
    fn bit_order_is_clockwise_from_top_left() {
        // Only the right-hand cell beats the centre: bit 4 (value 16).
        let img = GrayImage::from_fn(3, 3, |x, y| match (x, y) {
            (1, 1) => 100,
            (2, 1) => 150,
            _ => 0,
        });
        let packed = integral_of(&img);
        let f = LbpFeature::new(0, 0, 1, 1);
        assert_eq!(f.code(&packed.view(0), 0, 0), 16);

        // Only the bottom-left cell: bit 1 (value 2).
        let img = GrayImage::from_fn(3, 3, |x, y| match (x, y) {
            (1, 1) => 100,
            (0, 2) => 150,
            _ => 0,
        });
        let packed = integral_of(&img);
        assert_eq!(f.code(&packed.view(0), 0, 0), 2);
    }

    #[test]
    fn window_offset_shifts_sampling() {
        let img = GrayImage::from_fn(8, 8, |x, y| if x == 5 && y == 5 { 255 } else { 0 });
        let packed = integral_of(&img);
        let f = LbpFeature::new(1, 1, 1, 1);
        // Window at (3,3): feature grid spans pixels 4..7, centre at (5,5).
        assert_eq!(f.code(&packed.view(0), 3, 3), 0);
        // Window at (0,0): centre at (2,2), everything dark.
        assert_eq!(f.code(&packed.view(0), 0, 0), 0xFF);
    }
}
