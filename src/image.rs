//! Image planes, resampling and the packed integral buffer used by the detector.

use crate::error::{Error, Result};
use crate::types::Size;

/// Trait for accessing pixel intensities from a single-channel 8-bit image.
pub trait ImageAccess {
    /// Get the grayscale intensity at (x, y). Returns 0 for out-of-bounds pixels.
    fn get_pixel(&self, x: i32, y: i32) -> u8;

    /// Image dimensions.
    fn width(&self) -> u32;
    fn height(&self) -> u32;

    fn size(&self) -> Size {
        Size::new(self.width() as i32, self.height() as i32)
    }
}

/// An owned, row-major, single-channel image plane.
#[derive(Debug, Clone, PartialEq)]
pub struct Image<T> {
    data: Vec<T>,
    width: u32,
    height: u32,
}

/// 8-bit mask or grayscale frame.
pub type GrayImage = Image<u8>;
/// 32-bit float plane (distance maps).
pub type FloatImage = Image<f32>;
/// 32-bit signed plane (connected-component labels).
pub type LabelImage = Image<i32>;

impl<T: Copy + Default> Image<T> {
    pub fn new(data: Vec<T>, width: u32, height: u32) -> Result<Self> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(Error::config(format!(
                "image buffer holds {} pixels, {}x{} needs {}",
                data.len(),
                width,
                height,
                expected
            )));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn filled(width: u32, height: u32, value: T) -> Self {
        Self {
            data: vec![value; width as usize * height as usize],
            width,
            height,
        }
    }

    pub fn from_fn<F>(width: u32, height: u32, f: F) -> Self
    where
        F: Fn(u32, u32) -> T,
    {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            data,
            width,
            height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> Size {
        Size::new(self.width as i32, self.height as i32)
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> T {
        self.data[y as usize * self.width as usize + x as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: T) {
        let w = self.width as usize;
        self.data[y as usize * w + x as usize] = value;
    }

    pub fn row(&self, y: u32) -> &[T] {
        let w = self.width as usize;
        let start = y as usize * w;
        &self.data[start..start + w]
    }

    pub fn row_mut(&mut self, y: u32) -> &mut [T] {
        let w = self.width as usize;
        let start = y as usize * w;
        &mut self.data[start..start + w]
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_raw(self) -> Vec<T> {
        self.data
    }

    /// Reshape in place, reusing the allocation when it is large enough.
    pub fn reshape(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.data
            .resize(width as usize * height as usize, T::default());
    }
}

impl ImageAccess for GrayImage {
    fn get_pixel(&self, x: i32, y: i32) -> u8 {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return 0;
        }
        self.data[y as usize * self.width as usize + x as usize]
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

/// Sample with bilinear interpolation, clamping coordinates to the image.
#[inline]
fn sample_bilinear<I: ImageAccess + ?Sized>(image: &I, x: f32, y: f32) -> f32 {
    let max_x = image.width() as i32 - 1;
    let max_y = image.height() as i32 - 1;

    let x0 = (x.floor() as i32).clamp(0, max_x);
    let y0 = (y.floor() as i32).clamp(0, max_y);
    let x1 = (x0 + 1).min(max_x);
    let y1 = (y0 + 1).min(max_y);

    let fx = (x - x0 as f32).clamp(0.0, 1.0);
    let fy = (y - y0 as f32).clamp(0.0, 1.0);

    let p00 = image.get_pixel(x0, y0) as f32;
    let p10 = image.get_pixel(x1, y0) as f32;
    let p01 = image.get_pixel(x0, y1) as f32;
    let p11 = image.get_pixel(x1, y1) as f32;

    let top = p00 * (1.0 - fx) + p10 * fx;
    let bottom = p01 * (1.0 - fx) + p11 * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Resize `src` into `dst`, whose current dimensions define the target size.
///
/// Pixel centres are aligned (half-pixel offset) the same way the usual
/// linear-interpolation resize does. Equal sizes degrade to a copy.
pub fn resize_bilinear<I: ImageAccess + ?Sized>(src: &I, dst: &mut GrayImage) {
    let (sw, sh) = (src.width(), src.height());
    let (dw, dh) = (dst.width(), dst.height());
    if sw == 0 || sh == 0 || dw == 0 || dh == 0 {
        return;
    }

    if sw == dw && sh == dh {
        for y in 0..dh {
            let row = dst.row_mut(y);
            for (x, px) in row.iter_mut().enumerate() {
                *px = src.get_pixel(x as i32, y as i32);
            }
        }
        return;
    }

    let sx = sw as f32 / dw as f32;
    let sy = sh as f32 / dh as f32;
    for y in 0..dh {
        let fy = (y as f32 + 0.5) * sy - 0.5;
        let row = dst.row_mut(y);
        for (x, px) in row.iter_mut().enumerate() {
            let fx = (x as f32 + 0.5) * sx - 0.5;
            *px = sample_bilinear(src, fx, fy).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Several integral images laid side by side in one buffer.
///
/// The buffer is `integral_factor * (frame.width + 1)` cells wide and
/// `frame.height + 1` rows tall. Each pyramid level occupies a column slot
/// starting at its offset. Sums use wrapping arithmetic: a rectangle sum
/// computed with wrapping subtraction is exact as long as it fits in `u32`.
#[derive(Debug, Clone)]
pub struct PackedIntegral {
    data: Vec<u32>,
    stride: usize,
    rows: usize,
}

impl PackedIntegral {
    pub fn new(frame: Size, integral_factor: usize) -> Self {
        let stride = integral_factor * (frame.width.max(0) as usize + 1);
        let rows = frame.height.max(0) as usize + 1;
        Self {
            data: vec![0; stride * rows],
            stride,
            rows,
        }
    }

    /// True when the buffer can hold the packing passes of `frame`.
    pub fn fits(&self, frame: Size, integral_factor: usize) -> bool {
        self.stride >= integral_factor * (frame.width.max(0) as usize + 1)
            && self.rows > frame.height.max(0) as usize
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Write the integral of `src` into the column slot at `column_offset`.
    pub fn integrate(&mut self, src: &GrayImage, column_offset: usize) -> Result<()> {
        let w = src.width() as usize;
        let h = src.height() as usize;
        if column_offset + w + 1 > self.stride || h + 1 > self.rows {
            return Err(Error::config(format!(
                "integral slot {}..{} x {} exceeds packed buffer {}x{}",
                column_offset,
                column_offset + w + 1,
                h + 1,
                self.stride,
                self.rows
            )));
        }

        let stride = self.stride;
        self.data[column_offset..column_offset + w + 1].fill(0);
        for y in 0..h {
            let (above, below) = self.data.split_at_mut((y + 1) * stride);
            let prev = &above[y * stride + column_offset..y * stride + column_offset + w + 1];
            let cur = &mut below[column_offset..column_offset + w + 1];
            cur[0] = 0;
            let mut row_sum = 0u32;
            for (x, &px) in src.row(y as u32).iter().enumerate() {
                row_sum = row_sum.wrapping_add(px as u32);
                cur[x + 1] = prev[x + 1].wrapping_add(row_sum);
            }
        }
        Ok(())
    }

    pub fn view(&self, column_offset: usize) -> IntegralView<'_> {
        IntegralView {
            data: &self.data,
            stride: self.stride,
            offset: column_offset,
        }
    }
}

/// Read-only window onto one integral slot of a [`PackedIntegral`].
#[derive(Debug, Clone, Copy)]
pub struct IntegralView<'a> {
    data: &'a [u32],
    stride: usize,
    offset: usize,
}

impl IntegralView<'_> {
    #[inline]
    pub fn at(&self, x: usize, y: usize) -> u32 {
        self.data[y * self.stride + self.offset + x]
    }

    /// Sum of the `w x h` rectangle whose top-left pixel is (x, y).
    #[inline]
    pub fn rect_sum(&self, x: usize, y: usize, w: usize, h: usize) -> u32 {
        self.at(x + w, y + h)
            .wrapping_sub(self.at(x + w, y))
            .wrapping_sub(self.at(x, y + h))
            .wrapping_add(self.at(x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gray_image_access() {
        // 3x3 checkerboard pattern
        let data = vec![
            0, 255, 0, //
            255, 0, 255, //
            0, 255, 0, //
        ];
        let img = GrayImage::new(data, 3, 3).unwrap();

        assert_eq!(img.get_pixel(0, 0), 0);
        assert_eq!(img.get_pixel(1, 0), 255);
        assert_eq!(img.get_pixel(1, 1), 0);

        // Out of bounds returns 0
        assert_eq!(img.get_pixel(-1, 0), 0);
        assert_eq!(img.get_pixel(3, 0), 0);
    }

    #[test]
    fn new_rejects_wrong_length() {
        let err = GrayImage::new(vec![0; 5], 2, 2).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn bilinear_interpolation() {
        let img = GrayImage::new(vec![0, 100, 200, 50], 2, 2).unwrap();

        assert!((sample_bilinear(&img, 0.0, 0.0) - 0.0).abs() < 0.01);
        assert!((sample_bilinear(&img, 1.0, 0.0) - 100.0).abs() < 0.01);
        assert!((sample_bilinear(&img, 0.5, 0.5) - 87.5).abs() < 0.01);
        // Clamped outside the image.
        assert!((sample_bilinear(&img, -3.0, 0.0) - 0.0).abs() < 0.01);
        assert!((sample_bilinear(&img, 5.0, 5.0) - 50.0).abs() < 0.01);
    }

    #[test]
    fn resize_constant_image_stays_constant() {
        let src = GrayImage::filled(40, 30, 77);
        let mut dst = GrayImage::filled(17, 11, 0);
        resize_bilinear(&src, &mut dst);
        assert!(dst.as_slice().iter().all(|&v| v == 77));
    }

    #[test]
    fn resize_same_size_copies() {
        let src = GrayImage::from_fn(8, 6, |x, y| (x * 10 + y) as u8);
        let mut dst = GrayImage::filled(8, 6, 0);
        resize_bilinear(&src, &mut dst);
        assert_eq!(dst, src);
    }

    #[test]
    fn packed_integral_slots_are_independent() {
        let a = GrayImage::filled(4, 3, 1);
        let b = GrayImage::from_fn(2, 2, |x, y| (1 + x + 2 * y) as u8);

        let mut packed = PackedIntegral::new(Size::new(4, 3), 2);
        assert_eq!(packed.stride(), 10);
        assert_eq!(packed.rows(), 4);

        packed.integrate(&a, 0).unwrap();
        packed.integrate(&b, 5).unwrap();

        let va = packed.view(0);
        assert_eq!(va.at(4, 3), 12);
        assert_eq!(va.rect_sum(1, 1, 2, 2), 4);

        let vb = packed.view(5);
        assert_eq!(vb.at(2, 2), 1 + 2 + 3 + 4);
        assert_eq!(vb.rect_sum(1, 0, 1, 2), 2 + 4);
    }

    #[test]
    fn integrate_rejects_overflowing_slot() {
        let img = GrayImage::filled(4, 3, 1);
        let mut packed = PackedIntegral::new(Size::new(4, 3), 1);
        assert!(packed.integrate(&img, 1).is_err());
    }
}
