use serde::{Deserialize, Serialize};

/// Integer width/height pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: i32,
    pub height: i32,
}

impl Size {
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    pub const fn zero() -> Self {
        Self {
            width: 0,
            height: 0,
        }
    }

    /// True when either dimension is zero or negative.
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn area(&self) -> i64 {
        self.width as i64 * self.height as i64
    }

    /// True when both dimensions are no larger than `bound`'s.
    pub fn fits_within(&self, bound: Size) -> bool {
        self.width <= bound.width && self.height <= bound.height
    }

    /// Multiply both dimensions by `factor`, rounding to the nearest integer.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            width: (self.width as f32 * factor).round() as i32,
            height: (self.height as f32 * factor).round() as i32,
        }
    }

    /// Divide both dimensions by `factor`, rounding to the nearest integer.
    pub fn shrunk(&self, factor: f32) -> Self {
        Self {
            width: (self.width as f32 / factor).round() as i32,
            height: (self.height as f32 / factor).round() as i32,
        }
    }
}

impl std::ops::Sub for Size {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            width: self.width - rhs.width,
            height: self.height - rhs.height,
        }
    }
}

impl std::ops::Add<i32> for Size {
    type Output = Self;

    fn add(self, rhs: i32) -> Self::Output {
        Self {
            width: self.width + rhs,
            height: self.height + rhs,
        }
    }
}

/// An axis-aligned rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_origin_size(x: i32, y: i32, size: Size) -> Self {
        Self::new(x, y, size.width, size.height)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn area(&self) -> i64 {
        self.width as i64 * self.height as i64
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    /// True when `self` lies inside `other` grown by `dx`/`dy` on every side.
    pub fn inside_with_slack(&self, other: &Rect, dx: i32, dy: i32) -> bool {
        self.x >= other.x - dx
            && self.y >= other.y - dy
            && self.right() <= other.right() + dx
            && self.bottom() <= other.bottom() + dy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_arithmetic() {
        let frame = Size::new(100, 80);
        let window = Size::new(24, 24);

        let work = frame - window + 1;
        assert_eq!(work, Size::new(77, 57));

        assert_eq!(window.scaled(1.5), Size::new(36, 36));
        assert_eq!(frame.shrunk(1.2), Size::new(83, 67));
    }

    #[test]
    fn fits_within_checks_both_dimensions() {
        let bound = Size::new(100, 40);
        assert!(Size::new(40, 40).fits_within(bound));
        // Height must be compared against height, not width.
        assert!(!Size::new(40, 60).fits_within(bound));
        assert!(!Size::new(101, 10).fits_within(bound));
    }

    #[test]
    fn rect_containment_with_slack() {
        let outer = Rect::new(10, 10, 50, 50);
        let inner = Rect::new(20, 20, 10, 10);
        assert!(inner.inside_with_slack(&outer, 0, 0));

        let poking_out = Rect::new(8, 20, 10, 10);
        assert!(!poking_out.inside_with_slack(&outer, 0, 0));
        assert!(poking_out.inside_with_slack(&outer, 2, 0));
    }

    #[test]
    fn empty_sizes() {
        assert!(Size::zero().is_empty());
        assert!(Size::new(5, 0).is_empty());
        assert!(Size::new(-1, 3).is_empty());
        assert!(!Size::new(1, 1).is_empty());
    }
}
