use std::{
    fmt,
    marker::PhantomData,
    ops::{Add, Sub},
};

/// Type-level marker for the buffer coordinate space
#[derive(Debug)]
pub struct Buffer;

/// Type-level marker for the physical (output) coordinate space
#[derive(Debug)]
pub struct Physical;

/// A point as defined by its x and y coordinates
pub struct Point<Kind> {
    /// horizontal coordinate
    pub x: i32,
    /// vertical coordinate
    pub y: i32,
    _kind: PhantomData<Kind>,
}

impl<Kind> Point<Kind> {
    /// Create a new point from its coordinates
    #[inline]
    pub const fn new(x: i32, y: i32) -> Self {
        Point {
            x,
            y,
            _kind: PhantomData,
        }
    }

    /// Convert this [`Point`] to a [`Size`] with the same coordinates
    #[inline]
    pub fn to_size(self) -> Size<Kind> {
        Size::new(self.x, self.y)
    }
}

impl<Kind> fmt::Debug for Point<Kind> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Point")
            .field("x", &self.x)
            .field("y", &self.y)
            .finish()
    }
}

impl<Kind> Clone for Point<Kind> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<Kind> Copy for Point<Kind> {}

impl<Kind> PartialEq for Point<Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y
    }
}

impl<Kind> Eq for Point<Kind> {}

impl<Kind> Default for Point<Kind> {
    #[inline]
    fn default() -> Self {
        Point::new(0, 0)
    }
}

impl<Kind> From<(i32, i32)> for Point<Kind> {
    #[inline]
    fn from((x, y): (i32, i32)) -> Self {
        Point::new(x, y)
    }
}

impl<Kind> Add for Point<Kind> {
    type Output = Point<Kind>;
    #[inline]
    fn add(self, other: Point<Kind>) -> Point<Kind> {
        Point::new(self.x.saturating_add(other.x), self.y.saturating_add(other.y))
    }
}

impl<Kind> Sub for Point<Kind> {
    type Output = Point<Kind>;
    #[inline]
    fn sub(self, other: Point<Kind>) -> Point<Kind> {
        Point::new(self.x.saturating_sub(other.x), self.y.saturating_sub(other.y))
    }
}

/// A size as defined by its width and height
///
/// Constructors of this type ensure that the values are always positive,
/// but manually changing the fields to negative values is possible.
pub struct Size<Kind> {
    /// horizontal coordinate
    pub w: i32,
    /// vertical coordinate
    pub h: i32,
    _kind: PhantomData<Kind>,
}

impl<Kind> Size<Kind> {
    /// Create a new size, negative values are clamped to zero
    #[inline]
    pub fn new(w: i32, h: i32) -> Self {
        Size {
            w: w.max(0),
            h: h.max(0),
            _kind: PhantomData,
        }
    }

    /// Checks if the size is empty, i.e. one of its dimensions is zero
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    /// Area covered by this size
    #[inline]
    pub fn area(&self) -> i64 {
        self.w as i64 * self.h as i64
    }
}

impl<Kind> fmt::Debug for Size<Kind> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Size")
            .field("w", &self.w)
            .field("h", &self.h)
            .finish()
    }
}

impl<Kind> Clone for Size<Kind> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<Kind> Copy for Size<Kind> {}

impl<Kind> PartialEq for Size<Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.w == other.w && self.h == other.h
    }
}

impl<Kind> Eq for Size<Kind> {}

impl<Kind> Default for Size<Kind> {
    #[inline]
    fn default() -> Self {
        Size::new(0, 0)
    }
}

impl<Kind> From<(i32, i32)> for Size<Kind> {
    #[inline]
    fn from((w, h): (i32, i32)) -> Self {
        Size::new(w, h)
    }
}

/// A rectangle defined by its top-left corner and dimensions
pub struct Rectangle<Kind> {
    /// Location of the top-left corner of the rectangle
    pub loc: Point<Kind>,
    /// Size of the rectangle, as (width, height)
    pub size: Size<Kind>,
}

impl<Kind> fmt::Debug for Rectangle<Kind> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rectangle")
            .field("x", &self.loc.x)
            .field("y", &self.loc.y)
            .field("width", &self.size.w)
            .field("height", &self.size.h)
            .finish()
    }
}

impl<Kind> Clone for Rectangle<Kind> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<Kind> Copy for Rectangle<Kind> {}

impl<Kind> PartialEq for Rectangle<Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.loc == other.loc && self.size == other.size
    }
}

impl<Kind> Eq for Rectangle<Kind> {}

impl<Kind> Default for Rectangle<Kind> {
    #[inline]
    fn default() -> Self {
        Rectangle {
            loc: Default::default(),
            size: Default::default(),
        }
    }
}

impl<Kind> Rectangle<Kind> {
    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its dimensions
    #[inline]
    pub fn from_loc_and_size(loc: impl Into<Point<Kind>>, size: impl Into<Size<Kind>>) -> Self {
        Rectangle {
            loc: loc.into(),
            size: size.into(),
        }
    }

    /// Create a new [`Rectangle`] from the coordinates of its top-left corner and its bottom-right corner
    #[inline]
    pub fn from_extremities(topleft: impl Into<Point<Kind>>, bottomright: impl Into<Point<Kind>>) -> Self {
        let topleft = topleft.into();
        let bottomright = bottomright.into();
        Rectangle {
            loc: topleft,
            size: (bottomright - topleft).to_size(),
        }
    }

    /// Create a new [`Rectangle`] from `left`, `top`, `right` and `bottom` edges
    #[inline]
    pub fn from_ltrb(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Rectangle::from_extremities((left, top), (right, bottom))
    }

    /// Left edge
    #[inline]
    pub fn left(&self) -> i32 {
        self.loc.x
    }

    /// Top edge
    #[inline]
    pub fn top(&self) -> i32 {
        self.loc.y
    }

    /// Right edge (exclusive)
    #[inline]
    pub fn right(&self) -> i32 {
        self.loc.x.saturating_add(self.size.w)
    }

    /// Bottom edge (exclusive)
    #[inline]
    pub fn bottom(&self) -> i32 {
        self.loc.y.saturating_add(self.size.h)
    }

    /// Checks whether the rectangle covers no area
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size.is_empty()
    }

    /// Checks whether every coordinate of the rectangle is zero
    #[inline]
    pub fn is_zero(&self) -> bool {
        *self == Rectangle::default()
    }

    /// Checks whether a given [`Rectangle`] is completely contained in this one
    #[inline]
    pub fn contains_rect(self, rect: impl Into<Rectangle<Kind>>) -> bool {
        let r: Rectangle<Kind> = rect.into();
        r.left() >= self.left()
            && r.top() >= self.top()
            && r.right() <= self.right()
            && r.bottom() <= self.bottom()
    }

    /// Checks whether a given [`Rectangle`] overlaps with this one
    ///
    /// Note: This operation is exclusive, touching only rectangles will return `false`.
    #[inline]
    pub fn overlaps(self, other: impl Into<Rectangle<Kind>>) -> bool {
        let other = other.into();

        self.left() < other.right()
            && other.left() < self.right()
            && self.top() < other.bottom()
            && other.top() < self.bottom()
    }

    /// Clamp rectangle to min and max corners resulting in the overlapping area of two rectangles
    ///
    /// Returns `None` if the two rectangles don't overlap
    #[inline]
    pub fn intersection(self, other: impl Into<Rectangle<Kind>>) -> Option<Self> {
        let other = other.into();
        if !self.overlaps(other) {
            return None;
        }
        Some(Rectangle::from_extremities(
            (self.left().max(other.left()), self.top().max(other.top())),
            (self.right().min(other.right()), self.bottom().min(other.bottom())),
        ))
    }

    /// Subtract a set of [`Rectangle`]s from a set of [`Rectangle`]s in-place
    ///
    /// The result is a set of non-overlapping rectangles covering exactly the
    /// area of `rects` minus the area of `others`.
    pub fn subtract_rects_many_in_place(
        mut rects: Vec<Self>,
        others: impl IntoIterator<Item = Self>,
    ) -> Vec<Self> {
        for other in others {
            let items = rects.len();
            let mut checked = 0usize;
            let mut index = 0usize;

            // nothing left to subtract from
            if items == 0 {
                return rects;
            }

            while checked != items {
                checked += 1;

                let Some(intersection) = rects[index].intersection(other) else {
                    index += 1;
                    continue;
                };

                let item = rects.remove(index);

                if other.contains_rect(item) {
                    continue;
                }

                let top_rect = Rectangle::from_loc_and_size(
                    item.loc,
                    (item.size.w, intersection.top().saturating_sub(item.top())),
                );
                let left_rect = Rectangle::from_loc_and_size(
                    (item.left(), intersection.top()),
                    (
                        intersection.left().saturating_sub(item.left()),
                        intersection.size.h,
                    ),
                );
                let right_rect = Rectangle::from_loc_and_size(
                    (intersection.right(), intersection.top()),
                    (
                        item.right().saturating_sub(intersection.right()),
                        intersection.size.h,
                    ),
                );
                let bottom_rect = Rectangle::from_loc_and_size(
                    (item.left(), intersection.bottom()),
                    (item.size.w, item.bottom().saturating_sub(intersection.bottom())),
                );

                for rect in [top_rect, left_rect, right_rect, bottom_rect] {
                    if !rect.is_empty() {
                        rects.push(rect);
                    }
                }
            }
        }

        rects
    }

    /// Subtract a set of [`Rectangle`]s from this [`Rectangle`]
    pub fn subtract_rects(self, others: impl IntoIterator<Item = Self>) -> Vec<Self> {
        Self::subtract_rects_many_in_place(vec![self], others)
    }

    /// Scale the rectangle from one coordinate range into another one, e.g. from
    /// the UI resolution into the resolution of the active mode.
    #[inline]
    pub fn scale_between(self, from: Size<Kind>, to: Size<Kind>) -> Self {
        if from.is_empty() || from == to {
            return self;
        }
        let sx = |v: i32| (v as i64 * to.w as i64 / from.w as i64) as i32;
        let sy = |v: i32| (v as i64 * to.h as i64 / from.h as i64) as i32;
        Rectangle::from_ltrb(sx(self.left()), sy(self.top()), sx(self.right()), sy(self.bottom()))
    }
}

#[cfg(test)]
mod tests {
    use super::{Physical, Rectangle, Size};

    fn area(rects: &[Rectangle<Physical>]) -> i64 {
        rects.iter().map(|r| r.size.area()).sum()
    }

    #[test]
    fn intersection_of_disjoint_rects_is_none() {
        let a = Rectangle::<Physical>::from_loc_and_size((0, 0), (10, 10));
        let b = Rectangle::<Physical>::from_loc_and_size((10, 0), (10, 10));
        assert_eq!(a.intersection(b), None);
    }

    #[test]
    fn intersection_clamps_to_overlap() {
        let a = Rectangle::<Physical>::from_loc_and_size((0, 0), (10, 10));
        let b = Rectangle::<Physical>::from_loc_and_size((5, 5), (10, 10));
        assert_eq!(
            a.intersection(b),
            Some(Rectangle::from_loc_and_size((5, 5), (5, 5)))
        );
    }

    #[test]
    fn subtract_center_leaves_frame() {
        let screen = Rectangle::<Physical>::from_loc_and_size((0, 0), (100, 100));
        let hole = Rectangle::from_loc_and_size((25, 25), (50, 50));
        let remaining = screen.subtract_rects([hole]);
        assert_eq!(area(&remaining), 100 * 100 - 50 * 50);
        assert!(remaining.iter().all(|r| !r.overlaps(hole)));
    }

    #[test]
    fn subtract_covering_rect_leaves_nothing() {
        let screen = Rectangle::<Physical>::from_loc_and_size((0, 0), (100, 100));
        let remaining = screen.subtract_rects([Rectangle::from_loc_and_size((-10, -10), (200, 200))]);
        assert!(remaining.is_empty());
    }

    #[test]
    fn subtract_many_does_not_overlap() {
        let screen = Rectangle::<Physical>::from_loc_and_size((0, 0), (64, 64));
        let others = [
            Rectangle::from_loc_and_size((0, 0), (32, 16)),
            Rectangle::from_loc_and_size((16, 8), (32, 32)),
            Rectangle::from_loc_and_size((40, 40), (40, 40)),
        ];
        let remaining = screen.subtract_rects(others);
        for (i, a) in remaining.iter().enumerate() {
            for b in remaining.iter().skip(i + 1) {
                assert!(!a.overlaps(*b));
            }
            for o in others {
                assert!(!a.overlaps(o));
            }
        }
    }

    #[test]
    fn zero_rect() {
        assert!(Rectangle::<Physical>::default().is_zero());
        assert!(!Rectangle::<Physical>::from_loc_and_size((0, 0), (1, 0)).is_zero());
    }

    #[test]
    fn scale_between_ui_and_mode() {
        let frame = Rectangle::<Physical>::from_loc_and_size((0, 0), (1280, 720));
        let scaled = frame.scale_between(Size::from((1280, 720)), Size::from((3840, 2160)));
        assert_eq!(scaled, Rectangle::from_loc_and_size((0, 0), (3840, 2160)));
    }
}
