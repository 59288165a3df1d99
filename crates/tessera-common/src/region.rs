//! Level-tagged rectangles describing areas that changed.

use serde::{Deserialize, Serialize};

use crate::coords::div_ceil;

/// An axis-aligned rectangle in one clip level's sample space.
///
/// Regions are the unit of "this area changed": caches post them when tiles
/// become resident and the terrain rewrites exactly the covered vertices or
/// texels. Width and height are always positive when built with
/// [`Region::new`] or [`Region::from_edges`]; struct literals must keep that
/// themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    /// Clip level the rectangle belongs to
    pub level: u32,
    /// Left edge, in level samples
    pub x: i32,
    /// Top edge, in level samples
    pub y: i32,
    /// Width in samples
    pub width: i32,
    /// Height in samples
    pub height: i32,
}

impl Region {
    /// Creates a new region.
    ///
    /// Extents below one sample are raised to one. Use
    /// [`from_edges`](Self::from_edges) where the rectangle may be empty.
    #[must_use]
    pub const fn new(level: u32, x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            level,
            x,
            y,
            width: if width < 1 { 1 } else { width },
            height: if height < 1 { 1 } else { height },
        }
    }

    /// Creates a region from edge coordinates, or `None` if it would be empty.
    #[must_use]
    pub const fn from_edges(level: u32, left: i32, top: i32, right: i32, bottom: i32) -> Option<Self> {
        if right <= left || bottom <= top {
            return None;
        }
        Some(Self::new(level, left, top, right - left, bottom - top))
    }

    /// Returns the exclusive right edge.
    #[must_use]
    pub const fn right(&self) -> i32 {
        self.x + self.width
    }

    /// Returns the exclusive bottom edge.
    #[must_use]
    pub const fn bottom(&self) -> i32 {
        self.y + self.height
    }

    /// Returns the number of covered samples.
    #[must_use]
    pub const fn area(&self) -> i64 {
        self.width as i64 * self.height as i64
    }

    /// Checks whether the rectangles overlap. Levels are not compared.
    #[must_use]
    pub const fn intersects(&self, other: &Region) -> bool {
        self.x < other.right()
            && self.right() > other.x
            && self.y < other.bottom()
            && self.bottom() > other.y
    }

    /// Returns the overlap of both rectangles, tagged with this region's level.
    #[must_use]
    pub fn intersection(&self, other: &Region) -> Option<Region> {
        Self::from_edges(
            self.level,
            self.x.max(other.x),
            self.y.max(other.y),
            self.right().min(other.right()),
            self.bottom().min(other.bottom()),
        )
    }

    /// Checks whether this rectangle fully contains another.
    #[must_use]
    pub const fn contains(&self, other: &Region) -> bool {
        other.x >= self.x
            && other.right() <= self.right()
            && other.y >= self.y
            && other.bottom() <= self.bottom()
    }

    /// Checks whether a sample lies inside the rectangle.
    #[must_use]
    pub const fn contains_sample(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// Returns the same rectangle tagged with another level.
    #[must_use]
    pub const fn with_level(self, level: u32) -> Self {
        Self { level, ..self }
    }

    /// Synthesizes the region one level down that covers this footprint.
    ///
    /// Coordinates are divided by `ratio`; the origin rounds down and the far
    /// edge rounds up so the result always covers the source. Returns `None`
    /// at level 0.
    #[must_use]
    pub fn coarsened(&self, ratio: i32) -> Option<Region> {
        if self.level == 0 {
            return None;
        }
        let ratio = ratio.max(1);
        let left = self.x.div_euclid(ratio);
        let top = self.y.div_euclid(ratio);
        let right = div_ceil(self.right(), ratio).max(left + 1);
        let bottom = div_ceil(self.bottom(), ratio).max(top + 1);
        Self::from_edges(self.level - 1, left, top, right, bottom)
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "L{}[{}, {} {}x{}]",
            self.level, self.x, self.y, self.width, self.height
        )
    }
}
