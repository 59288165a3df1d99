//! Small geometric helpers shared by the terrain and its callers.

use glam::{Affine3A, Vec3};
use serde::{Deserialize, Serialize};

/// A half-line with an origin and a normalized direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ray3 {
    /// Ray origin
    pub origin: Vec3,
    /// Unit direction
    pub direction: Vec3,
}

impl Ray3 {
    /// Creates a ray, normalizing the direction.
    #[must_use]
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction: direction.normalize_or_zero(),
        }
    }

    /// Returns the point at parameter `t`.
    #[must_use]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// Intersects the ray with triangle `(a, b, c)` (Möller–Trumbore).
    ///
    /// Returns the ray parameter of the hit, or `None` when the ray misses or
    /// the hit lies behind the origin.
    #[must_use]
    pub fn intersect_triangle(&self, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
        const EPSILON: f32 = 1e-7;
        let edge1 = b - a;
        let edge2 = c - a;
        let p = self.direction.cross(edge2);
        let det = edge1.dot(p);
        if det.abs() < EPSILON {
            return None;
        }
        let inv_det = 1.0 / det;
        let s = self.origin - a;
        let u = s.dot(p) * inv_det;
        if !(0.0..=1.0).contains(&u) {
            return None;
        }
        let q = s.cross(edge1);
        let v = self.direction.dot(q) * inv_det;
        if v < 0.0 || u + v > 1.0 {
            return None;
        }
        let t = edge2.dot(q) * inv_det;
        (t >= 0.0).then_some(t)
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    /// Minimum corner
    pub min: Vec3,
    /// Maximum corner
    pub max: Vec3,
}

impl Aabb {
    /// Creates a box from two corners.
    #[must_use]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    /// Center point.
    #[must_use]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Half extents.
    #[must_use]
    pub fn extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// Smallest box containing both boxes.
    #[must_use]
    pub fn merge(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Checks whether a point lies inside the box (inclusive).
    #[must_use]
    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    /// Transforms the box and returns the axis-aligned box of the result.
    #[must_use]
    pub fn transformed(&self, transform: &Affine3A) -> Aabb {
        let corners = [
            Vec3::new(self.min.x, self.min.y, self.min.z),
            Vec3::new(self.max.x, self.min.y, self.min.z),
            Vec3::new(self.min.x, self.max.y, self.min.z),
            Vec3::new(self.max.x, self.max.y, self.min.z),
            Vec3::new(self.min.x, self.min.y, self.max.z),
            Vec3::new(self.max.x, self.min.y, self.max.z),
            Vec3::new(self.min.x, self.max.y, self.max.z),
            Vec3::new(self.max.x, self.max.y, self.max.z),
        ];
        let first = transform.transform_point3(corners[0]);
        corners[1..].iter().fold(Aabb::new(first, first), |acc, &c| {
            let p = transform.transform_point3(c);
            Aabb {
                min: acc.min.min(p),
                max: acc.max.max(p),
            }
        })
    }
}

/// World placement of a terrain: horizontal scale plus translation.
///
/// Heights are scaled by the clip levels themselves, so the y scale of the
/// transform stays 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TerrainTransform {
    /// World units per terrain-local unit on x and z
    pub horizontal_scale: glam::Vec2,
    /// World translation
    pub translation: Vec3,
}

impl Default for TerrainTransform {
    fn default() -> Self {
        Self {
            horizontal_scale: glam::Vec2::ONE,
            translation: Vec3::ZERO,
        }
    }
}

impl TerrainTransform {
    /// Creates a transform from a dataset scale (only x and z are used).
    #[must_use]
    pub fn from_scale(scale: Vec3) -> Self {
        Self {
            horizontal_scale: glam::Vec2::new(scale.x, scale.z),
            translation: Vec3::ZERO,
        }
    }

    /// Full scale vector `(x, 1, z)`.
    #[must_use]
    pub fn scale(&self) -> Vec3 {
        Vec3::new(self.horizontal_scale.x, 1.0, self.horizontal_scale.y)
    }

    /// Local to world matrix.
    #[must_use]
    pub fn to_affine(&self) -> Affine3A {
        Affine3A::from_scale_rotation_translation(
            self.scale(),
            glam::Quat::IDENTITY,
            self.translation,
        )
    }

    /// Maps a world point into terrain-local space.
    #[must_use]
    pub fn world_to_local(&self, point: Vec3) -> Vec3 {
        (point - self.translation) / self.scale()
    }

    /// Maps a terrain-local point into world space.
    #[must_use]
    pub fn local_to_world(&self, point: Vec3) -> Vec3 {
        point * self.scale() + self.translation
    }

    /// Maps a world ray into terrain-local space. The direction is renormalized.
    #[must_use]
    pub fn ray_to_local(&self, ray: &Ray3) -> Ray3 {
        Ray3::new(
            self.world_to_local(ray.origin),
            ray.direction / self.scale(),
        )
    }
}
