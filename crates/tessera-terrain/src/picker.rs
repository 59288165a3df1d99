//! Ray picking against the clipmap heights.
//!
//! A [`GridTracer`] walks the cells of a regular XZ grid that a ray crosses,
//! nearest first. [`ClipmapTerrainPicker`] drives a tracer over the finest
//! ready level and tests the two triangles of each visited cell.

use glam::{Vec2, Vec3};
use tessera_common::{Ray3, TerrainTransform};

use crate::clipmap_level::ClipmapLevel;

/// Walks the cells of a regular grid in the XZ plane along a ray.
pub trait GridTracer: Send {
    /// Sets the cell size.
    fn set_grid_spacing(&mut self, spacing: Vec2);

    /// Cell size.
    fn grid_spacing(&self) -> Vec2;

    /// Sets the position of cell `(0, 0)`'s corner.
    fn set_grid_origin(&mut self, origin: Vec2);

    /// Starts a walk at the cell containing the ray origin.
    fn start_walk(&mut self, ray: &Ray3);

    /// Steps to the next cell along the ray.
    fn next(&mut self);

    /// Current cell.
    fn grid_location(&self) -> (i32, i32);

    /// Ray parameter at which the walk entered the current cell.
    fn total_traveled(&self) -> f32;

    /// Returns `true` if the ray is vertical and visits a single cell.
    fn is_ray_perpendicular_to_grid(&self) -> bool;
}

/// Digital differential analyzer over the XZ plane.
#[derive(Debug, Clone)]
pub struct BresenhamTracer {
    spacing: Vec2,
    origin: Vec2,
    cell: (i32, i32),
    step: (i32, i32),
    t_max: Vec2,
    t_delta: Vec2,
    traveled: f32,
    perpendicular: bool,
}

impl Default for BresenhamTracer {
    fn default() -> Self {
        Self {
            spacing: Vec2::ONE,
            origin: Vec2::ZERO,
            cell: (0, 0),
            step: (0, 0),
            t_max: Vec2::splat(f32::INFINITY),
            t_delta: Vec2::splat(f32::INFINITY),
            traveled: 0.0,
            perpendicular: false,
        }
    }
}

impl BresenhamTracer {
    /// Creates a tracer with unit spacing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Per-axis DDA setup: `(step, t_max, t_delta)`.
fn axis_setup(origin: f32, direction: f32, cell: i32, spacing: f32, grid_origin: f32) -> (i32, f32, f32) {
    if direction.abs() < f32::EPSILON {
        return (0, f32::INFINITY, f32::INFINITY);
    }
    let step = if direction > 0.0 { 1 } else { -1 };
    let boundary = grid_origin + (cell + i32::from(direction > 0.0)) as f32 * spacing;
    let t_max = (boundary - origin) / direction;
    let t_delta = spacing / direction.abs();
    (step, t_max, t_delta)
}

impl GridTracer for BresenhamTracer {
    fn set_grid_spacing(&mut self, spacing: Vec2) {
        self.spacing = spacing;
    }

    fn grid_spacing(&self) -> Vec2 {
        self.spacing
    }

    fn set_grid_origin(&mut self, origin: Vec2) {
        self.origin = origin;
    }

    fn start_walk(&mut self, ray: &Ray3) {
        let start = Vec2::new(ray.origin.x, ray.origin.z);
        let local = (start - self.origin) / self.spacing;
        self.cell = (local.x.floor() as i32, local.y.floor() as i32);
        self.traveled = 0.0;

        let (sx, tx, dx) =
            axis_setup(start.x, ray.direction.x, self.cell.0, self.spacing.x, self.origin.x);
        let (sz, tz, dz) =
            axis_setup(start.y, ray.direction.z, self.cell.1, self.spacing.y, self.origin.y);
        self.step = (sx, sz);
        self.t_max = Vec2::new(tx, tz);
        self.t_delta = Vec2::new(dx, dz);
        self.perpendicular = sx == 0 && sz == 0;
    }

    fn next(&mut self) {
        if self.perpendicular {
            return;
        }
        if self.t_max.x < self.t_max.y {
            self.traveled = self.t_max.x;
            self.cell.0 += self.step.0;
            self.t_max.x += self.t_delta.x;
        } else {
            self.traveled = self.t_max.y;
            self.cell.1 += self.step.1;
            self.t_max.y += self.t_delta.y;
        }
    }

    fn grid_location(&self) -> (i32, i32) {
        self.cell
    }

    fn total_traveled(&self) -> f32 {
        self.traveled
    }

    fn is_ray_perpendicular_to_grid(&self) -> bool {
        self.perpendicular
    }
}

/// A ray hit on the terrain surface, in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PickResult {
    /// Hit point
    pub point: Vec3,
    /// Unit surface normal
    pub normal: Vec3,
    /// Distance from the ray origin
    pub distance: f32,
}

/// Picks against the heights of the finest ready clip level.
pub struct ClipmapTerrainPicker {
    tracer: Box<dyn GridTracer>,
    max_checks: usize,
    initial_spacing: f32,
}

impl ClipmapTerrainPicker {
    /// Creates a picker visiting at most `max_checks` cells per pick.
    ///
    /// `initial_spacing` is the cell size at level 0 in terrain-local units.
    #[must_use]
    pub fn new(tracer: Box<dyn GridTracer>, max_checks: usize, initial_spacing: f32) -> Self {
        Self {
            tracer,
            max_checks,
            initial_spacing,
        }
    }

    /// Cell budget per pick.
    #[must_use]
    pub fn max_checks(&self) -> usize {
        self.max_checks
    }

    /// Intersects a world ray with the terrain.
    pub fn pick(
        &mut self,
        levels: &[ClipmapLevel],
        transform: &TerrainTransform,
        world_ray: &Ray3,
    ) -> Option<PickResult> {
        let clip = levels
            .iter()
            .find(|l| l.is_ready())
            .or_else(|| levels.last())?;
        let cache = clip.cache();
        let height_scale = clip.height_scale();
        let spacing = self.initial_spacing * clip.vertex_distance() as f32;

        // Walk in terrain-local space with the local ray parameter.
        let local_ray = Ray3 {
            origin: transform.world_to_local(world_ray.origin),
            direction: world_ray.direction / transform.scale(),
        };
        self.tracer.set_grid_spacing(Vec2::splat(spacing));
        self.tracer.set_grid_origin(Vec2::ZERO);
        self.tracer.start_walk(&local_ray);

        let height = |x: f32, z: f32| cache.get_sub_height(x, z, true) * height_scale;
        for _ in 0..self.max_checks {
            let (gx, gz) = self.tracer.grid_location();
            let x0 = gx as f32 * spacing;
            let z0 = gz as f32 * spacing;
            let x1 = x0 + spacing;
            let z1 = z0 + spacing;
            let p00 = Vec3::new(x0, height(x0, z0), z0);
            let p01 = Vec3::new(x0, height(x0, z1), z1);
            let p10 = Vec3::new(x1, height(x1, z0), z0);
            let p11 = Vec3::new(x1, height(x1, z1), z1);

            let hits = [(p00, p01, p10), (p10, p01, p11)]
                .into_iter()
                .filter_map(|(a, b, c)| local_ray.intersect_triangle(a, b, c).map(|t| (t, a, b, c)));
            let nearest = hits.min_by(|l, r| l.0.total_cmp(&r.0));
            if let Some((t, a, b, c)) = nearest {
                let local_point = local_ray.at(t);
                let local_normal = (b - a).cross(c - a);
                let point = transform.local_to_world(local_point);
                let normal = (local_normal / transform.scale()).normalize_or_zero();
                return Some(PickResult {
                    point,
                    normal,
                    distance: point.distance(world_ray.origin),
                });
            }

            if self.tracer.is_ray_perpendicular_to_grid() {
                break;
            }
            self.tracer.next();
        }
        None
    }
}

impl std::fmt::Debug for ClipmapTerrainPicker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipmapTerrainPicker")
            .field("max_checks", &self.max_checks)
            .field("initial_spacing", &self.initial_spacing)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TerrainCache;
    use crate::clipmap_level::tests::flat_cache;

    #[test]
    fn test_tracer_walks_cells_in_order() {
        let mut tracer = BresenhamTracer::new();
        tracer.set_grid_spacing(Vec2::splat(2.0));
        tracer.start_walk(&Ray3::new(Vec3::new(1.0, 10.0, 1.0), Vec3::new(1.0, -0.1, 0.0)));
        assert_eq!(tracer.grid_location(), (0, 0));
        tracer.next();
        assert_eq!(tracer.grid_location(), (1, 0));
        tracer.next();
        assert_eq!(tracer.grid_location(), (2, 0));
        assert!(tracer.total_traveled() > 2.9);
        assert!(!tracer.is_ray_perpendicular_to_grid());
    }

    #[test]
    fn test_tracer_diagonal_negative() {
        let mut tracer = BresenhamTracer::new();
        tracer.start_walk(&Ray3::new(Vec3::new(0.5, 0.0, 0.25), Vec3::new(-1.0, 0.0, -1.0)));
        tracer.next();
        assert_eq!(tracer.grid_location(), (0, -1));
        tracer.next();
        assert_eq!(tracer.grid_location(), (-1, -1));
    }

    #[test]
    fn test_vertical_ray_is_perpendicular() {
        let mut tracer = BresenhamTracer::new();
        tracer.start_walk(&Ray3::new(Vec3::new(3.5, 5.0, -1.5), Vec3::NEG_Y));
        assert!(tracer.is_ray_perpendicular_to_grid());
        assert_eq!(tracer.grid_location(), (3, -2));
        tracer.next();
        assert_eq!(tracer.grid_location(), (3, -2));
    }

    #[test]
    fn test_pick_flat_terrain() {
        let cache = flat_cache(0, 8, 17);
        let mut clip =
            ClipmapLevel::new(cache.clone(), 17, 2.0, (0.0, 1.0), true).expect("valid size");
        clip.update_vertices(Vec3::ZERO);
        cache.check_for_updates();
        assert!(clip.is_ready());

        let transform = TerrainTransform {
            horizontal_scale: Vec2::new(2.0, 2.0),
            translation: Vec3::new(0.0, 1.0, 0.0),
        };
        let mut picker = ClipmapTerrainPicker::new(Box::new(BresenhamTracer::new()), 64, 1.0);
        let levels = [clip];

        let down = Ray3::new(Vec3::new(3.0, 10.0, 5.0), Vec3::NEG_Y);
        let hit = picker.pick(&levels, &transform, &down).expect("hit");
        assert!((hit.point - Vec3::new(3.0, 3.0, 5.0)).length() < 1e-4);
        assert!((hit.distance - 7.0).abs() < 1e-4);
        assert!((hit.normal - Vec3::Y).length() < 1e-4);

        let slanted = Ray3::new(Vec3::new(0.0, 10.0, 0.0), Vec3::new(1.0, -1.0, 0.0));
        let hit = picker.pick(&levels, &transform, &slanted).expect("hit");
        assert!((hit.point.y - 3.0).abs() < 1e-4);
        assert!((hit.point.x - 7.0).abs() < 1e-3);

        let up = Ray3::new(Vec3::new(0.0, 10.0, 0.0), Vec3::Y);
        assert!(picker.pick(&levels, &transform, &up).is_none());
    }
}
