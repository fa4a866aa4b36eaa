//! Math type re-exports and ray-tracing primitives.
//!
//! Re-exports the `glam` types used across the crate and provides the
//! small set of geometric helpers shared by the CPU tracer.

pub use glam::{UVec3, Vec3, Vec4};

/// A ray with origin and (not necessarily normalized) direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

impl Ray {
    #[inline]
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self { origin, direction }
    }

    /// Point along the ray at parameter `t`.
    #[inline]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Empty box (inverted, expands on first point).
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    #[inline]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Cube centered at `center` with edge length `size`.
    #[inline]
    pub fn cube(center: Vec3, size: f32) -> Self {
        let half = Vec3::splat(size * 0.5);
        Self { min: center - half, max: center + half }
    }

    /// Check if this box has no volume.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Expand this box to include another box.
    #[inline]
    pub fn expand_by_box(&mut self, other: &Self) {
        if !other.is_empty() {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Slab test. Returns the entry distance inside `[t_min, t_max]`.
    pub fn hit(&self, ray: &Ray, t_min: f32, t_max: f32) -> Option<f32> {
        let inv = ray.direction.recip();
        let t0 = (self.min - ray.origin) * inv;
        let t1 = (self.max - ray.origin) * inv;
        let near = t0.min(t1).max_element();
        let far = t0.max(t1).min_element();
        if near > far || far < t_min || near > t_max {
            return None;
        }
        // Origin inside the box: report the exit point.
        let t = if near >= t_min { near } else { far };
        (t <= t_max && t >= t_min).then_some(t)
    }

    /// Outward normal of the face closest to `p`.
    pub fn normal_at(&self, p: Vec3) -> Vec3 {
        let c = self.center();
        let half = (self.max - self.min) * 0.5;
        let d = (p - c) / half.max(Vec3::splat(1e-6));
        let a = d.abs();
        if a.x >= a.y && a.x >= a.z {
            Vec3::new(d.x.signum(), 0.0, 0.0)
        } else if a.y >= a.z {
            Vec3::new(0.0, d.y.signum(), 0.0)
        } else {
            Vec3::new(0.0, 0.0, d.z.signum())
        }
    }
}

/// Reflect `v` about normal `n`.
#[inline]
pub fn reflect(v: Vec3, n: Vec3) -> Vec3 {
    v - 2.0 * v.dot(n) * n
}
