//! Pinhole camera producing the image-plane basis uploaded to the kernel.

use crate::util::{Ray, Vec3};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    /// World position of the image plane's lower-left corner
    pub lower_left: Vec3,
    pub horizontal: Vec3,
    pub vertical: Vec3,
}

impl Camera {
    /// Camera at `from` looking at `at`, vertical field of view in degrees.
    pub fn look_at(from: Vec3, at: Vec3, up: Vec3, vfov_deg: f32, aspect: f32) -> Self {
        let h = (vfov_deg.to_radians() * 0.5).tan();
        let viewport_h = 2.0 * h;
        let viewport_w = aspect * viewport_h;

        let w = (from - at).normalize_or_zero();
        let u = up.cross(w).normalize_or_zero();
        let v = w.cross(u);

        let horizontal = viewport_w * u;
        let vertical = viewport_h * v;
        Self {
            position: from,
            lower_left: from - horizontal * 0.5 - vertical * 0.5 - w,
            horizontal,
            vertical,
        }
    }

    /// Default view of [`Scene::demo`](super::Scene::demo).
    pub fn demo(aspect: f32) -> Self {
        Self::look_at(Vec3::new(0.0, 0.5, 1.5), Vec3::new(0.0, 0.0, -1.0), Vec3::Y, 60.0, aspect)
    }

    /// Ray through normalized image coordinates (`u` right, `v` up).
    #[inline]
    pub fn ray(&self, u: f32, v: f32) -> Ray {
        let target = self.lower_left + u * self.horizontal + v * self.vertical;
        Ray::new(self.position, target - self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_ray_hits_target() {
        let cam = Camera::look_at(Vec3::ZERO, Vec3::new(0.0, 0.0, -5.0), Vec3::Y, 90.0, 2.0);
        let r = cam.ray(0.5, 0.5);
        assert!((r.direction.normalize() - Vec3::NEG_Z).length() < 1e-5);
        assert!((cam.horizontal.length() - 4.0).abs() < 1e-5);
        assert!((cam.vertical.length() - 2.0).abs() < 1e-5);
    }
}
