//! Path tracing kernel shared by the CPU renderer and the software GPU backend.
//!
//! The random sequence is a stateless PCG hash seeded from the pixel and the
//! global sample index, so the same (pixel, sample) pair yields the same
//! path on every backend. `shaders/pathtrace.wgsl` mirrors this file.

use super::camera::Camera;
use super::scene::{Material, Primitive, PrimitiveKind};
use crate::util::{reflect, Aabb, Ray, Vec3};

const T_MIN: f32 = 1e-3;

/// PCG hash (one round).
#[inline]
pub fn pcg_hash(v: u32) -> u32 {
    let state = v.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277_803_737);
    (word >> 22) ^ word
}

/// Per-path random stream.
#[derive(Debug, Clone, Copy)]
pub struct Rng(u32);

impl Rng {
    /// Seed for pixel `(x, y)` of a `width`-wide image and global sample index.
    pub fn for_sample(x: u32, y: u32, width: u32, sample: u32) -> Self {
        let pixel = y.wrapping_mul(width).wrapping_add(x);
        Self(pcg_hash(pixel ^ pcg_hash(sample.wrapping_add(0x9E37_79B9))))
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        self.0 = pcg_hash(self.0);
        self.0
    }

    /// Uniform in [0, 1).
    #[inline]
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / 16_777_216.0
    }

    /// Uniform direction on the unit sphere.
    pub fn unit_vector(&mut self) -> Vec3 {
        let z = self.next_f32() * 2.0 - 1.0;
        let a = self.next_f32() * std::f32::consts::TAU;
        let r = (1.0 - z * z).max(0.0).sqrt();
        Vec3::new(r * a.cos(), r * a.sin(), z)
    }
}

/// Closest intersection.
#[derive(Debug, Clone, Copy)]
pub struct Hit {
    pub t: f32,
    pub point: Vec3,
    /// Facing against the ray
    pub normal: Vec3,
    pub index: usize,
}

fn hit_sphere(center: Vec3, radius: f32, ray: &Ray, t_max: f32) -> Option<(f32, Vec3)> {
    let oc = ray.origin - center;
    let a = ray.direction.length_squared();
    let half_b = oc.dot(ray.direction);
    let c = oc.length_squared() - radius * radius;
    let disc = half_b * half_b - a * c;
    if disc < 0.0 {
        return None;
    }
    let sq = disc.sqrt();
    let mut t = (-half_b - sq) / a;
    if t < T_MIN || t > t_max {
        t = (-half_b + sq) / a;
        if t < T_MIN || t > t_max {
            return None;
        }
    }
    Some((t, (ray.at(t) - center) / radius))
}

/// Closest primitive hit along `ray`.
pub fn intersect(primitives: &[Primitive], ray: &Ray) -> Option<Hit> {
    let mut closest = f32::MAX;
    let mut best = None;
    for (index, p) in primitives.iter().enumerate() {
        let found = match p.kind {
            PrimitiveKind::Sphere => hit_sphere(p.center, p.size, ray, closest),
            PrimitiveKind::Cube => {
                let aabb = Aabb::cube(p.center, p.size);
                aabb.hit(ray, T_MIN, closest).map(|t| (t, aabb.normal_at(ray.at(t))))
            }
        };
        if let Some((t, outward)) = found {
            closest = t;
            let normal = if outward.dot(ray.direction) > 0.0 { -outward } else { outward };
            best = Some(Hit { t, point: ray.at(t), normal, index });
        }
    }
    best
}

/// Background gradient.
#[inline]
pub fn sky(direction: Vec3) -> Vec3 {
    let t = 0.5 * (direction.normalize_or_zero().y + 1.0);
    Vec3::ONE * (1.0 - t) + Vec3::new(0.5, 0.7, 1.0) * t
}

/// Radiance along one path.
pub fn trace_path(primitives: &[Primitive], mut ray: Ray, max_depth: u32, rng: &mut Rng) -> Vec3 {
    let mut throughput = Vec3::ONE;
    let mut radiance = Vec3::ZERO;
    for _ in 0..max_depth {
        let Some(hit) = intersect(primitives, &ray) else {
            radiance += throughput * sky(ray.direction);
            break;
        };
        let p = &primitives[hit.index];
        match p.material {
            Material::Emissive(strength) => {
                radiance += throughput * p.albedo * strength;
                break;
            }
            Material::Diffuse => {
                let mut dir = hit.normal + rng.unit_vector();
                if dir.length_squared() < 1e-8 {
                    dir = hit.normal;
                }
                ray = Ray::new(hit.point, dir);
            }
            Material::Metallic => {
                ray = Ray::new(hit.point, reflect(ray.direction.normalize_or_zero(), hit.normal));
            }
        }
        throughput *= p.albedo;
    }
    radiance
}

/// One sample of pixel `(x, y)`; row 0 is the top of the image.
pub fn sample_pixel(
    primitives: &[Primitive],
    camera: &Camera,
    width: u32,
    height: u32,
    x: u32,
    y: u32,
    sample: u32,
    max_depth: u32,
) -> Vec3 {
    let mut rng = Rng::for_sample(x, y, width, sample);
    let u = (x as f32 + rng.next_f32()) / width as f32;
    let v = ((height - 1 - y) as f32 + rng.next_f32()) / height as f32;
    trace_path(primitives, camera.ray(u, v), max_depth, &mut rng)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rng_deterministic_and_uniform() {
        let mut a = Rng::for_sample(3, 4, 64, 7);
        let mut b = Rng::for_sample(3, 4, 64, 7);
        assert_eq!(a.next_u32(), b.next_u32());
        let mut c = Rng::for_sample(3, 4, 64, 8);
        assert_ne!(Rng::for_sample(3, 4, 64, 7).next_u32(), c.next_u32());

        let mean = (0..10_000).map(|_| a.next_f32()).sum::<f32>() / 10_000.0;
        assert!((mean - 0.5).abs() < 0.02);
    }

    #[test]
    fn test_intersect_closest() {
        let prims = [
            Primitive::sphere(Vec3::new(0.0, 0.0, -10.0), 1.0, Vec3::ONE, Material::Diffuse),
            Primitive::cube(Vec3::new(0.0, 0.0, -4.0), 2.0, Vec3::ONE, Material::Diffuse),
        ];
        let hit = intersect(&prims, &Ray::new(Vec3::ZERO, Vec3::NEG_Z)).unwrap();
        assert_eq!(hit.index, 1);
        assert!((hit.t - 3.0).abs() < 1e-5);
        assert_eq!(hit.normal, Vec3::Z);
    }

    #[test]
    fn test_miss_returns_sky() {
        let cam = Camera::look_at(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y, 60.0, 1.0);
        let c = sample_pixel(&[], &cam, 4, 4, 1, 1, 0, 4);
        assert!(c.x > 0.5 && c.z >= c.x);
    }

    #[test]
    fn test_emitter_is_bright() {
        let prims = [Primitive::sphere(Vec3::new(0.0, 0.0, -3.0), 1.0, Vec3::ONE, Material::Emissive(4.0))];
        let cam = Camera::look_at(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y, 20.0, 1.0);
        let c = sample_pixel(&prims, &cam, 8, 8, 4, 4, 0, 4);
        assert_eq!(c, Vec3::splat(4.0));
    }
}
