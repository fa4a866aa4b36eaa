//! Minimal sphere/cube scene and its GPU layout.

use bytemuck::{Pod, Zeroable};

use crate::selector::SceneCharacteristics;
use crate::util::Vec3;

/// Primitive shape; the discriminant is the GPU `primitive_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    Sphere = 0,
    Cube = 1,
}

/// Surface response, encoded as `material_flag` on the GPU.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Material {
    Diffuse,
    Metallic,
    /// Light source with the given strength (> 0, != 1)
    Emissive(f32),
}

impl Material {
    pub fn flag(self) -> f32 {
        match self {
            Self::Diffuse => 0.0,
            Self::Metallic => 1.0,
            Self::Emissive(s) => s,
        }
    }

    pub fn from_flag(flag: f32) -> Self {
        if flag <= 0.0 {
            Self::Diffuse
        } else if flag == 1.0 {
            Self::Metallic
        } else {
            Self::Emissive(flag)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Primitive {
    pub kind: PrimitiveKind,
    pub center: Vec3,
    /// Sphere radius or cube edge length
    pub size: f32,
    pub albedo: Vec3,
    pub material: Material,
}

impl Primitive {
    pub fn sphere(center: Vec3, radius: f32, albedo: Vec3, material: Material) -> Self {
        Self { kind: PrimitiveKind::Sphere, center, size: radius, albedo, material }
    }

    pub fn cube(center: Vec3, size: f32, albedo: Vec3, material: Material) -> Self {
        Self { kind: PrimitiveKind::Cube, center, size, albedo, material }
    }

    pub fn to_gpu(&self) -> GpuPrimitive {
        GpuPrimitive {
            center_size: [self.center.x, self.center.y, self.center.z, self.size],
            albedo_material: [self.albedo.x, self.albedo.y, self.albedo.z, self.material.flag()],
            kind: [self.kind as u32 as f32, 0.0, 0.0, 0.0],
        }
    }
}

/// 48-byte per-primitive record:
/// `[center.xyz, size]`, `[albedo.rgb, material_flag]`, `[type, 0, 0, 0]`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuPrimitive {
    pub center_size: [f32; 4],
    pub albedo_material: [f32; 4],
    pub kind: [f32; 4],
}

impl GpuPrimitive {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn to_primitive(&self) -> Primitive {
        let [x, y, z, size] = self.center_size;
        let [r, g, b, flag] = self.albedo_material;
        Primitive {
            kind: if self.kind[0] >= 0.5 { PrimitiveKind::Cube } else { PrimitiveKind::Sphere },
            center: Vec3::new(x, y, z),
            size,
            albedo: Vec3::new(r, g, b),
            material: Material::from_flag(flag),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    pub primitives: Vec<Primitive>,
}

impl Scene {
    pub fn new(primitives: Vec<Primitive>) -> Self {
        Self { primitives }
    }

    /// Ground sphere, three material spheres, a cube and a light.
    pub fn demo() -> Self {
        Self::new(vec![
            Primitive::sphere(Vec3::new(0.0, -100.5, -1.0), 100.0, Vec3::new(0.8, 0.8, 0.0), Material::Diffuse),
            Primitive::sphere(Vec3::new(0.0, 0.0, -1.2), 0.5, Vec3::new(0.1, 0.2, 0.5), Material::Diffuse),
            Primitive::sphere(Vec3::new(-1.0, 0.0, -1.0), 0.5, Vec3::new(0.8, 0.8, 0.8), Material::Metallic),
            Primitive::cube(Vec3::new(1.0, -0.1, -1.0), 0.7, Vec3::new(0.8, 0.3, 0.3), Material::Diffuse),
            Primitive::sphere(Vec3::new(0.0, 2.0, -1.0), 0.5, Vec3::ONE, Material::Emissive(4.0)),
        ])
    }

    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    pub fn to_gpu(&self) -> Vec<GpuPrimitive> {
        self.primitives.iter().map(Primitive::to_gpu).collect()
    }

    /// Scene buffer size: `count * 12 * 4`.
    pub fn gpu_bytes(&self) -> u64 {
        (self.primitives.len() * GpuPrimitive::SIZE) as u64
    }

    /// Workload description for the selector.
    pub fn characteristics(&self, width: u32, height: u32, samples: u32) -> SceneCharacteristics {
        let metallic = self.primitives.iter().any(|p| p.material == Material::Metallic);
        SceneCharacteristics::new(width, height, samples, self.primitives.len() as u32)
            .with_complex_materials(metallic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_record_layout() {
        assert_eq!(GpuPrimitive::SIZE, 12 * 4);
        let p = Primitive::cube(Vec3::new(1.0, 2.0, 3.0), 0.5, Vec3::new(0.1, 0.2, 0.3), Material::Emissive(3.0));
        let g = p.to_gpu();
        let floats: &[f32] = bytemuck::cast_slice(std::slice::from_ref(&g));
        assert_eq!(floats, &[1.0, 2.0, 3.0, 0.5, 0.1, 0.2, 0.3, 3.0, 1.0, 0.0, 0.0, 0.0]);
        assert_eq!(g.to_primitive(), p);
    }

    #[test]
    fn test_material_flags() {
        assert_eq!(Material::from_flag(0.0), Material::Diffuse);
        assert_eq!(Material::from_flag(1.0), Material::Metallic);
        assert_eq!(Material::from_flag(5.0), Material::Emissive(5.0));
    }

    #[test]
    fn test_demo_scene() {
        let s = Scene::demo();
        assert_eq!(s.gpu_bytes(), s.len() as u64 * 48);
        let c = s.characteristics(64, 32, 4);
        assert!(c.has_complex_materials);
        assert_eq!(c.primitive_count, 5);
    }
}
