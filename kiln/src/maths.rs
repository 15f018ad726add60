use bytemuck::{Pod, Zeroable};
pub use ultraviolet as uv;

pub type Vec2 = uv::Vec2;
pub type Vec3 = uv::Vec3;
pub type Vec4 = uv::Vec4;
pub type UVec2 = uv::UVec2;
pub type UVec3 = uv::UVec3;

pub type Mat3 = uv::Mat3;
pub type Mat4 = uv::Mat4;

pub trait DivRoundUp {
    fn div_round_up(&self, divisor: u32) -> Self;
}

impl DivRoundUp for u32 {
    fn div_round_up(&self, divisor: u32) -> Self {
        (*self + divisor - 1) / divisor
    }
}

impl DivRoundUp for UVec2 {
    fn div_round_up(&self, divisor: u32) -> Self {
        (*self + Self::broadcast(divisor - 1)) / divisor
    }
}

/// Rounds `n` up to a multiple of `a`, which must be a power of two.
pub fn align_up(n: u32, a: u32) -> u32 {
    (n + a - 1) & !(a - 1)
}

pub fn align_up_usize(n: usize, a: usize) -> usize {
    (n + a - 1) & !(a - 1)
}

/// Affine transform stored as 3 rows of 4, the layout used by instance records.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Zeroable, Pod)]
pub struct Transform3x4(pub [f32; 12]);

impl Transform3x4 {
    pub fn identity() -> Self {
        Self([1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0])
    }

    /// Drops the last row of a column-major matrix.
    pub fn from_mat4(m: &Mat4) -> Self {
        let [c0, c1, c2, c3] = m.cols;
        Self([
            c0.x, c1.x, c2.x, c3.x, //
            c0.y, c1.y, c2.y, c3.y, //
            c0.z, c1.z, c2.z, c3.z,
        ])
    }

    pub fn into_mat4(self) -> Mat4 {
        let t = self.0;
        Mat4::new(
            Vec4::new(t[0], t[4], t[8], 0.0),
            Vec4::new(t[1], t[5], t[9], 0.0),
            Vec4::new(t[2], t[6], t[10], 0.0),
            Vec4::new(t[3], t[7], t[11], 1.0),
        )
    }

    pub fn transform_point(&self, p: Vec3) -> Vec3 {
        let t = &self.0;
        Vec3::new(
            t[0] * p.x + t[1] * p.y + t[2] * p.z + t[3],
            t[4] * p.x + t[5] * p.y + t[6] * p.z + t[7],
            t[8] * p.x + t[9] * p.y + t[10] * p.z + t[11],
        )
    }

    pub fn transform_vector(&self, v: Vec3) -> Vec3 {
        let t = &self.0;
        Vec3::new(
            t[0] * v.x + t[1] * v.y + t[2] * v.z,
            t[4] * v.x + t[5] * v.y + t[6] * v.z,
            t[8] * v.x + t[9] * v.y + t[10] * v.z,
        )
    }

    /// Returns `None` for singular transforms.
    pub fn inversed(&self) -> Option<Self> {
        let m = self.into_mat4();
        if m.determinant().abs() < 1.0e-12 {
            None
        } else {
            Some(Self::from_mat4(&m.inversed()))
        }
    }
}

impl Default for Transform3x4 {
    fn default() -> Self {
        Self::identity()
    }
}

pub fn vec4_from_vec3(v: Vec3, w: f32) -> Vec4 {
    Vec4::new(v.x, v.y, v.z, w)
}

pub fn vec3_from_vec4(v: Vec4) -> Vec3 {
    Vec3::new(v.x, v.y, v.z)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_major_layout() {
        let m = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let t = Transform3x4::from_mat4(&m);
        assert_eq!(t.0[3], 1.0);
        assert_eq!(t.0[7], 2.0);
        assert_eq!(t.0[11], 3.0);
        assert_eq!(t.transform_point(Vec3::zero()), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(t.transform_vector(Vec3::unit_x()), Vec3::unit_x());
        assert_eq!(t.into_mat4(), m);
    }

    #[test]
    fn inverse_of_translation() {
        let t = Transform3x4::from_mat4(&Mat4::from_translation(Vec3::new(0.0, -4.0, 2.0)));
        let inv = t.inversed().unwrap();
        let p = inv.transform_point(t.transform_point(Vec3::new(0.5, 0.25, 1.0)));
        assert!((p - Vec3::new(0.5, 0.25, 1.0)).mag() < 1.0e-6);
        assert!(Transform3x4([0.0; 12]).inversed().is_none());
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(33, 32), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up_usize(1, 16), 16);
        assert_eq!(17u32.div_round_up(8), 3);
    }
}
