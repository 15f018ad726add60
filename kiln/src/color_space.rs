use crate::maths::*;

pub trait Gamma {
    fn into_linear(self) -> Self;
    fn into_gamma(self) -> Self;
}

impl Gamma for f32 {
    fn into_linear(self) -> Self {
        if self < 0.04045 {
            self / 12.92
        } else {
            ((self + 0.055) / 1.055).powf(2.4)
        }
    }

    fn into_gamma(self) -> Self {
        if self < 0.0031308 {
            self * 12.92
        } else {
            (self.powf(1.0 / 2.4) * 1.055) - 0.055
        }
    }
}

impl Gamma for Vec3 {
    fn into_linear(self) -> Self {
        self.map(|x: f32| x.into_linear())
    }

    fn into_gamma(self) -> Self {
        self.map(|x: f32| x.into_gamma())
    }
}

// assumes Rec709 primaries
pub trait Luminance {
    fn luminance(&self) -> f32;
}

impl Luminance for Vec3 {
    #[allow(clippy::excessive_precision)]
    fn luminance(&self) -> f32 {
        self.dot(Vec3::new(0.2126729, 0.7151522, 0.0721750))
    }
}

fn unorm8(x: f32) -> u8 {
    (x.max(0.0).min(1.0) * 255.0 + 0.5) as u8
}

/// Encodes linear radiance for an 8-bit display target, alpha is opaque.
pub fn srgb8_from_linear(c: Vec3) -> [u8; 4] {
    let c = c.into_gamma();
    [unorm8(c.x), unorm8(c.y), unorm8(c.z), 255]
}

pub fn linear_from_srgb8(c: [u8; 4]) -> Vec3 {
    Vec3::new(c[0] as f32, c[1] as f32, c[2] as f32).map(|x| (x / 255.0).into_linear())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srgb_round_trip_endpoints() {
        assert_eq!(srgb8_from_linear(Vec3::zero()), [0, 0, 0, 255]);
        assert_eq!(srgb8_from_linear(Vec3::one()), [255, 255, 255, 255]);
        assert_eq!(srgb8_from_linear(Vec3::broadcast(4.0)), [255, 255, 255, 255]);
        assert_eq!(srgb8_from_linear(Vec3::broadcast(0.5))[0], 188);
        let c = linear_from_srgb8([188, 0, 255, 255]);
        assert!((c.x - 0.5).abs() < 0.01);
        assert_eq!(c.y, 0.0);
        assert!((c.z - 1.0).abs() < 1.0e-6);
    }
}
