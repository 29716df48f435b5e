use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops;

/// Point or vector in the sagittal plane: `x` forward, `z` up.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub z: f64,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, z: 0.0 };

    pub fn new(x: f64, z: f64) -> Self {
        Vec2 { x, z }
    }

    pub fn norm(&self) -> f64 {
        self.x.hypot(self.z)
    }

    pub fn dot(&self, rhs: Vec2) -> f64 {
        self.x * rhs.x + self.z * rhs.z
    }

    /// Heading of this vector measured counter-clockwise from +x.
    pub fn angle(&self) -> f64 {
        self.z.atan2(self.x)
    }

    /// Unit vector rotated a quarter turn counter-clockwise.
    /// Zero-length input yields zero.
    pub fn ccw_normal(&self) -> Vec2 {
        let n = self.norm();
        if n < 1e-12 {
            return Vec2::ZERO;
        }
        Vec2::new(-self.z / n, self.x / n)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.z.is_finite()
    }

    /// `(x, y, z)` with `y = 0`, the layout used by trace files.
    pub fn to_xyz(&self) -> (f64, f64, f64) {
        (self.x, 0.0, self.z)
    }
}

impl ops::Add for Vec2 {
    type Output = Vec2;
    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.z + rhs.z)
    }
}

impl ops::AddAssign for Vec2 {
    fn add_assign(&mut self, rhs: Vec2) {
        self.x += rhs.x;
        self.z += rhs.z;
    }
}

impl ops::Sub for Vec2 {
    type Output = Vec2;
    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.z - rhs.z)
    }
}

impl ops::SubAssign for Vec2 {
    fn sub_assign(&mut self, rhs: Vec2) {
        self.x -= rhs.x;
        self.z -= rhs.z;
    }
}

impl ops::Mul<f64> for Vec2 {
    type Output = Vec2;
    fn mul(self, k: f64) -> Vec2 {
        Vec2::new(self.x * k, self.z * k)
    }
}

impl ops::Div<f64> for Vec2 {
    type Output = Vec2;
    fn div(self, k: f64) -> Vec2 {
        Vec2::new(self.x / k, self.z / k)
    }
}

impl ops::Neg for Vec2 {
    type Output = Vec2;
    fn neg(self) -> Vec2 {
        Vec2::new(-self.x, -self.z)
    }
}

impl fmt::Display for Vec2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.4}, {:.4})", self.x, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ccw_normal_is_perpendicular() {
        let v = Vec2::new(3.0, 4.0);
        let n = v.ccw_normal();
        assert!(v.dot(n).abs() < 1e-12);
        assert!((n.norm() - 1.0).abs() < 1e-12);
        // quarter turn counter-clockwise of +x is +z
        assert_eq!(Vec2::new(2.0, 0.0).ccw_normal(), Vec2::new(-0.0, 1.0));
    }

    #[test]
    fn test_zero_normal() {
        assert_eq!(Vec2::ZERO.ccw_normal(), Vec2::ZERO);
    }
}
