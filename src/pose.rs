use nalgebra as na;
use std::ops::{Add, Div, Sub};

/// 6-DoF rigid transform: translation in metres plus an axis-angle rotation
/// in radians, matching the rvec/tvec convention of the PnP solver.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub rx: f64,
    pub ry: f64,
    pub rz: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, z: f64, rx: f64, ry: f64, rz: f64) -> Pose {
        Pose { x, y, z, rx, ry, rz }
    }

    pub fn from_rvec_tvec(rvec: (f64, f64, f64), tvec: (f64, f64, f64)) -> Pose {
        Pose::new(tvec.0, tvec.1, tvec.2, rvec.0, rvec.1, rvec.2)
    }

    pub fn from_isometry(iso: &na::Isometry3<f64>) -> Pose {
        let t = iso.translation.vector;
        let r = iso.rotation.scaled_axis();
        Pose::new(t.x, t.y, t.z, r.x, r.y, r.z)
    }

    pub fn to_isometry(&self) -> na::Isometry3<f64> {
        na::Isometry3::new(
            na::Vector3::new(self.x, self.y, self.z),
            na::Vector3::new(self.rx, self.ry, self.rz),
        )
    }

    pub fn translation(&self) -> na::Vector3<f64> {
        na::Vector3::new(self.x, self.y, self.z)
    }

    pub fn rotation_matrix(&self) -> na::Matrix3<f64> {
        na::Rotation3::new(na::Vector3::new(self.rx, self.ry, self.rz)).into_inner()
    }

    /// 4x4 homogeneous matrix, rotation in the upper-left block.
    pub fn to_homogeneous(&self) -> na::Matrix4<f64> {
        self.to_isometry().to_homogeneous()
    }

    pub fn to_vector(&self) -> na::Vector6<f64> {
        na::Vector6::new(self.x, self.y, self.z, self.rx, self.ry, self.rz)
    }

    pub fn from_vector(v: &na::Vector6<f64>) -> Pose {
        Pose::new(v[0], v[1], v[2], v[3], v[4], v[5])
    }

    /// Inverse transform: transposed rotation, negated rotated translation.
    pub fn inverse(&self) -> Pose {
        Pose::from_isometry(&self.to_isometry().inverse())
    }

    /// Rotation angle magnitude in radians.
    pub fn angle(&self) -> f64 {
        (self.rx * self.rx + self.ry * self.ry + self.rz * self.rz).sqrt()
    }
}

// Component-wise arithmetic so consumers can accumulate pose statistics
// over frames. Axis-angle averaging is approximate for large spreads.
impl Add for Pose {
    type Output = Pose;
    fn add(self, o: Pose) -> Pose {
        Pose::new(
            self.x + o.x,
            self.y + o.y,
            self.z + o.z,
            self.rx + o.rx,
            self.ry + o.ry,
            self.rz + o.rz,
        )
    }
}

impl Sub for Pose {
    type Output = Pose;
    fn sub(self, o: Pose) -> Pose {
        Pose::new(
            self.x - o.x,
            self.y - o.y,
            self.z - o.z,
            self.rx - o.rx,
            self.ry - o.ry,
            self.rz - o.rz,
        )
    }
}

impl Div<f64> for Pose {
    type Output = Pose;
    fn div(self, d: f64) -> Pose {
        Pose::new(
            self.x / d,
            self.y / d,
            self.z / d,
            self.rx / d,
            self.ry / d,
            self.rz / d,
        )
    }
}
