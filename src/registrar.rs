use glam::{Vec2, Vec3};
use log::debug;
use nalgebra as na;
use rand::seq::SliceRandom;

use crate::error::{CoreError, Result};
use crate::pose::Pose;

pub const REPROJ_THRESHOLD_MIN: f64 = 0.0;
pub const REPROJ_THRESHOLD_MAX: f64 = 10.0;
const RANSAC_ITERS: usize = 500;
const MIN_HOMOGRAPHY_POINTS: usize = 4;
const MIN_POSE_INLIERS: usize = 6;

/// 3x3 projective transform plus its validity flag. Identity when invalid.
#[derive(Debug, Clone, Copy)]
pub struct Homography {
    pub mat: na::Matrix3<f64>,
    pub valid: bool,
}

impl Default for Homography {
    fn default() -> Self {
        Homography {
            mat: na::Matrix3::identity(),
            valid: false,
        }
    }
}

/// Indices into the correspondence arrays (not the feature sets) whose
/// reprojected model point lands within the threshold of its scene point.
#[derive(Debug, Clone, Default)]
pub struct InlierSet {
    pub indices: Vec<usize>,
    pub mean_error: f64,
}

impl InlierSet {
    pub fn count(&self) -> usize {
        self.indices.len()
    }
}

/// Pinhole calibration: 3x3 intrinsic matrix plus a 0/4/5/8-element
/// radial-tangential distortion vector.
#[derive(Debug, Clone)]
pub struct CameraIntrinsics {
    pub k: na::Matrix3<f64>,
    pub dist: na::DVector<f64>,
}

impl CameraIntrinsics {
    pub fn new(k: na::Matrix3<f64>, dist: na::DVector<f64>) -> Result<CameraIntrinsics> {
        if k[(0, 0)] == 0.0 {
            return Err(CoreError::FileParseFailure {
                detail: "degenerate intrinsic matrix (fx = 0)".to_string(),
            });
        }
        if !matches!(dist.len(), 0 | 4 | 5 | 8) {
            return Err(CoreError::FileParseFailure {
                detail: format!("distortion vector has {} elements (need 0/4/5/8)", dist.len()),
            });
        }
        Ok(CameraIntrinsics { k, dist })
    }

    fn coeff(&self, i: usize) -> f64 {
        if i < self.dist.len() { self.dist[i] } else { 0.0 }
    }

    /// Applies the forward distortion model to a normalized point.
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let (k1, k2, p1, p2) = (self.coeff(0), self.coeff(1), self.coeff(2), self.coeff(3));
        let k3 = self.coeff(4);
        let (k4, k5, k6) = (self.coeff(5), self.coeff(6), self.coeff(7));
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial =
            (1.0 + k1 * r2 + k2 * r4 + k3 * r6) / (1.0 + k4 * r2 + k5 * r4 + k6 * r6);
        let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        (xd, yd)
    }

    /// Pixel coordinates to undistorted normalized coordinates, inverting
    /// the distortion model by fixed-point iteration.
    pub fn undistort_pixel(&self, u: f64, v: f64) -> Vec2 {
        let fx = self.k[(0, 0)];
        let fy = self.k[(1, 1)];
        let cx = self.k[(0, 2)];
        let cy = self.k[(1, 2)];
        let xd = (u - cx) / fx;
        let yd = (v - cy) / fy;
        if self.dist.len() == 0 {
            return Vec2::new(xd as f32, yd as f32);
        }
        let mut x = xd;
        let mut y = yd;
        for _ in 0..8 {
            let (dx, dy) = self.distort(x, y);
            x += xd - dx;
            y += yd - dy;
        }
        Vec2::new(x as f32, y as f32)
    }

    /// Normalized camera-frame point to pixel coordinates, distortion
    /// applied.
    pub fn project_normalized(&self, x: f64, y: f64) -> Vec2 {
        let (xd, yd) = if self.dist.len() == 0 {
            (x, y)
        } else {
            self.distort(x, y)
        };
        let u = self.k[(0, 0)] * xd + self.k[(0, 2)];
        let v = self.k[(1, 1)] * yd + self.k[(1, 2)];
        Vec2::new(u as f32, v as f32)
    }
}

/// Estimates the model-to-scene homography, classifies inliers by
/// reprojection distance and, when the camera is set, solves for the 6-DoF
/// camera pose from the inlier subset.
pub struct Registrar {
    homography: Homography,
    inliers: InlierSet,
    pose: Pose,
    pose_valid: bool,
    compute_pose: bool,
    use_previous_pose: bool,
    ransac_threshold: f64,
    reproj_threshold: f64,
    camera: Option<CameraIntrinsics>,
    scale_m_per_px: f64,
}

impl Default for Registrar {
    fn default() -> Self {
        Registrar {
            homography: Homography::default(),
            inliers: InlierSet::default(),
            pose: Pose::default(),
            pose_valid: false,
            compute_pose: false,
            use_previous_pose: false,
            ransac_threshold: 3.0,
            reproj_threshold: 3.0,
            camera: None,
            scale_m_per_px: 0.0,
        }
    }
}

impl Registrar {
    pub fn new() -> Registrar {
        Registrar::default()
    }

    pub fn homography(&self) -> &Homography {
        &self.homography
    }

    pub fn inliers(&self) -> &InlierSet {
        &self.inliers
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn pose_valid(&self) -> bool {
        self.pose_valid
    }

    /// Camera-to-model direction of the current pose.
    pub fn inverse_pose(&self) -> Pose {
        self.pose.inverse()
    }

    pub fn compute_pose(&self) -> bool {
        self.compute_pose
    }

    /// Enables pose solving; succeeds only when the camera is set.
    pub fn set_compute_pose(&mut self, enabled: bool) -> bool {
        if enabled && !self.is_camera_set() {
            debug!("pose computation rejected: camera not set");
            return false;
        }
        self.compute_pose = enabled;
        if !enabled {
            self.pose_valid = false;
        }
        true
    }

    pub fn use_previous_pose(&self) -> bool {
        self.use_previous_pose
    }

    /// When set, a failed pose solve keeps the last valid pose instead of
    /// invalidating it.
    pub fn set_use_previous_pose(&mut self, enabled: bool) {
        self.use_previous_pose = enabled;
    }

    pub fn ransac_threshold(&self) -> f64 {
        self.ransac_threshold
    }

    /// Reprojection threshold of the robust fit's own inlier/outlier split.
    pub fn set_ransac_threshold(&mut self, threshold: f64) {
        self.ransac_threshold = threshold.clamp(REPROJ_THRESHOLD_MIN, REPROJ_THRESHOLD_MAX);
    }

    pub fn reproj_threshold(&self) -> f64 {
        self.reproj_threshold
    }

    /// Inlier classification threshold in pixels, clamped to [0, 10].
    pub fn set_reproj_threshold(&mut self, threshold: f64) {
        self.reproj_threshold = threshold.clamp(REPROJ_THRESHOLD_MIN, REPROJ_THRESHOLD_MAX);
    }

    pub fn set_camera(&mut self, camera: CameraIntrinsics, scale_m_per_px: f64) {
        self.camera = Some(camera);
        self.scale_m_per_px = scale_m_per_px;
    }

    pub fn clear_camera(&mut self) {
        self.camera = None;
        self.scale_m_per_px = 0.0;
        self.compute_pose = false;
        self.pose_valid = false;
    }

    pub fn camera(&self) -> Option<&CameraIntrinsics> {
        self.camera.as_ref()
    }

    pub fn scale_m_per_px(&self) -> f64 {
        self.scale_m_per_px
    }

    /// Re-derived on every call from the current intrinsics, distortion and
    /// scale; clearing the camera genuinely unsets it.
    pub fn is_camera_set(&self) -> bool {
        match &self.camera {
            Some(c) => {
                c.k[(0, 0)] != 0.0
                    && matches!(c.dist.len(), 0 | 4 | 5 | 8)
                    && self.scale_m_per_px > 0.0
            }
            None => false,
        }
    }

    /// Runs homography estimation, inlier classification and (when enabled)
    /// pose solving over the matched point sequences.
    ///
    /// Too few points is recovered locally: the homography goes invalid and
    /// the inlier set empties, but no error propagates. Absent references
    /// fail typed.
    pub fn update(&mut self, model: Option<&[Vec2]>, scene: Option<&[Vec2]>) -> Result<()> {
        let model = model.ok_or(CoreError::PointsUnset { which: "model" })?;
        let scene = scene.ok_or(CoreError::PointsUnset { which: "scene" })?;

        if model.len() != scene.len() || model.len() < MIN_HOMOGRAPHY_POINTS {
            debug!(
                "registration skipped: {} model / {} scene points",
                model.len(),
                scene.len()
            );
            self.homography = Homography::default();
            self.inliers = InlierSet::default();
            self.invalidate_pose();
            return Ok(());
        }

        match ransac_homography(model, scene, self.ransac_threshold, RANSAC_ITERS) {
            Some(h) => {
                self.homography = Homography { mat: h, valid: true };
            }
            None => {
                debug!("homography estimation failed");
                self.homography = Homography::default();
                self.inliers = InlierSet::default();
                self.invalidate_pose();
                return Ok(());
            }
        }

        // Inlier split under the independently configured threshold.
        let reprojected = reproject_2d(model, &self.homography.mat);
        let mut indices = Vec::new();
        let mut error_sum = 0.0;
        for (i, (rp, sp)) in reprojected.iter().zip(scene.iter()).enumerate() {
            let err = rp.distance(*sp) as f64;
            if err <= self.reproj_threshold {
                indices.push(i);
                error_sum += err;
            }
        }
        let mean_error = if indices.is_empty() {
            0.0
        } else {
            error_sum / indices.len() as f64
        };
        self.inliers = InlierSet { indices, mean_error };

        if self.compute_pose {
            self.solve_pose(model, scene);
        }
        Ok(())
    }

    fn solve_pose(&mut self, model: &[Vec2], scene: &[Vec2]) {
        if !self.is_camera_set() {
            debug!("pose skipped: camera not set");
            self.invalidate_pose();
            return;
        }
        if self.inliers.count() < MIN_POSE_INLIERS {
            debug!(
                "pose skipped: {} inliers (need {})",
                self.inliers.count(),
                MIN_POSE_INLIERS
            );
            self.invalidate_pose();
            return;
        }
        let camera = self.camera.as_ref().unwrap();
        let scale = self.scale_m_per_px as f32;
        let (p3ds, p2ds): (Vec<Vec3>, Vec<Vec2>) = self
            .inliers
            .indices
            .iter()
            .map(|&i| {
                let mp = model[i];
                let sp = scene[i];
                (
                    Vec3::new(mp.x * scale, mp.y * scale, 0.0),
                    camera.undistort_pixel(sp.x as f64, sp.y as f64),
                )
            })
            .unzip();
        match sqpnp_simple::sqpnp_solve_glam(&p3ds, &p2ds) {
            Some((rvec, tvec)) => {
                self.pose = Pose::from_rvec_tvec(rvec, tvec);
                self.pose_valid = true;
            }
            None => {
                debug!("pnp solve failed on {} inliers", p3ds.len());
                self.invalidate_pose();
            }
        }
    }

    fn invalidate_pose(&mut self) {
        if !self.use_previous_pose {
            self.pose_valid = false;
        }
    }
}

/// Reprojects 2D points through a homography.
pub fn reproject_2d(points: &[Vec2], h: &na::Matrix3<f64>) -> Vec<Vec2> {
    points
        .iter()
        .map(|p| {
            let v = h * na::Vector3::new(p.x as f64, p.y as f64, 1.0);
            if v.z.abs() < 1e-12 {
                Vec2::new(f32::MAX, f32::MAX)
            } else {
                Vec2::new((v.x / v.z) as f32, (v.y / v.z) as f32)
            }
        })
        .collect()
}

/// Projects 3D model-frame points into the image under a pose and camera.
pub fn reproject_3d(points: &[Vec3], pose: &Pose, camera: &CameraIntrinsics) -> Vec<Vec2> {
    let iso = pose.to_isometry();
    points
        .iter()
        .map(|p| {
            let pc = iso * na::Point3::new(p.x as f64, p.y as f64, p.z as f64);
            if pc.z <= 1e-9 {
                return Vec2::new(f32::MAX, f32::MAX);
            }
            camera.project_normalized(pc.x / pc.z, pc.y / pc.z)
        })
        .collect()
}

/// Robust homography fit: RANSAC over 4-point DLT samples scored by
/// forward reprojection distance, then a least-squares refit over the best
/// consensus set.
pub fn ransac_homography(
    model: &[Vec2],
    scene: &[Vec2],
    threshold: f64,
    max_iters: usize,
) -> Option<na::Matrix3<f64>> {
    let n = model.len();
    if n < MIN_HOMOGRAPHY_POINTS {
        return None;
    }
    if n == MIN_HOMOGRAPHY_POINTS {
        return dlt_homography(model, scene, &[0, 1, 2, 3]);
    }

    let mut rng = rand::rng();
    let mut nums: Vec<usize> = (0..n).collect();
    let mut best_consensus: Vec<usize> = Vec::new();
    for _ in 0..max_iters {
        nums.shuffle(&mut rng);
        let sample = [nums[0], nums[1], nums[2], nums[3]];
        let Some(h) = dlt_homography(model, scene, &sample) else {
            continue;
        };
        let consensus: Vec<usize> = (0..n)
            .filter(|&i| {
                let v = h * na::Vector3::new(model[i].x as f64, model[i].y as f64, 1.0);
                if v.z.abs() < 1e-12 {
                    return false;
                }
                let dx = v.x / v.z - scene[i].x as f64;
                let dy = v.y / v.z - scene[i].y as f64;
                (dx * dx + dy * dy).sqrt() <= threshold
            })
            .collect();
        if consensus.len() > best_consensus.len() {
            best_consensus = consensus;
            // All points agreeing: no better model exists.
            if best_consensus.len() == n {
                break;
            }
        }
    }
    if best_consensus.len() < MIN_HOMOGRAPHY_POINTS {
        return None;
    }
    dlt_homography(model, scene, &best_consensus)
}

/// Direct linear transform over the selected correspondences with Hartley
/// normalization, nullspace via SVD.
fn dlt_homography(model: &[Vec2], scene: &[Vec2], indices: &[usize]) -> Option<na::Matrix3<f64>> {
    let t1 = normalizing_transform(model, indices)?;
    let t2 = normalizing_transform(scene, indices)?;

    let n = indices.len();
    let mut a = na::DMatrix::<f64>::zeros(2 * n, 9);
    for (r, &i) in indices.iter().enumerate() {
        let mp = t1 * na::Vector3::new(model[i].x as f64, model[i].y as f64, 1.0);
        let sp = t2 * na::Vector3::new(scene[i].x as f64, scene[i].y as f64, 1.0);
        let (x, y) = (mp.x, mp.y);
        let (xp, yp) = (sp.x, sp.y);
        let r0 = 2 * r;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = x * xp;
        a[(r0, 7)] = y * xp;
        a[(r0, 8)] = xp;
        let r1 = r0 + 1;
        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = x * yp;
        a[(r1, 7)] = y * yp;
        a[(r1, 8)] = yp;
    }

    let svd = a.svd(false, true);
    let vt = svd.v_t?;
    let hrow = vt.row(vt.nrows() - 1);
    let hn = na::Matrix3::new(
        hrow[0], hrow[1], hrow[2], hrow[3], hrow[4], hrow[5], hrow[6], hrow[7], hrow[8],
    );

    let t2_inv = t2.try_inverse()?;
    let mut h = t2_inv * hn * t1;
    if h[(2, 2)].abs() < 1e-12 {
        return None;
    }
    h /= h[(2, 2)];
    Some(h)
}

/// Similarity transform moving the selected points to centroid 0 and mean
/// distance sqrt(2). Fails for degenerate (coincident) selections.
fn normalizing_transform(points: &[Vec2], indices: &[usize]) -> Option<na::Matrix3<f64>> {
    let n = indices.len() as f64;
    let (mut cx, mut cy) = (0.0, 0.0);
    for &i in indices {
        cx += points[i].x as f64;
        cy += points[i].y as f64;
    }
    cx /= n;
    cy /= n;
    let mut mean_dist = 0.0;
    for &i in indices {
        let dx = points[i].x as f64 - cx;
        let dy = points[i].y as f64 - cy;
        mean_dist += (dx * dx + dy * dy).sqrt();
    }
    mean_dist /= n;
    if mean_dist < 1e-9 {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(na::Matrix3::new(
        s,
        0.0,
        -s * cx,
        0.0,
        s,
        -s * cy,
        0.0,
        0.0,
        1.0,
    ))
}
