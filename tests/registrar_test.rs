use glam::Vec2;
use nalgebra as na;
use planar_register::error::CoreError;
use planar_register::registrar::{
    CameraIntrinsics, Registrar, ransac_homography, reproject_2d,
};

fn grid_points(n_side: usize, step: f32) -> Vec<Vec2> {
    let mut pts = Vec::new();
    for r in 0..n_side {
        for c in 0..n_side {
            pts.push(Vec2::new(10.0 + c as f32 * step, 10.0 + r as f32 * step));
        }
    }
    pts
}

fn apply_h(h: &na::Matrix3<f64>, p: Vec2) -> Vec2 {
    let v = h * na::Vector3::new(p.x as f64, p.y as f64, 1.0);
    Vec2::new((v.x / v.z) as f32, (v.y / v.z) as f32)
}

fn test_homography() -> na::Matrix3<f64> {
    // Mild perspective warp with rotation and translation.
    na::Matrix3::new(
        0.95, -0.12, 40.0, //
        0.10, 0.93, 25.0, //
        1e-4, -5e-5, 1.0,
    )
}

#[test]
fn test_exact_correspondences_give_full_consensus() {
    let h = test_homography();
    let model = grid_points(6, 30.0);
    let scene: Vec<Vec2> = model.iter().map(|&p| apply_h(&h, p)).collect();

    let mut reg = Registrar::new();
    reg.update(Some(&model), Some(&scene)).unwrap();

    assert!(reg.homography().valid);
    assert_eq!(reg.inliers().count(), model.len());
    assert!(reg.inliers().mean_error < 0.1);

    let reproj = reproject_2d(&model, &reg.homography().mat);
    for (p, q) in reproj.iter().zip(scene.iter()) {
        assert!(p.distance(*q) < 0.5);
    }
}

#[test]
fn test_outliers_are_excluded_from_inlier_set() {
    let h = test_homography();
    let model = grid_points(6, 30.0);
    let mut scene: Vec<Vec2> = model.iter().map(|&p| apply_h(&h, p)).collect();
    let corrupted = [3usize, 11, 17, 22, 30];
    for &i in &corrupted {
        scene[i] += Vec2::new(55.0, -40.0);
    }

    let mut reg = Registrar::new();
    reg.update(Some(&model), Some(&scene)).unwrap();

    assert!(reg.homography().valid);
    assert_eq!(reg.inliers().count(), model.len() - corrupted.len());
    for &i in &corrupted {
        assert!(!reg.inliers().indices.contains(&i));
    }
}

#[test]
fn test_tighter_threshold_never_gains_inliers() {
    let h = test_homography();
    let model = grid_points(6, 30.0);
    let scene: Vec<Vec2> = model
        .iter()
        .enumerate()
        .map(|(i, &p)| apply_h(&h, p) + Vec2::new(0.0, (i % 7) as f32 * 0.8))
        .collect();

    let mut reg = Registrar::new();
    reg.set_reproj_threshold(6.0);
    reg.update(Some(&model), Some(&scene)).unwrap();
    let loose = reg.inliers().count();

    reg.set_reproj_threshold(1.0);
    reg.update(Some(&model), Some(&scene)).unwrap();
    let tight = reg.inliers().count();

    assert!(tight <= loose);
}

#[test]
fn test_threshold_clamps() {
    let mut reg = Registrar::new();
    reg.set_reproj_threshold(-3.0);
    assert_eq!(reg.reproj_threshold(), 0.0);
    reg.set_reproj_threshold(42.0);
    assert_eq!(reg.reproj_threshold(), 10.0);
    reg.set_ransac_threshold(99.0);
    assert_eq!(reg.ransac_threshold(), 10.0);
}

#[test]
fn test_too_few_points_resets_outputs() {
    let mut reg = Registrar::new();
    let model = vec![Vec2::new(0.0, 0.0), Vec2::new(1.0, 0.0), Vec2::new(0.0, 1.0)];
    let scene = model.clone();
    reg.update(Some(&model), Some(&scene)).unwrap();
    assert!(!reg.homography().valid);
    assert_eq!(reg.inliers().count(), 0);
}

#[test]
fn test_unset_points_error() {
    let mut reg = Registrar::new();
    let pts = vec![Vec2::ZERO; 8];
    let err = reg.update(None, Some(&pts)).unwrap_err();
    assert!(matches!(err, CoreError::PointsUnset { which: "model" }));
    let err = reg.update(Some(&pts), None).unwrap_err();
    assert!(matches!(err, CoreError::PointsUnset { which: "scene" }));
}

fn test_camera() -> CameraIntrinsics {
    let k = na::Matrix3::new(512.0, 0.0, 256.0, 0.0, 512.0, 256.0, 0.0, 0.0, 1.0);
    CameraIntrinsics::new(k, na::DVector::zeros(0)).unwrap()
}

#[test]
fn test_camera_set_is_rederived() {
    let mut reg = Registrar::new();
    assert!(!reg.is_camera_set());
    assert!(!reg.set_compute_pose(true));

    reg.set_camera(test_camera(), 0.0);
    assert!(!reg.is_camera_set()); // scale still unset

    reg.set_camera(test_camera(), 3.5e-4);
    assert!(reg.is_camera_set());
    assert!(reg.set_compute_pose(true));

    reg.clear_camera();
    assert!(!reg.is_camera_set());
    assert!(!reg.compute_pose());
}

#[test]
fn test_distortion_vector_lengths() {
    let k = na::Matrix3::new(512.0, 0.0, 256.0, 0.0, 512.0, 256.0, 0.0, 0.0, 1.0);
    for n in [0usize, 4, 5, 8] {
        assert!(CameraIntrinsics::new(k, na::DVector::zeros(n)).is_ok());
    }
    for n in [1usize, 2, 3, 6, 7, 9] {
        assert!(CameraIntrinsics::new(k, na::DVector::zeros(n)).is_err());
    }
}

#[test]
fn test_undistort_inverts_distort() {
    let k = na::Matrix3::new(512.0, 0.0, 256.0, 0.0, 512.0, 256.0, 0.0, 0.0, 1.0);
    let dist = na::DVector::from_vec(vec![-0.2, 0.05, 1e-3, -1e-3, 0.0]);
    let cam = CameraIntrinsics::new(k, dist).unwrap();

    let (x, y) = (0.12, -0.08);
    let (xd, yd) = cam.distort(x, y);
    let u = 512.0 * xd + 256.0;
    let v = 512.0 * yd + 256.0;
    let n = cam.undistort_pixel(u, v);
    assert!((n.x as f64 - x).abs() < 1e-5);
    assert!((n.y as f64 - y).abs() < 1e-5);
}

#[test]
fn test_pose_requires_enough_inliers() {
    let mut reg = Registrar::new();
    reg.set_camera(test_camera(), 3.5e-4);
    assert!(reg.set_compute_pose(true));

    // Exactly four correspondences: homography fits, pose does not.
    let model = vec![
        Vec2::new(0.0, 0.0),
        Vec2::new(100.0, 0.0),
        Vec2::new(100.0, 100.0),
        Vec2::new(0.0, 100.0),
    ];
    let scene = model.clone();
    reg.update(Some(&model), Some(&scene)).unwrap();
    assert!(reg.homography().valid);
    assert!(!reg.pose_valid());
}

#[test]
fn test_frontoparallel_pose_recovery() {
    // Scene pixels equal model pixels under a camera with fx = fy = f: the
    // exact solution is the identity rotation with t = (-cx s, -cy s, f s).
    let mut reg = Registrar::new();
    let scale = 0.1781 / 512.0;
    reg.set_camera(test_camera(), scale);
    assert!(reg.set_compute_pose(true));

    let model = grid_points(7, 60.0);
    let scene = model.clone();
    reg.update(Some(&model), Some(&scene)).unwrap();

    assert!(reg.homography().valid);
    assert!(reg.pose_valid());
    let pose = reg.pose();
    let expect_t = (-256.0 * scale, -256.0 * scale, 512.0 * scale);
    assert!((pose.x - expect_t.0).abs() < 5e-3);
    assert!((pose.y - expect_t.1).abs() < 5e-3);
    assert!((pose.z - expect_t.2).abs() < 5e-3);
    assert!(pose.angle() < 0.05);
}

#[test]
fn test_previous_pose_survives_a_failed_frame() {
    let mut reg = Registrar::new();
    let scale = 0.1781 / 512.0;
    reg.set_camera(test_camera(), scale);
    assert!(reg.set_compute_pose(true));
    reg.set_use_previous_pose(true);

    let model = grid_points(7, 60.0);
    let scene = model.clone();
    reg.update(Some(&model), Some(&scene)).unwrap();
    assert!(reg.pose_valid());
    let held = reg.pose();

    // Degenerate frame: too few points. The last valid pose is kept.
    let few = vec![Vec2::ZERO; 2];
    reg.update(Some(&few), Some(&few)).unwrap();
    assert!(reg.pose_valid());
    assert_eq!(reg.pose(), held);

    reg.set_use_previous_pose(false);
    reg.update(Some(&few), Some(&few)).unwrap();
    assert!(!reg.pose_valid());
}

#[test]
fn test_ransac_survives_heavy_outliers() {
    let h = test_homography();
    let model = grid_points(8, 25.0);
    let mut scene: Vec<Vec2> = model.iter().map(|&p| apply_h(&h, p)).collect();
    // A third of the correspondences scattered far off.
    for i in (0..scene.len()).step_by(3) {
        scene[i] += Vec2::new(150.0 + i as f32, -90.0);
    }

    let est = ransac_homography(&model, &scene, 3.0, 500).unwrap();
    let clean: Vec<usize> = (0..model.len()).filter(|i| i % 3 != 0).collect();
    for &i in &clean {
        let p = apply_h(&est, model[i]);
        assert!(p.distance(scene[i]) < 1.0);
    }
}
