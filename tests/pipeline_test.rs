use image::{DynamicImage, GrayImage};
use nalgebra as na;
use planar_register::features::{DescriptorFamily, FeatureFamily};
use planar_register::matcher::MatcherFamily;
use planar_register::pipeline::Pipeline;
use planar_register::registrar::CameraIntrinsics;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn textured_image(width: u32, height: u32, seed: u64) -> DynamicImage {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let block = 8;
    let bw = width.div_ceil(block) as usize;
    let levels: Vec<u8> = (0..bw * height.div_ceil(block) as usize)
        .map(|_| rng.random_range(0..=255))
        .collect();
    let img = GrayImage::from_fn(width, height, |x, y| {
        let b = (y / block) as usize * bw + (x / block) as usize;
        image::Luma([levels[b]])
    });
    DynamicImage::ImageLuma8(img)
}

fn save_model(name: &str, image: &DynamicImage) -> String {
    let path = std::env::temp_dir().join(name);
    image.save(&path).unwrap();
    path.to_string_lossy().into_owned()
}

fn camera_512() -> CameraIntrinsics {
    let k = na::Matrix3::new(512.0, 0.0, 256.0, 0.0, 512.0, 256.0, 0.0, 0.0, 1.0);
    CameraIntrinsics::new(k, na::DVector::zeros(0)).unwrap()
}

#[test]
fn test_matching_requires_a_model() {
    let mut pipeline = Pipeline::new().unwrap();
    assert!(pipeline.detecting());
    assert!(!pipeline.matching());
    assert!(!pipeline.set_matching(true));
}

#[test]
fn test_registering_requires_matching() {
    let mut pipeline = Pipeline::new().unwrap();
    assert!(!pipeline.set_registering(true));
    assert!(!pipeline.set_show_frame(true));
}

#[test]
fn test_state_cascade_teardown() {
    let model = textured_image(256, 256, 21);
    let path = save_model("pipeline_cascade_model.png", &model);

    let mut pipeline = Pipeline::new().unwrap();
    pipeline.load_model(&path).unwrap();
    assert!(pipeline.set_matching(true));
    assert!(pipeline.set_registering(true));
    assert!(pipeline.set_show_frame(true));

    // Pose needs calibration before it can be enabled.
    assert!(!pipeline.set_compute_pose(true));
    pipeline.set_print_scale(1e-3);
    pipeline.set_camera(camera_512());
    assert!(pipeline.set_compute_pose(true));
    assert!(pipeline.set_show_box(true));

    // Dropping registration takes the whole overlay chain down with it.
    pipeline.set_registering(false);
    assert!(!pipeline.show_frame());
    assert!(!pipeline.show_box());
    assert!(!pipeline.registrar().compute_pose());
    assert!(pipeline.matching());

    // Dropping detection takes down matching and clears the feature sets.
    assert!(pipeline.set_matching(true));
    pipeline.set_detecting(false);
    assert!(!pipeline.matching());
    assert!(pipeline.scene_features().is_empty());
    assert!(pipeline.model_features().is_empty());
}

#[test]
fn test_matching_recovers_after_detection_toggle() {
    let image = textured_image(256, 256, 27);
    let path = save_model("pipeline_toggle_model.png", &image);

    let mut pipeline = Pipeline::new().unwrap();
    pipeline.load_model(&path).unwrap();
    assert!(pipeline.set_matching(true));
    pipeline.update(&image).unwrap();

    pipeline.set_detecting(false);
    assert!(pipeline.model_features().is_empty());

    // Turning detection back on re-derives the model features on the next
    // frame, so matching can be re-enabled.
    pipeline.set_detecting(true);
    pipeline.update(&image).unwrap();
    assert!(!pipeline.model_features().is_empty());
    assert!(pipeline.set_matching(true));
}

#[test]
fn test_valued_descriptor_forces_compatible_matcher() {
    let mut pipeline = Pipeline::new().unwrap();
    assert_eq!(pipeline.matcher().family(), MatcherFamily::BruteForceHamming);

    pipeline
        .set_descriptor_family(DescriptorFamily::Sift)
        .unwrap();
    assert!(pipeline.matcher().family().supports_valued());
}

#[test]
fn test_binary_matcher_forces_compatible_descriptor() {
    let mut pipeline = Pipeline::new().unwrap();
    pipeline
        .set_descriptor_family(DescriptorFamily::Sift)
        .unwrap();

    pipeline
        .set_matcher_family(MatcherFamily::BruteForceHamming, true)
        .unwrap();
    assert!(MatcherFamily::BruteForceHamming.supports(pipeline.descriptor_family().class()));

    // Without the check the mismatch is left in place.
    pipeline
        .set_descriptor_family(DescriptorFamily::Sift)
        .unwrap();
    pipeline
        .set_matcher_family(MatcherFamily::BruteForceHamming, false)
        .unwrap();
    assert_eq!(pipeline.descriptor_family(), DescriptorFamily::Sift);
}

#[test]
fn test_extractors_share_algorithm_instances() {
    let mut pipeline = Pipeline::new().unwrap();
    assert!(pipeline.extractors_share_detector());
    assert!(pipeline.extractors_share_descriptor());

    pipeline.set_feature_family(FeatureFamily::Fast).unwrap();
    assert!(pipeline.extractors_share_detector());
}

#[test]
fn test_family_change_resets_timing() {
    let image = textured_image(256, 256, 23);
    let path = save_model("pipeline_timing_model.png", &image);

    let mut pipeline = Pipeline::new().unwrap();
    pipeline.load_model(&path).unwrap();
    pipeline.update(&image).unwrap();
    assert!(pipeline.total_time().count() > 0);

    pipeline.set_feature_family(FeatureFamily::Fast).unwrap();
    assert_eq!(pipeline.total_time().count(), 0);
    assert_eq!(pipeline.detect_time().count(), 0);
}

#[test]
fn test_full_pipeline_on_identical_frame() {
    let image = textured_image(512, 512, 42);
    let path = save_model("pipeline_e2e_model.png", &image);

    let mut pipeline = Pipeline::new().unwrap();
    pipeline.load_model(&path).unwrap();
    assert!(!pipeline.model_features().is_empty());

    // 178.1 mm print of a 512 px wide reference.
    let scale = 0.1781 / 512.0;
    pipeline.set_print_scale(scale);
    pipeline.set_camera(camera_512());

    assert!(pipeline.set_matching(true));
    assert!(pipeline.set_registering(true));
    assert!(pipeline.set_compute_pose(true));
    pipeline.update(&image).unwrap();

    assert!(!pipeline.matches().is_empty());
    assert!(pipeline.homography().valid);
    assert!(pipeline.inliers().count() >= 6);

    // Scene equals model, so the homography is the identity and the frame
    // corners land on themselves.
    let corners = pipeline.reprojected_frame_corners();
    assert_eq!(corners.len(), 4);
    for (p, q) in corners.iter().zip(pipeline.frame_corners().iter()) {
        assert!(p.distance(*q) < 2.0);
    }

    // The exact frontoparallel solution for fx = fy = f.
    assert!(pipeline.registrar().pose_valid());
    let pose = pipeline.registrar().pose();
    assert!((pose.x - (-256.0 * scale)).abs() < 5e-3);
    assert!((pose.y - (-256.0 * scale)).abs() < 5e-3);
    assert!((pose.z - 512.0 * scale).abs() < 5e-3);
    assert!(pose.angle() < 0.05);

    let box_pts = pipeline.reprojected_box_corners();
    assert_eq!(box_pts.len(), 8);
    // Base of the box projects onto the model footprint in the scene.
    assert!(box_pts[0].distance(corners[0]) < 5.0);

    assert!(pipeline.total_time().count() > 0);
    assert!(pipeline.match_time().count() > 0);
    assert!(pipeline.register_time().count() > 0);
}
