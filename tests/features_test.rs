use image::{DynamicImage, GrayImage};
use planar_register::error::CoreError;
use planar_register::features::{
    DescriptorClass, DescriptorFamily, FeatureExtractor, FeatureFamily, default_descriptor,
    to_intensity,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Blocky random texture with plenty of corner structure.
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

#[test]
fn test_to_intensity_rejects_bad_input() {
    let empty = DynamicImage::new_luma8(0, 0);
    assert!(matches!(
        to_intensity(&empty),
        Err(CoreError::NullImageData)
    ));

    let rgba = DynamicImage::new_rgba8(16, 16);
    assert!(matches!(
        to_intensity(&rgba),
        Err(CoreError::InvalidImageType { channels: 4 })
    ));

    let rgb = DynamicImage::new_rgb8(16, 16);
    assert!(to_intensity(&rgb).is_ok());
}

#[test]
fn test_descriptor_rows_track_keypoints() {
    let image = textured_image(256, 256, 7);
    for family in [FeatureFamily::Orb, FeatureFamily::Fast, FeatureFamily::Harris] {
        let extractor = FeatureExtractor::new(family).unwrap();
        let fs = extractor.detect_and_describe(&image).unwrap();
        assert!(!fs.is_empty(), "{} found no keypoints", family.name());
        assert_eq!(fs.descriptors.rows(), fs.keypoints.len());
    }
}

#[test]
fn test_valued_families_produce_unit_rows() {
    let image = textured_image(256, 256, 11);
    let mut extractor = FeatureExtractor::new(FeatureFamily::Sift).unwrap();
    extractor.update(&image).unwrap();
    let fs = extractor.features();
    assert_eq!(fs.descriptors.class(), DescriptorClass::Valued);
    for r in 0..fs.descriptors.rows().min(20) {
        let row = fs.descriptors.valued_row(r);
        let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3 || norm == 0.0);
    }
}

#[test]
fn test_default_descriptor_pairing() {
    assert_eq!(default_descriptor(FeatureFamily::Orb), DescriptorFamily::Orb);
    assert_eq!(
        default_descriptor(FeatureFamily::Fast),
        DescriptorFamily::Brief
    );
    assert_eq!(
        default_descriptor(FeatureFamily::Sift),
        DescriptorFamily::Sift
    );
}

#[test]
fn test_sibling_extractors_share_instances() {
    let first = FeatureExtractor::new(FeatureFamily::Orb).unwrap();
    let mut second = FeatureExtractor::new(FeatureFamily::Orb).unwrap();
    assert!(!second.shares_detector_with(&first));

    second
        .set_feature_family(FeatureFamily::Orb, Some(&first))
        .unwrap();
    second
        .set_descriptor_family(DescriptorFamily::Orb, Some(&first))
        .unwrap();
    assert!(second.shares_detector_with(&first));
    assert!(second.shares_descriptor_with(&first));

    // Diverging families break the sharing.
    second
        .set_feature_family(FeatureFamily::Fast, Some(&first))
        .unwrap();
    assert!(!second.shares_detector_with(&first));
}

#[test]
fn test_family_change_clears_features() {
    let image = textured_image(128, 128, 3);
    let mut extractor = FeatureExtractor::new(FeatureFamily::Orb).unwrap();
    extractor.update(&image).unwrap();
    assert!(!extractor.features().is_empty());

    extractor
        .set_feature_family(FeatureFamily::Fast, None)
        .unwrap();
    assert!(extractor.features().is_empty());
}

#[test]
fn test_extract_selected_with_subindices() {
    let image = textured_image(256, 256, 5);
    let mut extractor = FeatureExtractor::new(FeatureFamily::Orb).unwrap();
    extractor.update(&image).unwrap();
    let n = extractor.features().len();
    assert!(n >= 4);

    let indices = vec![0, 2, 3, 1];
    let picked = extractor.extract_selected(&indices, None);
    assert_eq!(picked.len(), 4);
    assert_eq!(picked[0], extractor.features().keypoints[0]);
    assert_eq!(picked[1], extractor.features().keypoints[2]);

    let sub = vec![3, 0];
    let picked = extractor.extract_selected(&indices, Some(&sub));
    assert_eq!(picked.len(), 2);
    assert_eq!(picked[0], extractor.features().keypoints[1]);
    assert_eq!(picked[1], extractor.features().keypoints[0]);

    // Out-of-range entries are dropped, not panicked on.
    let picked = extractor.extract_selected(&[n + 10, 0], None);
    assert_eq!(picked.len(), 1);
}

#[test]
fn test_update_records_timing() {
    let image = textured_image(128, 128, 9);
    let mut extractor = FeatureExtractor::new(FeatureFamily::Orb).unwrap();
    extractor.update(&image).unwrap();
    extractor.update(&image).unwrap();
    assert_eq!(extractor.detect_time().count(), 2);
    assert_eq!(extractor.describe_time().count(), 2);
    assert_eq!(extractor.total_time().count(), 2);

    extractor.reset_time_stats();
    assert_eq!(extractor.total_time().count(), 0);
}

#[test]
fn test_identical_images_give_identical_features() {
    let image = textured_image(256, 256, 13);
    let extractor = FeatureExtractor::new(FeatureFamily::Orb).unwrap();
    let a = extractor.detect_and_describe(&image).unwrap();
    let b = extractor.detect_and_describe(&image).unwrap();
    assert_eq!(a.keypoints.len(), b.keypoints.len());
    for (p, q) in a.keypoints.iter().zip(b.keypoints.iter()) {
        assert_eq!(p.x, q.x);
        assert_eq!(p.y, q.y);
    }
}
