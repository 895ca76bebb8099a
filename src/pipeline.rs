use std::time::Instant;

use glam::{Vec2, Vec3};
use image::DynamicImage;
use log::{debug, warn};

use crate::error::{CoreError, Result};
use crate::features::{
    DESCRIPTOR_FAMILIES, DescriptorFamily, FeatureExtractor, FeatureFamily, FeatureSet, Keypoint,
};
use crate::matcher::{DescriptorMatcher, MATCHER_FAMILIES, MatchMode, MatchSet, MatcherFamily};
use crate::registrar::{
    CameraIntrinsics, Homography, InlierSet, Registrar, reproject_2d, reproject_3d,
};
use crate::stats::RunningStats;

/// Per-frame pipeline: model/scene feature extraction, descriptor matching
/// and registration, with the detecting ⊇ matching ⊇ registering dependency
/// chain enforced on every state change.
pub struct Pipeline {
    model_extractor: FeatureExtractor,
    scene_extractor: FeatureExtractor,
    matcher: DescriptorMatcher,
    registrar: Registrar,

    model_image: Option<DynamicImage>,
    print_scale: f64,

    detecting: bool,
    matching: bool,
    registering: bool,
    show_frame: bool,
    show_box: bool,
    redetect_model: bool,

    matched_model: Vec<Keypoint>,
    matched_scene: Vec<Keypoint>,
    frame_corners: Vec<Vec2>,
    box_corners: Vec<Vec3>,

    detect_time: RunningStats,
    match_time: RunningStats,
    register_time: RunningStats,
    total_time: RunningStats,
}

impl Pipeline {
    pub fn new() -> Result<Pipeline> {
        let model_extractor = FeatureExtractor::new(FeatureFamily::Orb)?;
        let mut scene_extractor = FeatureExtractor::new(FeatureFamily::Orb)?;
        // Identical families at startup: share the model's instances.
        scene_extractor.set_feature_family(FeatureFamily::Orb, Some(&model_extractor))?;
        scene_extractor.set_descriptor_family(DescriptorFamily::Orb, Some(&model_extractor))?;
        Ok(Pipeline {
            model_extractor,
            scene_extractor,
            matcher: DescriptorMatcher::new(MatcherFamily::BruteForceHamming, MatchMode::KnnCross),
            registrar: Registrar::new(),
            model_image: None,
            print_scale: 0.0,
            detecting: true,
            matching: false,
            registering: false,
            show_frame: false,
            show_box: false,
            redetect_model: false,
            matched_model: Vec::new(),
            matched_scene: Vec::new(),
            frame_corners: Vec::new(),
            box_corners: Vec::new(),
            detect_time: RunningStats::new(),
            match_time: RunningStats::new(),
            register_time: RunningStats::new(),
            total_time: RunningStats::new(),
        })
    }

    // ---- configuration -------------------------------------------------

    /// Loads the model image, re-derives the model feature set (sharing
    /// algorithm instances with the scene extractor) and recomputes the
    /// overlay corner points from the new size and current print scale.
    pub fn load_model(&mut self, path: &str) -> Result<()> {
        let image = image::ImageReader::open(path)
            .map_err(|e| CoreError::FileReadFailure {
                path: path.to_string(),
                detail: e.to_string(),
            })?
            .decode()
            .map_err(|e| CoreError::FileReadFailure {
                path: path.to_string(),
                detail: e.to_string(),
            })?;
        self.model_extractor.update(&image)?;
        self.model_image = Some(image);
        self.recompute_corners();
        self.redetect_model = true;
        Ok(())
    }

    /// Physical print scale in metres per model pixel.
    pub fn set_print_scale(&mut self, scale_m_per_px: f64) {
        self.print_scale = scale_m_per_px;
        if let Some(camera) = self.registrar.camera().cloned() {
            self.registrar.set_camera(camera, scale_m_per_px);
        }
        self.recompute_corners();
    }

    pub fn set_camera(&mut self, camera: CameraIntrinsics) {
        self.registrar.set_camera(camera, self.print_scale);
    }

    fn recompute_corners(&mut self) {
        let Some(img) = &self.model_image else {
            self.frame_corners.clear();
            self.box_corners.clear();
            return;
        };
        let (w, h) = (img.width() as f32, img.height() as f32);
        self.frame_corners = vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(w, 0.0),
            Vec2::new(w, h),
            Vec2::new(0.0, h),
        ];
        let s = self.print_scale as f32;
        let depth = s * w.min(h) * 0.5;
        let base = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(w * s, 0.0, 0.0),
            Vec3::new(w * s, h * s, 0.0),
            Vec3::new(0.0, h * s, 0.0),
        ];
        self.box_corners = base
            .iter()
            .copied()
            .chain(base.iter().map(|p| Vec3::new(p.x, p.y, -depth)))
            .collect();
    }

    /// Changes the detector family on both extractors, sharing one instance
    /// between them, and resets every running time statistic.
    pub fn set_feature_family(&mut self, family: FeatureFamily) -> Result<()> {
        self.model_extractor.set_feature_family(family, None)?;
        self.scene_extractor
            .set_feature_family(family, Some(&self.model_extractor))?;
        self.redetect_model = true;
        self.reset_time_stats();
        Ok(())
    }

    /// Changes the descriptor family on both extractors and, if the current
    /// matcher cannot handle the new content type, scans forward through the
    /// matcher enumeration (wrapping) until a compatible family is found.
    pub fn set_descriptor_family(&mut self, family: DescriptorFamily) -> Result<()> {
        self.model_extractor.set_descriptor_family(family, None)?;
        self.scene_extractor
            .set_descriptor_family(family, Some(&self.model_extractor))?;
        if !self.matcher.family().supports(family.class()) {
            let fixed = next_compatible_matcher(self.matcher.family(), family);
            warn!(
                "matcher {} incompatible with descriptor {}; switching to {}",
                self.matcher.family().name(),
                family.name(),
                fixed.name()
            );
            self.matcher.set_family(fixed);
        }
        self.redetect_model = true;
        self.reset_time_stats();
        Ok(())
    }

    /// Changes the matcher family. With `check_descriptors`, an incompatible
    /// descriptor selection is fixed up by scanning forward through the
    /// descriptor enumeration (wrapping) until one matches the matcher's
    /// declared capability.
    pub fn set_matcher_family(
        &mut self,
        family: MatcherFamily,
        check_descriptors: bool,
    ) -> Result<()> {
        self.matcher.set_family(family);
        let descriptor = self.scene_extractor.descriptor_family();
        if check_descriptors && !family.supports(descriptor.class()) {
            let fixed = next_compatible_descriptor(descriptor, family);
            warn!(
                "descriptor {} incompatible with matcher {}; switching to {}",
                descriptor.name(),
                family.name(),
                fixed.name()
            );
            self.model_extractor.set_descriptor_family(fixed, None)?;
            self.scene_extractor
                .set_descriptor_family(fixed, Some(&self.model_extractor))?;
            self.redetect_model = true;
        }
        self.reset_time_stats();
        Ok(())
    }

    pub fn set_match_mode(&mut self, mode: MatchMode) {
        self.matcher.set_mode(mode);
        self.reset_time_stats();
    }

    pub fn feature_family(&self) -> FeatureFamily {
        self.scene_extractor.feature_family()
    }

    pub fn descriptor_family(&self) -> DescriptorFamily {
        self.scene_extractor.descriptor_family()
    }

    pub fn extractors_share_detector(&self) -> bool {
        self.scene_extractor.shares_detector_with(&self.model_extractor)
    }

    pub fn extractors_share_descriptor(&self) -> bool {
        self.scene_extractor.shares_descriptor_with(&self.model_extractor)
    }

    pub fn matcher_mut(&mut self) -> &mut DescriptorMatcher {
        &mut self.matcher
    }

    pub fn registrar_mut(&mut self) -> &mut Registrar {
        &mut self.registrar
    }

    // ---- state machine -------------------------------------------------

    pub fn detecting(&self) -> bool {
        self.detecting
    }

    pub fn matching(&self) -> bool {
        self.matching
    }

    pub fn registering(&self) -> bool {
        self.registering
    }

    pub fn show_frame(&self) -> bool {
        self.show_frame
    }

    pub fn show_box(&self) -> bool {
        self.show_box
    }

    /// Disabling detection clears both feature sets and cascades matching
    /// and registering off. Re-enabling schedules a one-shot model
    /// re-detection so the cleared model FeatureSet comes back on the next
    /// frame.
    pub fn set_detecting(&mut self, enabled: bool) {
        self.detecting = enabled;
        if enabled {
            if self.model_image.is_some() {
                self.redetect_model = true;
            }
        } else {
            self.model_extractor.clear();
            self.scene_extractor.clear();
            self.set_matching(false);
        }
    }

    /// Enabling matching requires detection and a loaded model; rejected
    /// (returns false) otherwise.
    pub fn set_matching(&mut self, enabled: bool) -> bool {
        if enabled {
            if !self.detecting {
                warn!("matching rejected: detection is off");
                return false;
            }
            if self.model_image.is_none() || self.model_extractor.features().is_empty() {
                warn!("matching rejected: model not ready");
                return false;
            }
            self.matching = true;
        } else {
            self.matching = false;
            self.set_registering(false);
            self.matched_model.clear();
            self.matched_scene.clear();
        }
        true
    }

    /// Enabling registration requires matching; rejected otherwise.
    pub fn set_registering(&mut self, enabled: bool) -> bool {
        if enabled {
            if !self.matching {
                warn!("registering rejected: matching is off");
                return false;
            }
            self.registering = true;
        } else {
            self.registering = false;
            self.show_frame = false;
            self.show_box = false;
            self.registrar.set_compute_pose(false);
            self.registrar.set_use_previous_pose(false);
        }
        true
    }

    /// Frame overlay toggle, gated on registration.
    pub fn set_show_frame(&mut self, enabled: bool) -> bool {
        if enabled && !self.registering {
            return false;
        }
        self.show_frame = enabled;
        true
    }

    /// Box overlay toggle, gated on pose computation.
    pub fn set_show_box(&mut self, enabled: bool) -> bool {
        if enabled && !self.registrar.compute_pose() {
            return false;
        }
        self.show_box = enabled;
        true
    }

    /// Enables pose solving. True only when registering and the camera
    /// intrinsics, distortion and a positive scale are all set.
    pub fn set_compute_pose(&mut self, enabled: bool) -> bool {
        if enabled && !self.registering {
            warn!("pose rejected: registering is off");
            return false;
        }
        let ok = self.registrar.set_compute_pose(enabled);
        if !enabled || !ok {
            self.show_box = false;
        }
        ok
    }

    // ---- per-frame update ----------------------------------------------

    /// Runs the active stages against a stable snapshot of the scene frame.
    /// Per-frame estimation failures are recovered inside each stage; the
    /// frame always completes.
    pub fn update(&mut self, scene: &DynamicImage) -> Result<()> {
        if !self.detecting {
            return Ok(());
        }
        let frame_start = Instant::now();

        let t = Instant::now();
        if self.redetect_model
            && let Some(model) = self.model_image.take()
        {
            self.model_extractor.update(&model)?;
            self.model_image = Some(model);
            self.redetect_model = false;
        }
        self.scene_extractor.update(scene)?;
        self.detect_time.push(t.elapsed().as_secs_f64());

        if self.matching {
            let t = Instant::now();
            let model_desc = match self.model_extractor.features() {
                fs if fs.is_empty() => None,
                fs => Some(&fs.descriptors),
            };
            let scene_desc = match self.scene_extractor.features() {
                fs if fs.is_empty() => None,
                fs => Some(&fs.descriptors),
            };
            match self.matcher.update(model_desc, scene_desc) {
                Ok(()) => {
                    let m = self.matcher.matches();
                    self.matched_model = self.model_extractor.extract_selected(&m.model_idx, None);
                    self.matched_scene = self.scene_extractor.extract_selected(&m.scene_idx, None);
                }
                Err(e) => {
                    // Previous correspondence set stays in place.
                    debug!("matching skipped this frame: {e}");
                }
            }
            self.match_time.push(t.elapsed().as_secs_f64());
        }

        if self.matching && self.registering {
            let t = Instant::now();
            let model_pts: Vec<Vec2> = self.matched_model.iter().map(|k| k.position()).collect();
            let scene_pts: Vec<Vec2> = self.matched_scene.iter().map(|k| k.position()).collect();
            self.registrar
                .update(Some(&model_pts), Some(&scene_pts))?;
            self.register_time.push(t.elapsed().as_secs_f64());
        }

        self.total_time.push(frame_start.elapsed().as_secs_f64());
        Ok(())
    }

    // ---- outputs -------------------------------------------------------

    pub fn model_features(&self) -> &FeatureSet {
        self.model_extractor.features()
    }

    pub fn scene_features(&self) -> &FeatureSet {
        self.scene_extractor.features()
    }

    pub fn matches(&self) -> &MatchSet {
        self.matcher.matches()
    }

    pub fn matcher(&self) -> &DescriptorMatcher {
        &self.matcher
    }

    pub fn registrar(&self) -> &Registrar {
        &self.registrar
    }

    pub fn homography(&self) -> &Homography {
        self.registrar.homography()
    }

    pub fn inliers(&self) -> &InlierSet {
        self.registrar.inliers()
    }

    pub fn matched_model_keypoints(&self) -> &[Keypoint] {
        &self.matched_model
    }

    pub fn matched_scene_keypoints(&self) -> &[Keypoint] {
        &self.matched_scene
    }

    /// Inlier subset of the matched model keypoints, materialized through
    /// the correspondence-array indices.
    pub fn inlier_model_keypoints(&self) -> Vec<Keypoint> {
        self.model_extractor.extract_selected(
            &self.matcher.matches().model_idx,
            Some(&self.registrar.inliers().indices),
        )
    }

    pub fn inlier_scene_keypoints(&self) -> Vec<Keypoint> {
        self.scene_extractor.extract_selected(
            &self.matcher.matches().scene_idx,
            Some(&self.registrar.inliers().indices),
        )
    }

    pub fn frame_corners(&self) -> &[Vec2] {
        &self.frame_corners
    }

    pub fn box_corners(&self) -> &[Vec3] {
        &self.box_corners
    }

    /// Model frame corners mapped into the scene by the current homography,
    /// empty while the homography is invalid.
    pub fn reprojected_frame_corners(&self) -> Vec<Vec2> {
        if !self.registrar.homography().valid {
            return Vec::new();
        }
        reproject_2d(&self.frame_corners, &self.registrar.homography().mat)
    }

    /// Physical box corners projected into the scene under the current
    /// pose, empty while the pose is invalid.
    pub fn reprojected_box_corners(&self) -> Vec<Vec2> {
        if !self.registrar.pose_valid() {
            return Vec::new();
        }
        let Some(camera) = self.registrar.camera() else {
            return Vec::new();
        };
        reproject_3d(&self.box_corners, &self.registrar.pose(), camera)
    }

    pub fn detect_time(&self) -> &RunningStats {
        &self.detect_time
    }

    pub fn match_time(&self) -> &RunningStats {
        &self.match_time
    }

    pub fn register_time(&self) -> &RunningStats {
        &self.register_time
    }

    pub fn total_time(&self) -> &RunningStats {
        &self.total_time
    }

    /// Clears every running time statistic, including the per-extractor
    /// detect/describe splits.
    pub fn reset_time_stats(&mut self) {
        self.detect_time.reset();
        self.match_time.reset();
        self.register_time.reset();
        self.total_time.reset();
        self.model_extractor.reset_time_stats();
        self.scene_extractor.reset_time_stats();
    }
}

/// First matcher family at or after the current one (wrapping) that can
/// handle the descriptor's content type.
fn next_compatible_matcher(current: MatcherFamily, descriptor: DescriptorFamily) -> MatcherFamily {
    let start = MATCHER_FAMILIES
        .iter()
        .position(|&m| m == current)
        .unwrap_or(0);
    for step in 1..=MATCHER_FAMILIES.len() {
        let candidate = MATCHER_FAMILIES[(start + step) % MATCHER_FAMILIES.len()];
        if candidate.supports(descriptor.class()) {
            return candidate;
        }
    }
    current
}

/// First descriptor family at or after the current one (wrapping) whose
/// classification the matcher supports.
fn next_compatible_descriptor(
    current: DescriptorFamily,
    matcher: MatcherFamily,
) -> DescriptorFamily {
    let start = DESCRIPTOR_FAMILIES
        .iter()
        .position(|&d| d == current)
        .unwrap_or(0);
    for step in 1..=DESCRIPTOR_FAMILIES.len() {
        let candidate = DESCRIPTOR_FAMILIES[(start + step) % DESCRIPTOR_FAMILIES.len()];
        if matcher.supports(candidate.class()) {
            return candidate;
        }
    }
    current
}
