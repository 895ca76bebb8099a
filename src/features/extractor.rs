use std::sync::Arc;
use std::time::Instant;

use image::{DynamicImage, GrayImage};
use log::trace;

use super::describe::{DescriptorAlgo, DescriptorFamily, default_descriptor};
use super::detect::{Detector, FeatureFamily};
use super::types::{FeatureSet, Keypoint};
use crate::error::{CoreError, Result};
use crate::stats::RunningStats;

/// One underlying algorithm object. Families like ORB, BRISK and SIFT
/// compute both keypoints and descriptors in a single instance, so the
/// detector and descriptor slots can be filled together and the whole thing
/// shared between extractors through the `Arc`.
#[derive(Debug)]
pub struct Algorithm {
    pub name: &'static str,
    pub detector: Option<Detector>,
    pub descriptor: Option<DescriptorAlgo>,
}

impl Algorithm {
    fn for_feature(family: FeatureFamily) -> Result<Algorithm> {
        let detector = Detector::new(family)?;
        // Same-named descriptor family: one object serves both roles.
        let descriptor = descriptor_by_name(family.name())
            .map(DescriptorAlgo::new)
            .transpose()?;
        Ok(Algorithm {
            name: family.name(),
            detector: Some(detector),
            descriptor,
        })
    }

    fn for_descriptor(family: DescriptorFamily) -> Result<Algorithm> {
        let descriptor = DescriptorAlgo::new(family)?;
        let detector = feature_by_name(family.name()).map(Detector::new).transpose()?;
        Ok(Algorithm {
            name: family.name(),
            detector,
            descriptor: Some(descriptor),
        })
    }
}

fn descriptor_by_name(name: &str) -> Option<DescriptorFamily> {
    super::describe::DESCRIPTOR_FAMILIES
        .into_iter()
        .find(|d| d.name() == name)
}

fn feature_by_name(name: &str) -> Option<FeatureFamily> {
    super::detect::FEATURE_FAMILIES
        .into_iter()
        .find(|f| f.name() == name)
}

/// Detects keypoints and computes descriptors on one image role (model or
/// scene). Two extractors configured with matching families share the same
/// algorithm instance.
pub struct FeatureExtractor {
    feature_family: FeatureFamily,
    descriptor_family: DescriptorFamily,
    detect_algo: Arc<Algorithm>,
    describe_algo: Arc<Algorithm>,
    features: FeatureSet,
    detect_time: RunningStats,
    describe_time: RunningStats,
    total_time: RunningStats,
}

impl FeatureExtractor {
    /// Builds an extractor with the family's default paired descriptor.
    pub fn new(family: FeatureFamily) -> Result<FeatureExtractor> {
        let descriptor_family = default_descriptor(family);
        let detect_algo = Arc::new(Algorithm::for_feature(family)?);
        let describe_algo = if detect_algo.descriptor.is_some()
            && detect_algo.name == descriptor_family.name()
        {
            detect_algo.clone()
        } else {
            Arc::new(Algorithm::for_descriptor(descriptor_family)?)
        };
        Ok(FeatureExtractor {
            feature_family: family,
            descriptor_family,
            detect_algo,
            describe_algo,
            features: FeatureSet::empty_binary(32),
            detect_time: RunningStats::new(),
            describe_time: RunningStats::new(),
            total_time: RunningStats::new(),
        })
    }

    pub fn feature_family(&self) -> FeatureFamily {
        self.feature_family
    }

    pub fn descriptor_family(&self) -> DescriptorFamily {
        self.descriptor_family
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn clear(&mut self) {
        self.features.clear();
    }

    /// Selects the detector family.
    ///
    /// Accumulated keypoints/descriptors are cleared. If the sibling
    /// extractor already runs an algorithm of the same name, its instance is
    /// shared instead of reconstructed; likewise the extractor's own
    /// descriptor instance is reused when the names coincide.
    pub fn set_feature_family(
        &mut self,
        family: FeatureFamily,
        sibling: Option<&FeatureExtractor>,
    ) -> Result<()> {
        self.features.clear();
        if let Some(sib) = sibling
            && sib.detect_algo.name == family.name()
            && sib.detect_algo.detector.is_some()
        {
            trace!("sharing detector instance '{}' with sibling", family.name());
            self.detect_algo = sib.detect_algo.clone();
        } else if self.describe_algo.name == family.name()
            && self.describe_algo.detector.is_some()
        {
            self.detect_algo = self.describe_algo.clone();
        } else {
            self.detect_algo = Arc::new(Algorithm::for_feature(family)?);
        }
        self.feature_family = family;
        Ok(())
    }

    /// Selects the descriptor family, with the same sharing rules as
    /// `set_feature_family`.
    pub fn set_descriptor_family(
        &mut self,
        family: DescriptorFamily,
        sibling: Option<&FeatureExtractor>,
    ) -> Result<()> {
        self.features.clear();
        if let Some(sib) = sibling
            && sib.describe_algo.name == family.name()
            && sib.describe_algo.descriptor.is_some()
        {
            trace!(
                "sharing descriptor instance '{}' with sibling",
                family.name()
            );
            self.describe_algo = sib.describe_algo.clone();
        } else if self.detect_algo.name == family.name() && self.detect_algo.descriptor.is_some() {
            self.describe_algo = self.detect_algo.clone();
        } else {
            self.describe_algo = Arc::new(Algorithm::for_descriptor(family)?);
        }
        self.descriptor_family = family;
        Ok(())
    }

    /// True when this extractor's detector instance is the same object as
    /// the other's.
    pub fn shares_detector_with(&self, other: &FeatureExtractor) -> bool {
        Arc::ptr_eq(&self.detect_algo, &other.detect_algo)
    }

    pub fn shares_descriptor_with(&self, other: &FeatureExtractor) -> bool {
        Arc::ptr_eq(&self.describe_algo, &other.describe_algo)
    }

    /// Detects keypoints and computes their descriptors on `image`.
    ///
    /// Multi-channel sources are collapsed to intensity first; anything that
    /// is not 1- or 3-channel is rejected.
    pub fn detect_and_describe(&self, image: &DynamicImage) -> Result<FeatureSet> {
        let gray = to_intensity(image)?;
        let detector = self
            .detect_algo
            .detector
            .as_ref()
            .ok_or_else(|| CoreError::AlgorithmAllocationFailure {
                family: self.detect_algo.name.to_string(),
            })?;
        let descriptor = self
            .describe_algo
            .descriptor
            .as_ref()
            .ok_or_else(|| CoreError::AlgorithmAllocationFailure {
                family: self.describe_algo.name.to_string(),
            })?;
        let keypoints = detector.detect(&gray);
        let descriptors = descriptor.describe(&gray, &keypoints);
        debug_assert_eq!(descriptors.rows(), keypoints.len());
        Ok(FeatureSet {
            keypoints,
            descriptors,
        })
    }

    /// Re-detects and re-describes on the current image, recording detection
    /// and description time separately plus a combined total.
    pub fn update(&mut self, image: &DynamicImage) -> Result<()> {
        let gray = to_intensity(image)?;
        let detector = self
            .detect_algo
            .detector
            .as_ref()
            .ok_or_else(|| CoreError::AlgorithmAllocationFailure {
                family: self.detect_algo.name.to_string(),
            })?;
        let descriptor = self
            .describe_algo
            .descriptor
            .as_ref()
            .ok_or_else(|| CoreError::AlgorithmAllocationFailure {
                family: self.describe_algo.name.to_string(),
            })?;

        let t0 = Instant::now();
        let keypoints = detector.detect(&gray);
        let detect_sec = t0.elapsed().as_secs_f64();

        let t1 = Instant::now();
        let descriptors = descriptor.describe(&gray, &keypoints);
        let describe_sec = t1.elapsed().as_secs_f64();

        self.detect_time.push(detect_sec);
        self.describe_time.push(describe_sec);
        self.total_time.push(detect_sec + describe_sec);

        self.features = FeatureSet {
            keypoints,
            descriptors,
        };
        Ok(())
    }

    /// Keypoints at `indices[subindices]` if subindices are given, else at
    /// `indices`; out-of-range entries are skipped.
    pub fn extract_selected(
        &self,
        indices: &[usize],
        subindices: Option<&[usize]>,
    ) -> Vec<Keypoint> {
        let pick = |i: usize| self.features.keypoints.get(i).copied();
        match subindices {
            Some(subs) => subs
                .iter()
                .filter_map(|&s| indices.get(s).and_then(|&i| pick(i)))
                .collect(),
            None => indices.iter().filter_map(|&i| pick(i)).collect(),
        }
    }

    pub fn detect_time(&self) -> &RunningStats {
        &self.detect_time
    }

    pub fn describe_time(&self) -> &RunningStats {
        &self.describe_time
    }

    pub fn total_time(&self) -> &RunningStats {
        &self.total_time
    }

    pub fn reset_time_stats(&mut self) {
        self.detect_time.reset();
        self.describe_time.reset();
        self.total_time.reset();
    }
}

/// Collapses a 3-channel image to intensity; 1-channel passes through.
pub fn to_intensity(image: &DynamicImage) -> Result<GrayImage> {
    if image.width() == 0 || image.height() == 0 {
        return Err(CoreError::NullImageData);
    }
    let channels = image.color().channel_count();
    match channels {
        1 => Ok(image.to_luma8()),
        3 => Ok(image.to_luma8()),
        c => Err(CoreError::InvalidImageType { channels: c }),
    }
}
