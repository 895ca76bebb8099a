use log::warn;

use crate::error::{CoreError, Result};
use crate::features::{DescriptorClass, Descriptors};

/// Matcher families. Each declares which descriptor content it can handle;
/// the pipeline's compatibility fix-up keeps selections consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherFamily {
    /// Brute force, L2 metric.
    BruteForce,
    /// Brute force, L1 metric.
    BruteForceL1,
    /// Brute force, Hamming metric.
    BruteForceHamming,
    /// Brute force, Hamming over 2-bit blocks.
    BruteForceHamming2,
    /// Approximate search over a projection ordering.
    Flann,
}

pub const MATCHER_FAMILIES: [MatcherFamily; 5] = [
    MatcherFamily::BruteForce,
    MatcherFamily::BruteForceL1,
    MatcherFamily::BruteForceHamming,
    MatcherFamily::BruteForceHamming2,
    MatcherFamily::Flann,
];

impl MatcherFamily {
    pub fn name(&self) -> &'static str {
        match self {
            MatcherFamily::BruteForce => "BruteForce",
            MatcherFamily::BruteForceL1 => "BruteForce-L1",
            MatcherFamily::BruteForceHamming => "BruteForce-Hamming",
            MatcherFamily::BruteForceHamming2 => "BruteForce-Hamming2",
            MatcherFamily::Flann => "Flann",
        }
    }

    pub fn supports_binary(&self) -> bool {
        matches!(
            self,
            MatcherFamily::BruteForceHamming | MatcherFamily::BruteForceHamming2
        )
    }

    pub fn supports_valued(&self) -> bool {
        matches!(
            self,
            MatcherFamily::BruteForce | MatcherFamily::BruteForceL1 | MatcherFamily::Flann
        )
    }

    pub fn supports(&self, class: DescriptorClass) -> bool {
        match class {
            DescriptorClass::Binary => self.supports_binary(),
            DescriptorClass::Valued => self.supports_valued(),
        }
    }
}

/// How the correspondence set is built from the two descriptor sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// One nearest model match per scene descriptor.
    Simple,
    /// Mutual agreement within the top-k lists of both directions.
    KnnCross,
    /// Mutual agreement within a distance radius.
    RadiusCross,
}

pub const KNN_MIN: usize = 1;
pub const KNN_MAX: usize = 5;
pub const RADIUS_MIN: f32 = 0.0;
pub const RADIUS_MAX: f32 = 1.0;

/// Index pairs into the model and scene feature sets plus match distances.
/// Replaced wholesale on every successful update.
#[derive(Debug, Clone, Default)]
pub struct MatchSet {
    pub model_idx: Vec<usize>,
    pub scene_idx: Vec<usize>,
    pub distance: Vec<f32>,
}

impl MatchSet {
    pub fn len(&self) -> usize {
        self.model_idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.model_idx.is_empty()
    }
}

/// Match-distance statistics over the accepted correspondence set.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchStats {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std: f32,
}

pub struct DescriptorMatcher {
    family: MatcherFamily,
    mode: MatchMode,
    knn: usize,
    radius: f32,
    matches: MatchSet,
    stats: MatchStats,
}

impl Default for DescriptorMatcher {
    fn default() -> Self {
        DescriptorMatcher::new(MatcherFamily::BruteForceHamming, MatchMode::KnnCross)
    }
}

impl DescriptorMatcher {
    pub fn new(family: MatcherFamily, mode: MatchMode) -> DescriptorMatcher {
        DescriptorMatcher {
            family,
            mode,
            knn: 2,
            radius: 0.25,
            matches: MatchSet::default(),
            stats: MatchStats::default(),
        }
    }

    pub fn family(&self) -> MatcherFamily {
        self.family
    }

    pub fn set_family(&mut self, family: MatcherFamily) {
        self.family = family;
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: MatchMode) {
        self.mode = mode;
    }

    pub fn knn(&self) -> usize {
        self.knn
    }

    /// k for the cross-checked k-nearest mode, clamped to [1, 5].
    pub fn set_knn(&mut self, k: usize) {
        self.knn = k.clamp(KNN_MIN, KNN_MAX);
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    /// Radius for the cross-checked radius mode, clamped to [0, 1].
    pub fn set_radius(&mut self, radius: f32) {
        self.radius = radius.clamp(RADIUS_MIN, RADIUS_MAX);
    }

    pub fn matches(&self) -> &MatchSet {
        &self.matches
    }

    pub fn stats(&self) -> MatchStats {
        self.stats
    }

    /// Builds a new correspondence set from the two descriptor matrices.
    ///
    /// Fails with `DescriptorsUnset` when either reference is absent, or
    /// `IncompatibleDescriptors` when the storages disagree in content type
    /// or the matcher cannot handle it. The previous set stays untouched on
    /// every failure.
    pub fn update(
        &mut self,
        model: Option<&Descriptors>,
        scene: Option<&Descriptors>,
    ) -> Result<()> {
        let model = model.ok_or(CoreError::DescriptorsUnset { which: "model" })?;
        let scene = scene.ok_or(CoreError::DescriptorsUnset { which: "scene" })?;
        if model.class() != scene.class() {
            warn!("model/scene descriptor content types disagree");
            return Err(CoreError::IncompatibleDescriptors {
                detail: "model and scene content types disagree",
            });
        }
        if !self.family.supports(model.class()) {
            warn!(
                "matcher {} cannot handle {:?} descriptors",
                self.family.name(),
                model.class()
            );
            return Err(CoreError::IncompatibleDescriptors {
                detail: "matcher does not support this content type",
            });
        }

        let matches = match self.mode {
            MatchMode::Simple => self.match_simple(model, scene),
            MatchMode::KnnCross => self.match_cross(model, scene, Candidates::Knn(self.knn)),
            MatchMode::RadiusCross => {
                self.match_cross(model, scene, Candidates::Radius(self.radius))
            }
        };
        self.stats = compute_stats(&matches.distance);
        self.matches = matches;
        Ok(())
    }

    fn match_simple(&self, model: &Descriptors, scene: &Descriptors) -> MatchSet {
        let mut out = MatchSet::default();
        for s in 0..scene.rows() {
            if let Some((m, d)) = self.best_candidates(scene, s, model, 1).first().copied() {
                out.model_idx.push(m);
                out.scene_idx.push(s);
                out.distance.push(d);
            }
        }
        out
    }

    /// Cross-checked matching: a pair (s, m) is accepted only when m is in
    /// the forward candidate list of s and s is in the backward candidate
    /// list of m. The first agreeing pair in candidate order wins per scene
    /// descriptor.
    fn match_cross(
        &self,
        model: &Descriptors,
        scene: &Descriptors,
        candidates: Candidates,
    ) -> MatchSet {
        let forward: Vec<Vec<(usize, f32)>> = (0..scene.rows())
            .map(|s| self.candidate_list(scene, s, model, candidates))
            .collect();
        let backward: Vec<Vec<(usize, f32)>> = (0..model.rows())
            .map(|m| self.candidate_list(model, m, scene, candidates))
            .collect();

        let mut out = MatchSet::default();
        for (s, fwd) in forward.iter().enumerate() {
            'fwd: for &(m, d) in fwd {
                for &(s_back, _) in &backward[m] {
                    if s_back == s {
                        out.model_idx.push(m);
                        out.scene_idx.push(s);
                        out.distance.push(d);
                        break 'fwd;
                    }
                }
            }
        }
        out
    }

    fn candidate_list(
        &self,
        queries: &Descriptors,
        q: usize,
        targets: &Descriptors,
        candidates: Candidates,
    ) -> Vec<(usize, f32)> {
        match candidates {
            Candidates::Knn(k) => self.best_candidates(queries, q, targets, k),
            Candidates::Radius(r) => {
                let mut all = self.best_candidates(queries, q, targets, targets.rows());
                all.retain(|&(_, d)| d <= r);
                all
            }
        }
    }

    /// k best targets for one query row, ascending by distance.
    fn best_candidates(
        &self,
        queries: &Descriptors,
        q: usize,
        targets: &Descriptors,
        k: usize,
    ) -> Vec<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = match self.family {
            MatcherFamily::Flann => {
                // Examine a window around the query in projection order and
                // rank those by exact distance.
                let keys: Vec<(usize, f32)> = {
                    let mut keys: Vec<(usize, f32)> = (0..targets.rows())
                        .map(|t| (t, projection_key(targets, t)))
                        .collect();
                    keys.sort_by(|a, b| a.1.total_cmp(&b.1));
                    keys
                };
                let qkey = projection_key(queries, q);
                let pos = keys.partition_point(|&(_, key)| key < qkey);
                let lo = pos.saturating_sub(32);
                let hi = (pos + 32).min(keys.len());
                keys[lo..hi]
                    .iter()
                    .map(|&(t, _)| (t, row_distance(self.family, queries, q, targets, t)))
                    .collect()
            }
            _ => (0..targets.rows())
                .map(|t| (t, row_distance(self.family, queries, q, targets, t)))
                .collect(),
        };
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(k);
        scored
    }
}

#[derive(Clone, Copy)]
enum Candidates {
    Knn(usize),
    Radius(f32),
}

/// Distance between two descriptor rows, normalized so binary distances are
/// the fraction of differing bits and valued descriptors (unit vectors)
/// stay in a comparable small range.
fn row_distance(
    family: MatcherFamily,
    a: &Descriptors,
    ai: usize,
    b: &Descriptors,
    bi: usize,
) -> f32 {
    match (a, b) {
        (Descriptors::Binary { .. }, Descriptors::Binary { .. }) => {
            let ra = a.binary_row(ai);
            let rb = b.binary_row(bi);
            match family {
                MatcherFamily::BruteForceHamming2 => hamming2(ra, rb),
                _ => hamming(ra, rb),
            }
        }
        (Descriptors::Valued { .. }, Descriptors::Valued { .. }) => {
            let ra = a.valued_row(ai);
            let rb = b.valued_row(bi);
            match family {
                MatcherFamily::BruteForceL1 => l1(ra, rb),
                _ => l2(ra, rb),
            }
        }
        _ => f32::MAX,
    }
}

fn hamming(a: &[u8], b: &[u8]) -> f32 {
    let bits: u32 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum();
    bits as f32 / (8 * a.len()) as f32
}

/// Counts differing 2-bit blocks instead of bits.
fn hamming2(a: &[u8], b: &[u8]) -> f32 {
    let blocks: u32 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x ^ y;
            (((d | (d >> 1)) & 0x55) as u32).count_ones()
        })
        .sum();
    blocks as f32 / (4 * a.len()) as f32
}

fn l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

fn l1(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum::<f32>() / a.len() as f32
}

fn projection_key(d: &Descriptors, row: usize) -> f32 {
    match d {
        Descriptors::Valued { .. } => d.valued_row(row).iter().sum(),
        Descriptors::Binary { .. } => d
            .binary_row(row)
            .iter()
            .map(|b| b.count_ones() as f32)
            .sum(),
    }
}

fn compute_stats(distances: &[f32]) -> MatchStats {
    if distances.is_empty() {
        return MatchStats::default();
    }
    let n = distances.len() as f32;
    let mean = distances.iter().sum::<f32>() / n;
    let var = distances.iter().map(|d| (d - mean) * (d - mean)).sum::<f32>() / n;
    MatchStats {
        min: distances.iter().copied().fold(f32::MAX, f32::min),
        max: distances.iter().copied().fold(f32::MIN, f32::max),
        mean,
        std: var.sqrt(),
    }
}
