use image::GrayImage;

use super::detect::FeatureFamily;
use super::types::{DescriptorClass, Descriptors, Keypoint};
use crate::error::{CoreError, Result};

/// Descriptor families selectable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorFamily {
    Brief,
    Orb,
    Brisk,
    Freak,
    Latch,
    Sift,
    Surf,
    Daisy,
}

pub const DESCRIPTOR_FAMILIES: [DescriptorFamily; 8] = [
    DescriptorFamily::Brief,
    DescriptorFamily::Orb,
    DescriptorFamily::Brisk,
    DescriptorFamily::Freak,
    DescriptorFamily::Latch,
    DescriptorFamily::Sift,
    DescriptorFamily::Surf,
    DescriptorFamily::Daisy,
];

impl DescriptorFamily {
    pub fn name(&self) -> &'static str {
        match self {
            DescriptorFamily::Brief => "BRIEF",
            DescriptorFamily::Orb => "ORB",
            DescriptorFamily::Brisk => "BRISK",
            DescriptorFamily::Freak => "FREAK",
            DescriptorFamily::Latch => "LATCH",
            DescriptorFamily::Sift => "SIFT",
            DescriptorFamily::Surf => "SURF",
            DescriptorFamily::Daisy => "DAISY",
        }
    }

    /// Fixed binary/valued classification driving matcher compatibility.
    pub fn class(&self) -> DescriptorClass {
        match self {
            DescriptorFamily::Brief
            | DescriptorFamily::Orb
            | DescriptorFamily::Brisk
            | DescriptorFamily::Freak
            | DescriptorFamily::Latch => DescriptorClass::Binary,
            DescriptorFamily::Sift | DescriptorFamily::Surf | DescriptorFamily::Daisy => {
                DescriptorClass::Valued
            }
        }
    }
}

/// The one descriptor used when a detector family with no natural
/// descriptor of its own is selected.
pub fn default_descriptor(family: FeatureFamily) -> DescriptorFamily {
    match family {
        FeatureFamily::Fast => DescriptorFamily::Brief,
        FeatureFamily::Agast => DescriptorFamily::Brief,
        FeatureFamily::Orb => DescriptorFamily::Orb,
        FeatureFamily::Brisk => DescriptorFamily::Brisk,
        FeatureFamily::Akaze => DescriptorFamily::Latch,
        FeatureFamily::Gftt => DescriptorFamily::Brief,
        FeatureFamily::Harris => DescriptorFamily::Brief,
        FeatureFamily::Sift => DescriptorFamily::Sift,
        FeatureFamily::Star => DescriptorFamily::Freak,
        FeatureFamily::Mser => DescriptorFamily::Sift,
    }
}

/// Sampling pattern learned for rBRIEF, 256 point pairs in a 31x31 patch.
const ORB_PATTERN: [(i8, i8, i8, i8); 256] = [
    (8, -3, 9, 5), (-11, 9, -8, 2), (3, -12, -13, 2), (-3, -7, -4, 5),
    (1, -11, 12, -2), (1, -1, 11, -1), (4, -2, -5, -8), (2, -13, -8, 9),
    (-11, 1, 6, 2), (11, 11, 12, -1), (6, -12, -9, -8), (12, 5, 3, -6),
    (1, 1, -4, -1), (7, -4, -6, 7), (-3, 2, 9, -8), (-4, -8, 3, 3),
    (-5, 3, 0, -4), (2, -11, -13, 0), (10, 5, 5, 2), (0, 9, 10, -3),
    (5, -8, -10, 1), (8, 3, -8, -5), (2, -6, -9, -4), (-12, 2, 0, -10),
    (5, -10, -7, -2), (-7, 9, -1, 0), (0, -1, -3, 3), (-12, 5, -2, -1),
    (-1, 1, -5, -11), (-1, 2, -3, 0), (-5, -6, 7, -1), (4, 7, 0, -8),
    (-9, 9, 3, -13), (7, -3, 13, -7), (10, -4, -5, 3), (6, 1, -13, -13),
    (-12, -11, 7, 0), (0, -1, -8, -6), (-10, -5, -6, 7), (10, 2, -6, -12),
    (-11, 8, 4, -2), (9, 0, -11, -4), (0, 11, 6, -11), (4, 1, -10, -3),
    (-6, 12, 1, 12), (-4, -8, 8, -7), (-3, 0, 8, 3), (3, 3, -3, -1),
    (-6, -11, -2, 12), (0, -3, -6, -3), (-6, 3, -12, -8), (6, 3, -2, -10),
    (-3, -10, -1, 0), (11, 2, 11, 3), (1, -8, -10, 8), (2, -2, -7, 8),
    (0, -13, 13, 0), (6, -9, -1, -1), (7, 5, 6, 3), (-13, 7, -7, -7),
    (-5, -13, 5, -11), (6, 7, -2, 12), (-6, -11, 8, 6), (-2, -2, -5, 9),
    (5, 4, 7, -6), (0, 11, -4, -5), (10, 1, 2, -8), (-3, -10, -10, -10),
    (1, 9, 6, -5), (-7, -11, 11, 3), (11, -2, -4, 3), (7, -1, 5, 12),
    (-5, 5, -2, -5), (8, -11, -1, -13), (-13, 2, -11, -8), (-2, 9, 5, 0),
    (2, -5, 2, 0), (3, -13, -12, 9), (6, -3, 5, 4), (10, 10, 1, -9),
    (-13, -8, -4, 10), (2, -2, -3, 8), (-13, -11, -8, -3), (2, -4, -7, -3),
    (12, 0, -2, 13), (-11, 7, -10, -1), (-5, -10, 0, -11), (6, 7, 12, -3),
    (-1, -1, 8, -6), (-6, 3, -1, -3), (-2, -11, -11, -3), (12, -2, 3, -10),
    (-11, -1, -2, -8), (3, -1, 7, 3), (2, -2, -12, 12), (6, -4, 12, -2),
    (-3, 11, 2, -12), (-1, 3, 2, 3), (1, 3, -11, -3), (2, -8, -7, -5),
    (0, -5, -11, -6), (-12, 8, -2, 9), (3, -7, 9, -8), (-10, -6, -1, -11),
    (11, -6, -3, -13), (3, 0, 0, -8), (-5, -2, -1, -13), (-8, -5, -10, -13),
    (7, -13, 0, -3), (1, -4, -1, -13), (6, -5, -7, 8), (8, 7, -5, -13),
    (2, 0, -8, -6), (-8, -3, -13, -6), (-6, 5, 0, 6), (-8, 8, -9, 1),
    (10, 1, -9, 4), (-4, -8, -5, 7), (7, 7, 10, -8), (-7, -3, -1, 1),
    (10, -1, 3, 1), (5, 6, -10, -8), (-6, -13, 5, -8), (4, -3, -4, -13),
    (-3, 4, -2, -13), (10, -11, 9, 11), (-9, 0, 12, 2), (-4, -2, 13, -6),
    (2, -10, -6, 1), (11, -13, 4, -13), (1, -1, 1, 9), (1, -5, -13, -5),
    (7, 4, 12, -7), (0, -2, -8, 3), (7, 2, 2, -8), (-2, 7, -12, -4),
    (1, 11, 6, -2), (-1, -1, -4, 10), (0, 8, 0, -13), (3, 12, 5, -13),
    (-9, -1, 9, -13), (12, 4, -6, -4), (-13, 13, 1, -4), (0, -2, -7, -9),
    (10, -8, -13, 3), (2, -13, 6, 8), (10, -6, -7, 0), (-11, 7, -1, -7),
    (12, 0, 5, -4), (-7, -8, 4, -12), (-13, 5, -5, -2), (0, 5, 4, 4),
    (-2, -11, -1, 8), (9, 3, -1, -12), (0, 6, -10, 12), (1, -8, -7, -10),
    (-6, 4, -6, 3), (5, 1, -3, -9), (-6, 6, -6, 3), (7, -8, 1, -7),
    (3, 8, -9, -5), (2, -4, 5, 7), (11, 4, 6, -3), (-8, -1, 11, -1),
    (-3, -6, -10, -8), (2, 7, 3, -12), (-4, -10, 12, -3), (1, -2, -4, 6),
    (3, 11, -11, 0), (-6, 2, 3, -8), (6, 12, 0, -13), (3, 2, -2, -5),
    (-4, 1, -6, 5), (-12, 0, -13, 9), (-6, 2, 7, -8), (-2, -4, -6, 5),
    (0, 0, 0, -13), (9, -13, -2, 0), (3, -13, 5, -12), (10, 11, -13, -13),
    (-2, 3, -12, 3), (11, 7, -7, 0), (12, 2, 1, -13), (12, -11, 12, -8),
    (-7, -2, -4, -7), (7, 5, -1, -13), (-5, -8, -9, 10), (6, 0, -3, -13),
    (12, 4, -13, 1), (-7, 8, 8, -3), (10, -4, 0, -13), (2, 1, -7, 0),
    (-5, 4, 2, -8), (12, 8, 4, -13), (8, 7, -10, 0), (-3, 6, -2, 4),
    (-5, -1, -8, -12), (4, -1, -2, -10), (6, -4, -13, 9), (-7, 8, -6, -12),
    (-10, 2, -13, 10), (-1, -7, 0, 2), (-5, 6, -5, -12), (6, -13, 7, -3),
    (-13, 2, -1, 8), (2, 8, -13, 0), (-6, -9, 1, -4), (-9, 13, 0, -13),
    (-2, -3, 8, 0), (4, 0, -11, 12), (0, 3, -10, 10), (-6, -9, -3, -2),
    (9, -4, -6, 2), (5, 0, -13, -10), (-3, -8, -13, 3), (-12, -1, -4, -2),
    (7, -9, -4, 3), (-8, -4, 1, 11), (11, 6, 2, -12), (6, 6, -8, 12),
    (-3, -8, 2, -10), (2, 5, -8, 8), (-9, 8, -6, -8), (-4, 0, -11, -7),
    (7, 6, -3, 8), (-5, 7, -12, 5), (2, -8, -5, 1), (0, 4, -5, -3),
    (9, -9, -6, -12), (0, -13, 0, -13), (-7, -11, -3, -13), (6, -12, -7, 10),
    (6, -8, -13, 7), (8, 7, -11, -1), (-11, -5, -6, 9), (6, 4, 2, -13),
    (-1, -6, 3, -9), (1, -4, 4, -3), (-6, 8, -12, 0), (-11, 3, -6, 2),
    (7, -10, 11, -6), (5, 0, 12, -13), (4, -8, 1, -1), (-13, 12, -6, 3),
    (1, 4, -9, -2), (-8, -12, -8, 7), (-9, 5, 0, -5), (9, 7, 5, 3),
    (-12, -2, 8, -8), (3, 7, 12, -8), (-13, 3, -1, -1), (-10, -4, -10, 12),
    (5, -2, 0, 13), (-7, 1, -12, 8), (2, 9, -5, -11), (11, -13, 0, 2),
];

/// A constructed descriptor instance.
///
/// Binary families carry their sampling pattern, generated at construction
/// so model and scene extractors can share one instance.
#[derive(Debug, Clone)]
pub struct DescriptorAlgo {
    pub family: DescriptorFamily,
    pairs: Vec<(f32, f32, f32, f32)>,
}

impl DescriptorAlgo {
    pub fn new(family: DescriptorFamily) -> Result<DescriptorAlgo> {
        let pairs = match family {
            DescriptorFamily::Brief | DescriptorFamily::Orb | DescriptorFamily::Latch => {
                ORB_PATTERN
                    .iter()
                    .map(|&(x0, y0, x1, y1)| (x0 as f32, y0 as f32, x1 as f32, y1 as f32))
                    .collect()
            }
            DescriptorFamily::Brisk => concentric_pairs(&[4.0, 8.0, 12.0, 16.0], 10, true, 512),
            DescriptorFamily::Freak => concentric_pairs(&[3.0, 7.0, 12.0, 18.0], 8, false, 512),
            DescriptorFamily::Sift | DescriptorFamily::Surf | DescriptorFamily::Daisy => {
                Vec::new()
            }
        };
        let needed = match family {
            DescriptorFamily::Brisk | DescriptorFamily::Freak => 512,
            DescriptorFamily::Brief | DescriptorFamily::Orb | DescriptorFamily::Latch => 256,
            _ => 0,
        };
        if pairs.len() < needed {
            return Err(CoreError::AlgorithmAllocationFailure {
                family: family.name().to_string(),
            });
        }
        Ok(DescriptorAlgo { family, pairs })
    }

    pub fn class(&self) -> DescriptorClass {
        self.family.class()
    }

    /// Row width of the descriptor matrix this instance produces.
    pub fn row_len(&self) -> usize {
        match self.family {
            DescriptorFamily::Brief | DescriptorFamily::Orb | DescriptorFamily::Latch => 32,
            DescriptorFamily::Brisk | DescriptorFamily::Freak => 64,
            DescriptorFamily::Sift => 128,
            DescriptorFamily::Surf => 64,
            DescriptorFamily::Daisy => 72,
        }
    }

    /// Computes one descriptor row per keypoint, preserving order.
    pub fn describe(&self, image: &GrayImage, keypoints: &[Keypoint]) -> Descriptors {
        match self.class() {
            DescriptorClass::Binary => {
                let bytes_per_row = self.row_len();
                let mut data = Vec::with_capacity(bytes_per_row * keypoints.len());
                for kp in keypoints {
                    match self.family {
                        DescriptorFamily::Latch => {
                            data.extend_from_slice(&latch_row(image, kp, &self.pairs));
                        }
                        _ => {
                            let rotate = self.family != DescriptorFamily::Brief;
                            binary_row(image, kp, &self.pairs, rotate, &mut data);
                        }
                    }
                }
                Descriptors::Binary { bytes_per_row, data }
            }
            DescriptorClass::Valued => {
                let dim = self.row_len();
                let mut data = Vec::with_capacity(dim * keypoints.len());
                for kp in keypoints {
                    let row = match self.family {
                        DescriptorFamily::Sift => sift_row(image, kp),
                        DescriptorFamily::Surf => surf_row(image, kp),
                        DescriptorFamily::Daisy => daisy_row(image, kp),
                        _ => unreachable!(),
                    };
                    data.extend_from_slice(&row);
                }
                Descriptors::Valued { dim, data }
            }
        }
    }
}

/// Deterministic concentric sampling pattern: points on the given rings,
/// all pairs ranked by distance, the `count` shortest (short pattern) or
/// longest (long pattern) kept.
fn concentric_pairs(
    radii: &[f32],
    points_per_ring: usize,
    short: bool,
    count: usize,
) -> Vec<(f32, f32, f32, f32)> {
    let mut points = vec![(0.0f32, 0.0f32)];
    for (ring, &r) in radii.iter().enumerate() {
        for i in 0..points_per_ring {
            let phase = if ring % 2 == 0 { 0.0 } else { 0.5 };
            let a = (i as f32 + phase) * std::f32::consts::TAU / points_per_ring as f32;
            points.push((r * a.cos(), r * a.sin()));
        }
    }
    let mut pairs = Vec::new();
    for i in 0..points.len() {
        for j in (i + 1)..points.len() {
            let dx = points[j].0 - points[i].0;
            let dy = points[j].1 - points[i].1;
            let d = dx * dx + dy * dy;
            pairs.push((d, (points[i].0, points[i].1, points[j].0, points[j].1)));
        }
    }
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    if !short {
        pairs.reverse();
    }
    pairs.truncate(count);
    pairs.into_iter().map(|(_, p)| p).collect()
}

fn px(image: &GrayImage, x: i32, y: i32) -> f32 {
    let cx = x.clamp(0, image.width() as i32 - 1) as u32;
    let cy = y.clamp(0, image.height() as i32 - 1) as u32;
    image.get_pixel(cx, cy)[0] as f32
}

fn binary_row(
    image: &GrayImage,
    kp: &Keypoint,
    pairs: &[(f32, f32, f32, f32)],
    rotate: bool,
    out: &mut Vec<u8>,
) {
    let x = kp.x.round() as i32;
    let y = kp.y.round() as i32;
    let (sin_a, cos_a) = if rotate { kp.angle.sin_cos() } else { (0.0, 1.0) };
    for chunk in pairs.chunks(8) {
        let mut byte = 0u8;
        for (bit, &(x0, y0, x1, y1)) in chunk.iter().enumerate() {
            let r0x = (x0 * cos_a - y0 * sin_a).round() as i32;
            let r0y = (x0 * sin_a + y0 * cos_a).round() as i32;
            let r1x = (x1 * cos_a - y1 * sin_a).round() as i32;
            let r1y = (x1 * sin_a + y1 * cos_a).round() as i32;
            if px(image, x + r0x, y + r0y) < px(image, x + r1x, y + r1y) {
                byte |= 1 << bit;
            }
        }
        out.push(byte);
    }
}

/// Patch-triplet comparisons: bit set when the first 3x3 patch is closer to
/// the anchor patch at the keypoint than the second one.
fn latch_row(image: &GrayImage, kp: &Keypoint, pairs: &[(f32, f32, f32, f32)]) -> [u8; 32] {
    let x = kp.x.round() as i32;
    let y = kp.y.round() as i32;
    let patch_mean = |cx: i32, cy: i32| -> f32 {
        let mut s = 0.0;
        for dy in -1..=1 {
            for dx in -1..=1 {
                s += px(image, cx + dx, cy + dy);
            }
        }
        s / 9.0
    };
    let anchor = patch_mean(x, y);
    let mut desc = [0u8; 32];
    for (i, &(x0, y0, x1, y1)) in pairs.iter().enumerate() {
        let a = patch_mean(x + x0 as i32, y + y0 as i32);
        let b = patch_mean(x + x1 as i32, y + y1 as i32);
        if (a - anchor).abs() < (b - anchor).abs() {
            desc[i / 8] |= 1 << (i % 8);
        }
    }
    desc
}

/// 4x4 spatial cells x 8 orientation bins of gradient magnitude over a
/// 16x16 patch rotated to the keypoint orientation, normalized and clipped.
fn sift_row(image: &GrayImage, kp: &Keypoint) -> Vec<f32> {
    let mut hist = vec![0.0f32; 128];
    let (sin_a, cos_a) = kp.angle.sin_cos();
    for v in 0..16 {
        for u in 0..16 {
            let lu = u as f32 - 7.5;
            let lv = v as f32 - 7.5;
            let sx = kp.x + lu * cos_a - lv * sin_a;
            let sy = kp.y + lu * sin_a + lv * cos_a;
            let xi = sx.round() as i32;
            let yi = sy.round() as i32;
            let gx = (px(image, xi + 1, yi) - px(image, xi - 1, yi)) * 0.5;
            let gy = (px(image, xi, yi + 1) - px(image, xi, yi - 1)) * 0.5;
            let mag = (gx * gx + gy * gy).sqrt();
            let ori = gy.atan2(gx) - kp.angle;
            let mut bin = (ori / std::f32::consts::TAU * 8.0).rem_euclid(8.0) as usize;
            if bin >= 8 {
                bin = 7;
            }
            let cell = (v / 4) * 4 + u / 4;
            hist[cell * 8 + bin] += mag;
        }
    }
    normalize_clipped(&mut hist, 0.2);
    hist
}

/// 4x4 cells of (sum dx, sum |dx|, sum dy, sum |dy|) over a 20x20 patch.
fn surf_row(image: &GrayImage, kp: &Keypoint) -> Vec<f32> {
    let mut desc = vec![0.0f32; 64];
    let (sin_a, cos_a) = kp.angle.sin_cos();
    for v in 0..20 {
        for u in 0..20 {
            let lu = u as f32 - 9.5;
            let lv = v as f32 - 9.5;
            let sx = kp.x + lu * cos_a - lv * sin_a;
            let sy = kp.y + lu * sin_a + lv * cos_a;
            let xi = sx.round() as i32;
            let yi = sy.round() as i32;
            let dx = px(image, xi + 1, yi) - px(image, xi - 1, yi);
            let dy = px(image, xi, yi + 1) - px(image, xi, yi - 1);
            let cell = (v / 5) * 4 + u / 5;
            desc[cell * 4] += dx;
            desc[cell * 4 + 1] += dx.abs();
            desc[cell * 4 + 2] += dy;
            desc[cell * 4 + 3] += dy.abs();
        }
    }
    normalize(&mut desc);
    desc
}

/// Orientation histograms at the center and on two rings of four points.
fn daisy_row(image: &GrayImage, kp: &Keypoint) -> Vec<f32> {
    let mut centers = vec![(kp.x, kp.y)];
    for &r in &[5.0f32, 10.0] {
        for i in 0..4 {
            let a = i as f32 * std::f32::consts::FRAC_PI_2 + kp.angle;
            centers.push((kp.x + r * a.cos(), kp.y + r * a.sin()));
        }
    }
    let mut desc = Vec::with_capacity(72);
    for &(cx, cy) in &centers {
        let mut hist = [0.0f32; 8];
        for dy in -2i32..=2 {
            for dx in -2i32..=2 {
                let xi = cx.round() as i32 + dx;
                let yi = cy.round() as i32 + dy;
                let gx = (px(image, xi + 1, yi) - px(image, xi - 1, yi)) * 0.5;
                let gy = (px(image, xi, yi + 1) - px(image, xi, yi - 1)) * 0.5;
                let mag = (gx * gx + gy * gy).sqrt();
                let ori = gy.atan2(gx) - kp.angle;
                let mut bin = (ori / std::f32::consts::TAU * 8.0).rem_euclid(8.0) as usize;
                if bin >= 8 {
                    bin = 7;
                }
                hist[bin] += mag;
            }
        }
        desc.extend_from_slice(&hist);
    }
    normalize(&mut desc);
    desc
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

fn normalize_clipped(v: &mut [f32], clip: f32) {
    normalize(v);
    for x in v.iter_mut() {
        *x = x.min(clip);
    }
    normalize(v);
}
