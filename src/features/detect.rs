use image::{GrayImage, imageops};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::HashSet;

use super::types::Keypoint;
use crate::error::{CoreError, Result};

/// Keypoint detector families selectable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureFamily {
    Fast,
    Agast,
    Orb,
    Brisk,
    Akaze,
    Gftt,
    Harris,
    Sift,
    Star,
    Mser,
}

pub const FEATURE_FAMILIES: [FeatureFamily; 10] = [
    FeatureFamily::Fast,
    FeatureFamily::Agast,
    FeatureFamily::Orb,
    FeatureFamily::Brisk,
    FeatureFamily::Akaze,
    FeatureFamily::Gftt,
    FeatureFamily::Harris,
    FeatureFamily::Sift,
    FeatureFamily::Star,
    FeatureFamily::Mser,
];

impl FeatureFamily {
    pub fn name(&self) -> &'static str {
        match self {
            FeatureFamily::Fast => "FAST",
            FeatureFamily::Agast => "AGAST",
            FeatureFamily::Orb => "ORB",
            FeatureFamily::Brisk => "BRISK",
            FeatureFamily::Akaze => "AKAZE",
            FeatureFamily::Gftt => "GFTT",
            FeatureFamily::Harris => "HARRIS",
            FeatureFamily::Sift => "SIFT",
            FeatureFamily::Star => "STAR",
            FeatureFamily::Mser => "MSER",
        }
    }
}

const FAST_CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

#[derive(Debug, Clone, Copy)]
enum Kernel {
    /// FAST segment test; arc is the required contiguous run length.
    SegmentTest { threshold: u8, arc: usize },
    /// Structure-tensor corner score; Harris or Shi-Tomasi (min eigenvalue).
    CornerScore { harris: bool },
    /// Difference-of-Gaussian blob extrema.
    DogBlob { sigma: f32 },
    /// Center-surround box-filter response extrema.
    CenterSurround,
    /// Centroids of thresholded connected regions.
    ExtremalRegions,
}

/// A constructed detector instance: kernel plus pyramid/orientation policy.
#[derive(Debug, Clone)]
pub struct Detector {
    pub family: FeatureFamily,
    kernel: Kernel,
    levels: u8,
    scale_factor: f32,
    oriented: bool,
    max_keypoints: usize,
    base_size: f32,
}

impl Detector {
    /// Builds the detector configuration for one family.
    ///
    /// Fails with `AlgorithmAllocationFailure` if the family parameters are
    /// degenerate (zero keypoint budget or empty pyramid).
    pub fn new(family: FeatureFamily) -> Result<Detector> {
        let d = match family {
            FeatureFamily::Fast => Detector {
                family,
                kernel: Kernel::SegmentTest {
                    threshold: 20,
                    arc: 9,
                },
                levels: 1,
                scale_factor: 1.0,
                oriented: false,
                max_keypoints: 1000,
                base_size: 7.0,
            },
            FeatureFamily::Agast => Detector {
                family,
                kernel: Kernel::SegmentTest {
                    threshold: 16,
                    arc: 12,
                },
                levels: 1,
                scale_factor: 1.0,
                oriented: false,
                max_keypoints: 1000,
                base_size: 7.0,
            },
            FeatureFamily::Orb => Detector {
                family,
                kernel: Kernel::SegmentTest {
                    threshold: 20,
                    arc: 9,
                },
                levels: 8,
                scale_factor: 1.2,
                oriented: true,
                max_keypoints: 500,
                base_size: 31.0,
            },
            FeatureFamily::Brisk => Detector {
                family,
                kernel: Kernel::SegmentTest {
                    threshold: 24,
                    arc: 9,
                },
                levels: 4,
                scale_factor: 1.5,
                oriented: true,
                max_keypoints: 500,
                base_size: 31.0,
            },
            FeatureFamily::Akaze => Detector {
                family,
                kernel: Kernel::CenterSurround,
                levels: 4,
                scale_factor: 1.4,
                oriented: true,
                max_keypoints: 500,
                base_size: 21.0,
            },
            FeatureFamily::Gftt => Detector {
                family,
                kernel: Kernel::CornerScore { harris: false },
                levels: 1,
                scale_factor: 1.0,
                oriented: false,
                max_keypoints: 800,
                base_size: 7.0,
            },
            FeatureFamily::Harris => Detector {
                family,
                kernel: Kernel::CornerScore { harris: true },
                levels: 1,
                scale_factor: 1.0,
                oriented: false,
                max_keypoints: 800,
                base_size: 7.0,
            },
            FeatureFamily::Sift => Detector {
                family,
                kernel: Kernel::DogBlob { sigma: 1.6 },
                levels: 4,
                scale_factor: 1.5,
                oriented: true,
                max_keypoints: 500,
                base_size: 16.0,
            },
            FeatureFamily::Star => Detector {
                family,
                kernel: Kernel::CenterSurround,
                levels: 2,
                scale_factor: 2.0,
                oriented: false,
                max_keypoints: 500,
                base_size: 21.0,
            },
            FeatureFamily::Mser => Detector {
                family,
                kernel: Kernel::ExtremalRegions,
                levels: 1,
                scale_factor: 1.0,
                oriented: false,
                max_keypoints: 400,
                base_size: 11.0,
            },
        };
        if d.max_keypoints == 0 || d.levels == 0 {
            return Err(CoreError::AlgorithmAllocationFailure {
                family: family.name().to_string(),
            });
        }
        Ok(d)
    }

    /// Detects keypoints across the pyramid, in original-image coordinates.
    pub fn detect(&self, image: &GrayImage) -> Vec<Keypoint> {
        let mut all = Vec::new();
        let mut level_img = image.clone();
        let mut scale = 1.0f32;
        for octave in 0..self.levels {
            if octave > 0 {
                let w = (level_img.width() as f32 / self.scale_factor) as u32;
                let h = (level_img.height() as f32 / self.scale_factor) as u32;
                if w < 32 || h < 32 {
                    break;
                }
                scale *= self.scale_factor;
                level_img = imageops::resize(&level_img, w, h, imageops::FilterType::Triangle);
            }
            let mut kps = match self.kernel {
                Kernel::SegmentTest { threshold, arc } => {
                    segment_test_keypoints(&level_img, threshold, arc)
                }
                Kernel::CornerScore { harris } => corner_keypoints(&level_img, harris),
                Kernel::DogBlob { sigma } => dog_keypoints(&level_img, sigma),
                Kernel::CenterSurround => center_surround_keypoints(&level_img),
                Kernel::ExtremalRegions => extremal_region_keypoints(&level_img),
            };
            for kp in &mut kps {
                if self.oriented {
                    kp.angle = intensity_centroid_angle(
                        &level_img,
                        kp.x.round() as i32,
                        kp.y.round() as i32,
                        7,
                    );
                }
                kp.x *= scale;
                kp.y *= scale;
                kp.octave = octave;
                kp.size = self.base_size * scale;
            }
            all.extend(kps);
        }
        retain_best(all, self.max_keypoints)
    }
}

/// FAST-style segment test over a 16-pixel Bresenham circle.
///
/// A pixel is a corner when `arc` contiguous circle pixels are all brighter
/// or all darker than the center by the threshold. Rows are scanned in
/// parallel; the 4-cardinal pre-check rejects most candidates early.
fn segment_test_keypoints(image: &GrayImage, threshold: u8, arc: usize) -> Vec<Keypoint> {
    let (width, height) = (image.width(), image.height());
    if width < 8 || height < 8 {
        return Vec::new();
    }
    let raw: Vec<Keypoint> = (3..height - 3)
        .into_par_iter()
        .flat_map_iter(|y| {
            let mut row = Vec::new();
            for x in 3..width - 3 {
                let center = image.get_pixel(x, y)[0];
                if !segment_pre_check(image, x, y, center, threshold) {
                    continue;
                }
                if let Some(response) = segment_full_check(image, x, y, center, threshold, arc) {
                    row.push(Keypoint {
                        x: x as f32,
                        y: y as f32,
                        size: 7.0,
                        angle: 0.0,
                        response,
                        octave: 0,
                    });
                }
            }
            row
        })
        .collect();
    grid_nms(raw, 5.0)
}

fn segment_pre_check(image: &GrayImage, x: u32, y: u32, center: u8, threshold: u8) -> bool {
    let bright = center.saturating_add(threshold);
    let dark = center.saturating_sub(threshold);
    let cardinal = [
        image.get_pixel(x, y - 3)[0],
        image.get_pixel(x + 3, y)[0],
        image.get_pixel(x, y + 3)[0],
        image.get_pixel(x - 3, y)[0],
    ];
    let nb = cardinal.iter().filter(|&&p| p > bright).count();
    let nd = cardinal.iter().filter(|&&p| p < dark).count();
    nb >= 3 || nd >= 3
}

/// Full arc test; response is the summed absolute contrast over the circle.
fn segment_full_check(
    image: &GrayImage,
    x: u32,
    y: u32,
    center: u8,
    threshold: u8,
    arc: usize,
) -> Option<f32> {
    let bright = center.saturating_add(threshold);
    let dark = center.saturating_sub(threshold);
    let mut max_bright_run = 0usize;
    let mut max_dark_run = 0usize;
    let mut bright_run = 0usize;
    let mut dark_run = 0usize;
    let mut contrast = 0.0f32;
    // Circle walked twice to handle runs wrapping the seam.
    for i in 0..FAST_CIRCLE.len() * 2 {
        let (dx, dy) = FAST_CIRCLE[i % FAST_CIRCLE.len()];
        let p = image.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32)[0];
        if i < FAST_CIRCLE.len() {
            contrast += (p as f32 - center as f32).abs();
        }
        if p > bright {
            bright_run += 1;
            dark_run = 0;
            max_bright_run = max_bright_run.max(bright_run);
        } else if p < dark {
            dark_run += 1;
            bright_run = 0;
            max_dark_run = max_dark_run.max(dark_run);
        } else {
            bright_run = 0;
            dark_run = 0;
        }
    }
    if max_bright_run >= arc || max_dark_run >= arc {
        Some(contrast)
    } else {
        None
    }
}

/// Structure-tensor corners: Harris score or the Shi-Tomasi min eigenvalue.
fn corner_keypoints(image: &GrayImage, harris: bool) -> Vec<Keypoint> {
    let (width, height) = (image.width() as i32, image.height() as i32);
    if width < 8 || height < 8 {
        return Vec::new();
    }
    let px = |x: i32, y: i32| image.get_pixel(x as u32, y as u32)[0] as f32;
    let raw: Vec<Keypoint> = (2..height - 2)
        .into_par_iter()
        .flat_map_iter(|y| {
            let mut row = Vec::new();
            for x in 2..width - 2 {
                let mut sxx = 0.0f32;
                let mut syy = 0.0f32;
                let mut sxy = 0.0f32;
                for wy in -1..=1 {
                    for wx in -1..=1 {
                        let gx = (px(x + wx + 1, y + wy) - px(x + wx - 1, y + wy)) * 0.5;
                        let gy = (px(x + wx, y + wy + 1) - px(x + wx, y + wy - 1)) * 0.5;
                        sxx += gx * gx;
                        syy += gy * gy;
                        sxy += gx * gy;
                    }
                }
                let response = if harris {
                    let det = sxx * syy - sxy * sxy;
                    let trace = sxx + syy;
                    det - 0.04 * trace * trace
                } else {
                    let half_trace = 0.5 * (sxx + syy);
                    let d = (0.25 * (sxx - syy) * (sxx - syy) + sxy * sxy).sqrt();
                    half_trace - d
                };
                if response > 200.0 {
                    row.push(Keypoint {
                        x: x as f32,
                        y: y as f32,
                        size: 7.0,
                        angle: 0.0,
                        response,
                        octave: 0,
                    });
                }
            }
            row
        })
        .collect();
    grid_nms(raw, 5.0)
}

/// Difference-of-Gaussian blob extrema between sigma and 1.6*sigma blurs.
fn dog_keypoints(image: &GrayImage, sigma: f32) -> Vec<Keypoint> {
    let (width, height) = (image.width(), image.height());
    if width < 16 || height < 16 {
        return Vec::new();
    }
    let g1 = imageops::blur(image, sigma);
    let g2 = imageops::blur(image, sigma * 1.6);
    let dog = |x: u32, y: u32| g1.get_pixel(x, y)[0] as f32 - g2.get_pixel(x, y)[0] as f32;
    let raw: Vec<Keypoint> = (2..height - 2)
        .into_par_iter()
        .flat_map_iter(|y| {
            let mut row = Vec::new();
            for x in 2..width - 2 {
                let v = dog(x, y);
                if v.abs() < 4.0 {
                    continue;
                }
                let mut is_max = true;
                let mut is_min = true;
                for dy in -1i32..=1 {
                    for dx in -1i32..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let n = dog((x as i32 + dx) as u32, (y as i32 + dy) as u32);
                        if n >= v {
                            is_max = false;
                        }
                        if n <= v {
                            is_min = false;
                        }
                    }
                }
                if is_max || is_min {
                    row.push(Keypoint {
                        x: x as f32,
                        y: y as f32,
                        size: sigma * 8.0,
                        angle: 0.0,
                        response: v.abs(),
                        octave: 0,
                    });
                }
            }
            row
        })
        .collect();
    grid_nms(raw, 5.0)
}

/// Center-surround blobs: inner 3x3 mean against the surrounding 9x9 ring,
/// computed over an integral image.
fn center_surround_keypoints(image: &GrayImage) -> Vec<Keypoint> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    if width < 16 || height < 16 {
        return Vec::new();
    }
    let integral = integral_image(image);
    let w1 = width + 1;
    let box_sum = |x0: usize, y0: usize, x1: usize, y1: usize| -> f32 {
        (integral[y1 * w1 + x1] + integral[y0 * w1 + x0]
            - integral[y0 * w1 + x1]
            - integral[y1 * w1 + x0]) as f32
    };
    let response_at = |x: usize, y: usize| -> f32 {
        let inner = box_sum(x - 1, y - 1, x + 2, y + 2) / 9.0;
        let outer_total = box_sum(x - 4, y - 4, x + 5, y + 5);
        let outer = (outer_total - inner * 9.0) / 72.0;
        inner - outer
    };
    let raw: Vec<Keypoint> = (5..height - 5)
        .into_par_iter()
        .flat_map_iter(|y| {
            let mut row = Vec::new();
            for x in 5..width - 5 {
                let v = response_at(x, y);
                if v.abs() < 8.0 {
                    continue;
                }
                let mut extremum = true;
                for dy in -1i32..=1 {
                    for dx in -1i32..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let n = response_at((x as i32 + dx) as usize, (y as i32 + dy) as usize);
                        if n.abs() >= v.abs() {
                            extremum = false;
                        }
                    }
                }
                if extremum {
                    row.push(Keypoint {
                        x: x as f32,
                        y: y as f32,
                        size: 9.0,
                        angle: 0.0,
                        response: v.abs(),
                        octave: 0,
                    });
                }
            }
            row
        })
        .collect();
    grid_nms(raw, 7.0)
}

/// Simplified extremal-region detector: connected components of the dark and
/// bright threshold sets, keypoint at the centroid of each stable-sized one.
fn extremal_region_keypoints(image: &GrayImage) -> Vec<Keypoint> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    if width < 16 || height < 16 {
        return Vec::new();
    }
    let max_area = (width * height) / 50;
    let min_area = 20;
    let mut out = Vec::new();
    for (threshold, dark) in [(64u8, true), (128, true), (128, false), (192, false)] {
        let mask: Vec<bool> = image
            .pixels()
            .map(|p| if dark { p[0] < threshold } else { p[0] >= threshold })
            .collect();
        let mut visited = vec![false; mask.len()];
        let mut stack = Vec::new();
        for start in 0..mask.len() {
            if !mask[start] || visited[start] {
                continue;
            }
            visited[start] = true;
            stack.push(start);
            let mut area = 0usize;
            let mut sum_x = 0u64;
            let mut sum_y = 0u64;
            while let Some(idx) = stack.pop() {
                area += 1;
                let x = idx % width;
                let y = idx / width;
                sum_x += x as u64;
                sum_y += y as u64;
                if x > 0 && mask[idx - 1] && !visited[idx - 1] {
                    visited[idx - 1] = true;
                    stack.push(idx - 1);
                }
                if x + 1 < width && mask[idx + 1] && !visited[idx + 1] {
                    visited[idx + 1] = true;
                    stack.push(idx + 1);
                }
                if y > 0 && mask[idx - width] && !visited[idx - width] {
                    visited[idx - width] = true;
                    stack.push(idx - width);
                }
                if y + 1 < height && mask[idx + width] && !visited[idx + width] {
                    visited[idx + width] = true;
                    stack.push(idx + width);
                }
            }
            if area >= min_area && area <= max_area {
                out.push(Keypoint {
                    x: sum_x as f32 / area as f32,
                    y: sum_y as f32 / area as f32,
                    size: (area as f32).sqrt(),
                    angle: 0.0,
                    response: area as f32,
                    octave: 0,
                });
            }
        }
    }
    grid_nms(out, 7.0)
}

fn integral_image(image: &GrayImage) -> Vec<u64> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let w1 = width + 1;
    let mut integral = vec![0u64; w1 * (height + 1)];
    for y in 0..height {
        let mut row_sum = 0u64;
        for x in 0..width {
            row_sum += image.get_pixel(x as u32, y as u32)[0] as u64;
            integral[(y + 1) * w1 + x + 1] = integral[y * w1 + x + 1] + row_sum;
        }
    }
    integral
}

/// Intensity-centroid orientation over a circular patch.
pub fn intensity_centroid_angle(image: &GrayImage, x: i32, y: i32, radius: i32) -> f32 {
    let mut m01 = 0.0f32;
    let mut m10 = 0.0f32;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let px = x + dx;
            let py = y + dy;
            if px < 0 || py < 0 || px >= image.width() as i32 || py >= image.height() as i32 {
                continue;
            }
            let intensity = image.get_pixel(px as u32, py as u32)[0] as f32;
            m10 += intensity * dx as f32;
            m01 += intensity * dy as f32;
        }
    }
    m01.atan2(m10)
}

/// Grid-bucketed non-maximum suppression: strongest response claims its cell
/// and the 3x3 neighborhood around it.
fn grid_nms(mut keypoints: Vec<Keypoint>, radius: f32) -> Vec<Keypoint> {
    if keypoints.is_empty() {
        return keypoints;
    }
    keypoints.sort_by(|a, b| {
        b.response
            .partial_cmp(&a.response)
            .unwrap_or(Ordering::Equal)
    });
    let mut claimed = HashSet::new();
    let mut selected = Vec::new();
    for kp in keypoints {
        let gx = (kp.x / radius) as i32;
        let gy = (kp.y / radius) as i32;
        let mut free = true;
        'scan: for dy in -1..=1 {
            for dx in -1..=1 {
                if claimed.contains(&(gx + dx, gy + dy)) {
                    free = false;
                    break 'scan;
                }
            }
        }
        if free {
            claimed.insert((gx, gy));
            selected.push(kp);
        }
    }
    selected
}

fn retain_best(mut keypoints: Vec<Keypoint>, max: usize) -> Vec<Keypoint> {
    keypoints.sort_by(|a, b| {
        b.response
            .partial_cmp(&a.response)
            .unwrap_or(Ordering::Equal)
    });
    keypoints.truncate(max);
    keypoints
}
